//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from IpGuard,
//! allowing users to import them with a single `use ipguard::prelude::*;`
//! statement instead of importing each type individually.

// Core types
pub use crate::config::FirewallConfig;
pub use crate::error::{Decision, IpGuardError};
pub use crate::firewall::Firewall;

// Request representation
pub use crate::matchers::RequestContext;

// State backends
pub use crate::state::{FileStateStore, MemoryStateStore, StateStore};

// Block management
pub use crate::registry::{BlockEvent, BlockRegistry, NotificationSink};
pub use crate::state::{BlockEntry, BlockSource};
