//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! IpGuard - IP Firewall Engine for HTTP-Facing Applications
//!
//! Tracks per-client-IP behavior over rolling 60s windows and denies further
//! requests from IPs that breach configured thresholds or match known-malicious
//! payload patterns, plus permanent manual allow/deny lists.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use ipguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Firewall`] - Main controller; one `handle_request` / `handle_response`
//!   pair per HTTP exchange
//! - [`FirewallConfig`] - Static configuration (thresholds, lists, patterns)
//! - [`Decision`] - Allow/block outcome for a request
//! - [`IpGuardError`] - Error types
//!
//! ## Components
//!
//! Each building block is usable standalone and takes its [`StateStore`]
//! explicitly, so backends are swappable (file for multi-process sharing,
//! memory for tests, a networked KV store for multi-host deployments):
//!
//! - [`ClientIpResolver`] - effective client IP behind trusted proxies
//! - [`IpListMatcher`] - literal/CIDR/wildcard list membership
//! - [`MetricsTracker`] - per-IP tumbling-window counters
//! - [`RuleEngine`] - threshold and payload-pattern evaluation
//! - [`BlockRegistry`] - authoritative block CRUD with expiry and
//!   allow-list precedence
//!
//! # Example
//!
//! ```rust
//! use ipguard::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStateStore::new());
//!     let firewall = Firewall::new(FirewallConfig::default(), store, None).unwrap();
//!
//!     let ctx = RequestContext::new("203.0.113.5").with_uri("/index.html");
//!     let decision = firewall.handle_request(&ctx).await;
//!     assert_eq!(decision, Decision::Allowed);
//! }
//! ```
//!
//! # Concurrency Model
//!
//! The engine starts no internal concurrency. Writers serialize full
//! read-modify-write cycles through an exclusive lock; reads are unlocked so
//! the hot `is_blocked` path never blocks. Per-IP counters are deliberately
//! not atomic across processes - thresholds only need approximate
//! enforcement, and a rare lost increment is preferred over request-path
//! latency.

pub mod config;
pub mod constants;
pub mod error;
pub mod firewall;
pub mod matchers;
pub mod metrics;
pub mod prelude;
pub mod registry;
pub mod rules;
pub mod state;

// 重新导出常用类型
pub use config::{FirewallConfig, RuleDefaults, RuleSettings};
pub use error::{Decision, IpGuardError, StorageError};
pub use firewall::Firewall;
pub use matchers::{ClientIpResolver, IpListMatcher, IpRange, RequestContext};
pub use metrics::MetricsTracker;
pub use registry::{BlockEvent, BlockRegistry, NotificationSink, TracingSink};
pub use rules::{merge_overrides, Breach, RuleEngine, RuleKind};
pub use state::{
    BlockEntry, BlockSource, FileStateStore, MemoryStateStore, MetricsWindow, PersistedState,
    StateStore,
};
