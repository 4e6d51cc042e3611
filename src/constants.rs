//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for IpGuard.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

/// Length of the metrics counting window in seconds (1 minute).
///
/// Per-IP counters accumulate inside one window and are reset in bulk once
/// the window has fully elapsed (tumbling window semantics).
pub const WINDOW_SECS: i64 = 60;

/// Default request-per-minute threshold.
///
/// An IP exceeding this many requests inside one window is blocked by the
/// `requests_per_minute` rule.
pub const DEFAULT_REQUESTS_PER_MINUTE: u64 = 100;

/// Default 404-per-minute threshold for the `not_found_per_minute` rule.
pub const DEFAULT_NOT_FOUND_PER_MINUTE: u64 = 10;

/// Default 401/403-per-minute threshold for the `unauthorized_per_minute` rule.
pub const DEFAULT_UNAUTHORIZED_PER_MINUTE: u64 = 5;

/// Default block duration in seconds (1 hour).
pub const DEFAULT_BLOCK_TTL_SECS: i64 = 3600;

/// Minimum block duration in seconds.
///
/// Applied as a floor when creating a block so a misconfigured TTL can never
/// produce an instantly-expiring entry.
pub const MIN_BLOCK_TTL_SECS: i64 = 60;

/// Default HTTP status code returned for blocked requests.
pub const DEFAULT_BLOCKED_STATUS: u16 = 403;

/// Default location of the shared state file.
pub const DEFAULT_STATE_PATH: &str = "runtime/ipguard/state.json";

/// Fallback client IP when no syntactically valid address can be derived.
pub const UNKNOWN_IP: &str = "0.0.0.0";

// ============================================================================
// State file locking
// ============================================================================

/// How many times a writer attempts to acquire the state file lock.
///
/// When all attempts fail the write is skipped rather than retried further;
/// request-path latency wins over a single lost metrics update.
pub const LOCK_RETRY_ATTEMPTS: u32 = 5;

/// Delay between lock acquisition attempts, in milliseconds.
pub const LOCK_RETRY_DELAY_MS: u64 = 20;

/// Age in seconds after which a leftover lock file from a crashed writer is
/// considered stale and removed.
pub const LOCK_STALE_SECS: u64 = 5;
