//! Dual-TTL thinking-signature cache, logic only.
//!
//! Thinking-enabled Claude models reject resubmitted thought blocks unless
//! each carries the opaque signature the upstream issued with it. Hosts
//! routinely strip or truncate those signatures between turns, so the broker
//! remembers `(session key, verbatim thinking text) → signature` and restores
//! them before sending.
//!
//! This crate holds the pure pieces: key construction, the in-memory tier and
//! the disk-snapshot merge semantics. File IO, flush timers and locking live
//! in the broker crate.

mod entry;
mod key;
mod store;

pub use entry::{LastThinking, SignatureCacheEntry};
pub use key::{conversation_key, entry_key, session_key, text_fingerprint};
pub use store::{CacheStatistics, DiskSnapshot, SignatureStore};

/// Signatures below this length are upstream placeholders, never worth
/// caching.
pub const MIN_SIGNATURE_LEN: usize = 50;
