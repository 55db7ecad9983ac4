//! Offline-tolerant optimistic synchronization for owner-scoped record collections.
//!
//! The pieces, bottom-up:
//! - [`connectivity`]: one authoritative online/offline/reconnecting state
//! - [`cache`]: owner-scoped snapshots with connectivity-dependent lifetimes
//! - [`retry`]: bounded backoff for transient remote failures
//! - [`store`]: the synchronized collection with optimistic mutations and rollback

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod record;
pub mod retry;
pub mod session;
pub mod store;

pub use error::{ErrorCode, GatewayError, SyncError};
pub use record::{Payload, Record, RecordStatus};
pub use store::{RecordEvent, SearchOutcome, SyncedCollectionStore};
