//! Durable lease store for pooled identities
//!
//! Persists identity records in SQLite and expresses every mutation as a
//! single atomic conditional update, so several processes can share one
//! database file. A tokio `Mutex` serializes access within a process; SQLite
//! "database is busy" contention from other processes is retried with
//! randomized backoff.
//!
//! Record lifecycle:
//! 1. `add_identity` stores validated credential material
//! 2. `reserve` picks a random eligible identity for an operation, marks it
//!    in use and stamps the operation lock
//! 3. `renew` re-stamps a lease that is still held
//! 4. `release` unlocks, locks until a timestamp, or deactivates
//! 5. `purge_inactive` / `delete` remove records administratively

pub mod config;
pub mod error;
pub mod identity;
pub mod schema;
pub mod store;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use identity::{
    CredentialMaterial, Health, Identity, NewIdentity, Operation, Reservation, Selector, Stats,
};
pub use store::{LeaseStore, ReleaseAction, RenewOutcome};
