//! Identity pool manager
//!
//! Leases credentialed identities to concurrent callers on top of a shared
//! [`lease_store::LeaseStore`]. Each operation has its own cooldown policy:
//! a fixed lock, or a load-spreading lock drawn from a normal distribution.
//! Identities that cross a randomized usage threshold are revalidated through
//! an installed [`RefreshTrigger`] before they are handed out.
//!
//! Identity lifecycle:
//! 1. `add_identity` / `import_lines` store it, active iff the activation keys
//!    are present
//! 2. `acquire` reserves it for an operation and stamps the lock
//! 3. `release(Success)` unlocks (pacing operations keep their lock)
//! 4. `release(Throttled)` locks it until the upstream reset or a policy window
//! 5. `release(Banned | AuthExpired)` or a failed refresh deactivates it

pub mod config;
pub mod error;
pub mod import;
pub mod jitter;
pub mod metrics;
pub mod pool;
pub mod refresh;

pub use config::{AdmissionMode, LockPolicy, OperationPolicy, PoolConfig};
pub use error::{Error, Result};
pub use import::ImportReport;
pub use jitter::{FixedJitter, Jitter, SharedJitter, ThreadRngJitter};
pub use pool::{IdentityInfo, Lease, Outcome, Pool};
pub use refresh::{RefreshError, RefreshFuture, RefreshTrigger};
