//! Dispatch client over the identity pool
//!
//! Executes upstream requests on leased identities and turns each response
//! into a pool outcome through an ordered [`ClassificationTable`]:
//!
//! - success keeps the identity for the next call
//! - rate limits park it until the upstream reset and retry elsewhere
//! - bans and expired credentials demote it (or force a refresh)
//! - transport errors and unexpected responses retry in place, then park it
//! - abort signals end the request without touching another identity
//!
//! [`Settings`] loads the `[store]`, `[pool]` and `[dispatch]` sections from
//! one TOML file.

pub mod classify;
pub mod client;
pub mod error;
pub mod metrics;
pub mod settings;
pub mod transport;

pub use classify::{ClassificationTable, Verdict, VerdictKind, default_table};
pub use client::{DispatchClient, Dispatcher};
pub use error::{Error, Result};
pub use settings::{DispatchConfig, Settings};
pub use transport::{
    HttpTransport, Session, SessionLimiter, Transport, TransportError, UpstreamRequest,
    UpstreamResponse,
};
