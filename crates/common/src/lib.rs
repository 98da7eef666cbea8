//! Shared building blocks for the identity pool workspace

pub mod clock;
mod error;
mod secret;
pub mod telemetry;

pub use clock::{Clock, SharedClock, TokioClock};
pub use error::{Error, Result};
pub use secret::Secret;
