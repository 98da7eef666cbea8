//! Error types for dispatched requests

use crate::transport::{TransportError, UpstreamResponse};

/// Errors returned by [`DispatchClient`](crate::DispatchClient).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upstream signalled a failure that retrying elsewhere cannot fix.
    /// The response is kept for the caller to inspect.
    #[error("request aborted: {reason}")]
    Aborted {
        reason: String,
        response: Box<UpstreamResponse>,
    },

    /// A session could not be opened for the leased identity.
    #[error("cannot open session for {handle}: {source}")]
    Session {
        handle: String,
        #[source]
        source: TransportError,
    },

    /// The request could not be sent on any identity. The lease is kept.
    #[error(transparent)]
    Transport(TransportError),

    #[error("session limiter closed")]
    LimiterClosed,

    #[error(transparent)]
    Pool(#[from] identity_pool::Error),
}

/// Result alias for dispatched requests.
pub type Result<T> = std::result::Result<T, Error>;
