//! Out-of-band credential refresh
//!
//! The pool calls the installed trigger synchronously while the identity is
//! still leased, so no other caller can pick it up mid-refresh. Triggers may
//! take minutes; the pool caps how many run at once with its own semaphore.

use std::future::Future;
use std::pin::Pin;

use lease_store::{CredentialMaterial, Identity};

/// Failure reported by a refresh trigger. The message becomes the identity's
/// recorded error when it is demoted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RefreshError(pub String);

impl RefreshError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<CredentialMaterial>, RefreshError>> + Send + 'a>>;

/// External revalidation routine.
///
/// Returns `Some(material)` to replace the stored credential, `None` to keep
/// it as is. Uses `Pin<Box<dyn Future>>` so the pool can hold
/// `Arc<dyn RefreshTrigger>`.
pub trait RefreshTrigger: Send + Sync {
    fn refresh<'a>(&'a self, identity: &'a Identity) -> RefreshFuture<'a>;
}
