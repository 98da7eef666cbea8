//! Wall-clock seam
//!
//! Every lock, lease expiry and "last used" stamp is a unix timestamp in
//! milliseconds. Components read time through [`Clock`] instead of calling
//! `SystemTime::now()` directly so tests can drive time with tokio's paused
//! clock.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Shared, dynamically dispatched clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock anchored once to `SystemTime` and advanced by tokio's monotonic
/// clock.
///
/// Under `tokio::time::pause()` the reported time moves only when tokio time
/// advances, which keeps lock arithmetic and sleeps in agreement.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_millis: i64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        let anchor_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self {
            anchor_millis,
            anchor: tokio::time::Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as i64
    }
}
