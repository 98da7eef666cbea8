//! Pool metrics
//!
//! - `pool_acquire_total` (counter): labels `operation`, `result`
//! - `pool_acquire_wait_seconds` (histogram): label `operation`
//! - `pool_release_total` (counter): labels `operation`, `outcome`
//! - `pool_demotions_total` (counter): label `reason`
//! - `pool_refresh_total` (counter): label `result`
//!
//! Without an installed recorder every call is a no-op.

pub fn record_acquire(operation: &str, result: &'static str) {
    metrics::counter!("pool_acquire_total", "operation" => operation.to_string(), "result" => result)
        .increment(1);
}

pub fn record_acquire_wait(operation: &str, wait_secs: f64) {
    metrics::histogram!("pool_acquire_wait_seconds", "operation" => operation.to_string())
        .record(wait_secs);
}

pub fn record_release(operation: &str, outcome: &'static str) {
    metrics::counter!("pool_release_total", "operation" => operation.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_demotion(reason: &'static str) {
    metrics::counter!("pool_demotions_total", "reason" => reason).increment(1);
}

pub fn record_refresh(result: &'static str) {
    metrics::counter!("pool_refresh_total", "result" => result).increment(1);
}
