//! Dispatch metrics
//!
//! - `dispatch_verdict_total` (counter): labels `operation`, `verdict`
//! - `dispatch_transport_errors_total` (counter): labels `operation`, `kind`

pub fn record_verdict(operation: &str, verdict: &'static str) {
    metrics::counter!("dispatch_verdict_total", "operation" => operation.to_string(), "verdict" => verdict)
        .increment(1);
}

pub fn record_transport_error(operation: &str, kind: &'static str) {
    metrics::counter!("dispatch_transport_errors_total", "operation" => operation.to_string(), "kind" => kind)
        .increment(1);
}
