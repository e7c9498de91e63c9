//! Client counters
//!
//! - `dpop_client_requests_total` (counter): label `outcome`
//! - `dpop_client_refresh_total` (counter): label `result`
//! - `dpop_client_nonce_rotations_total` (counter)
//!
//! Calls are no-ops until the binary installs a recorder.

/// Record the final outcome of one `perform` call.
pub(crate) fn record_request(outcome: &'static str) {
    metrics::counter!("dpop_client_requests_total", "outcome" => outcome).increment(1);
}

/// Record a refresh decision: `success`, `denied`, `error`, or `skipped`.
pub(crate) fn record_refresh(result: &'static str) {
    metrics::counter!("dpop_client_refresh_total", "result" => result).increment(1);
}

pub(crate) fn record_nonce_rotation() {
    metrics::counter!("dpop_client_nonce_rotations_total").increment(1);
}
