//! Transient-failure heuristic
//!
//! Failures whose message mentions a timeout or a connection problem are
//! retried by the dispatcher; everything else is terminal.

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "temporarily unavailable",
];

/// Whether an error message looks like a transient infrastructure failure
pub fn is_transient(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}
