//! Domain error types.

use thiserror::Error;

/// Transport-level failure on a single connection.
///
/// Every variant means "this peer is gone"; callers tear down the affected
/// session and nothing else.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was already closed (by either side or by cancellation)
    #[error("connection is closed")]
    Closed,

    /// The underlying stream failed
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
