//! Member trait definition.
//!
//! The registry fans messages out to `Member`s without knowing how they reach
//! the wire. `Session` is the production implementation; tests use the
//! generated `MockMember`.

use async_trait::async_trait;

use super::{ConnectionError, SessionId, Username};

/// A registered, addressable chat participant.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Member: Send + Sync {
    /// Registry key of this member
    fn id(&self) -> SessionId;

    /// Assigned username, `None` until the handshake completes
    fn username(&self) -> Option<Username>;

    /// Whether the member can still receive lines
    fn is_connected(&self) -> bool;

    /// Deliver one line to this member.
    ///
    /// An error means the member is gone; the caller drops it from the
    /// registry.
    async fn deliver(&self, line: &str) -> Result<(), ConnectionError>;
}
