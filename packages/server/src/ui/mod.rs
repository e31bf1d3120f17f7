//! Chat server front: the TCP listener and the per-client sessions it spawns.

mod server;
mod session;
mod signal;

pub use server::{Server, ServerError};
pub use session::{Session, SessionState};
pub use signal::shutdown_signal;
