//! Domain layer: value objects, pure message formatting, and the `Member`
//! interface the registry fans out to.

mod command;
mod error;
mod member;
pub mod notice;
mod session_id;
mod username;

pub use command::Command;
pub use error::ConnectionError;
pub use member::Member;
#[cfg(test)]
pub use member::MockMember;
pub use session_id::SessionId;
pub use username::{MAX_USERNAME_CHARS, Username};
