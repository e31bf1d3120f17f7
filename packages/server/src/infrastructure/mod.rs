//! Infrastructure layer: the line-framed transport and the in-memory session
//! registry.

pub mod connection;
pub mod registry;

pub use connection::Connection;
pub use registry::{Admission, SessionRegistry};
