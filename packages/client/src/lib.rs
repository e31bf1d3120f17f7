//! Command-line client for the Parlor chat relay.

pub mod error;
pub mod session;
