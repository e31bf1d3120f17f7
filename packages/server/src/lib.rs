//! Line-oriented chat relay server library.
//!
//! This library accepts concurrent TCP clients, negotiates a display name for
//! each, and rebroadcasts every chat line to all other connected clients.

// layers
pub mod domain;
pub mod infrastructure;
pub mod ui;

pub mod config;
