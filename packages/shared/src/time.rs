//! Time-related utilities with clock abstraction for testability.

use chrono::{DateTime, Local};

/// Clock trait for dependency injection and testing
pub trait Clock: Send + Sync {
    /// Get the current local time
    fn now(&self) -> DateTime<Local>;
}

/// System clock implementation (uses actual system time)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Fixed clock implementation for testing (returns a fixed time)
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    fixed_time: DateTime<Local>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    pub fn new(fixed_time: DateTime<Local>) -> Self {
        Self { fixed_time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.fixed_time
    }
}

/// Format a time as `HH:MM` (24-hour clock), used as the chat line prefix.
pub fn format_clock_time(time: &DateTime<Local>) -> String {
    time.format("%H:%M").to_string()
}

/// Format a time for the `/time` reply, e.g. `2024-01-01 09:05:30 +09:00`.
pub fn format_server_time(time: &DateTime<Local>) -> String {
    time.format("%Y-%m-%d %H:%M:%S %:z").to_string()
}
