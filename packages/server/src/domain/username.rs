//! Username value object.

use std::fmt;

use parlor_shared::time::Clock;

/// Requested usernames are cut to this many characters before filtering.
pub const MAX_USERNAME_CHARS: usize = 20;

const FALLBACK_PREFIX: &str = "User";

/// A display name that is never empty and only contains `[A-Za-z0-9_-]`.
///
/// The only constructor is [`Username::normalize`], so an `Active` session
/// can never hold an empty name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    /// Normalize a requested username.
    ///
    /// Surrounding whitespace is trimmed, the result is truncated to
    /// [`MAX_USERNAME_CHARS`] characters, and every character outside
    /// `[A-Za-z0-9_-]` is dropped. If nothing survives, a fallback of `User`
    /// followed by the current epoch milliseconds modulo 1000 is used.
    pub fn normalize(requested: &str, clock: &dyn Clock) -> Self {
        let cleaned: String = requested
            .trim()
            .chars()
            .take(MAX_USERNAME_CHARS)
            .filter(|c| is_allowed(*c))
            .collect();

        if cleaned.is_empty() {
            let suffix = clock.now().timestamp_millis().rem_euclid(1000);
            Self(format!("{FALLBACK_PREFIX}{suffix}"))
        } else {
            Self(cleaned)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
