//! Slash commands a client can issue instead of chatting.

/// Lines starting with this character are commands and are never broadcast.
pub const COMMAND_PREFIX: char = '/';

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/help` - list available commands
    Help,
    /// `/users` - list connected users
    Users,
    /// `/quit` - say goodbye and disconnect
    Quit,
    /// `/time` - show the server time
    Time,
    /// Anything else; holds the lowercased command token
    Unknown(String),
}

impl Command {
    /// Parse a line as a command.
    ///
    /// Returns `None` when the line is a chat line. Only the first
    /// whitespace-separated token is considered and it is matched
    /// case-insensitively; arguments are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        if !line.starts_with(COMMAND_PREFIX) {
            return None;
        }

        let token = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();

        let command = match token.as_str() {
            "/help" => Self::Help,
            "/users" => Self::Users,
            "/quit" => Self::Quit,
            "/time" => Self::Time,
            _ => Self::Unknown(token),
        };
        Some(command)
    }
}
