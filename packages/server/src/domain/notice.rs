//! Text lines the server sends to clients.
//!
//! Pure functions without side effects, so the wording of every line the
//! protocol emits lives in one place and is easy to test.

use super::Username;

pub const WELCOME: &str = "🎉 Welcome to the Chat Server!";
pub const USERNAME_PROMPT: &str = "Please enter your username:";
pub const READY: &str = "💬 You can start chatting now. Type your messages below:";
pub const SHUTDOWN: &str = "🚨 Server is shutting down. Goodbye!";

/// Confirmation sent to a client once its username is assigned.
pub fn welcome_user(username: &Username) -> String {
    format!("✅ Welcome to the chat, {username}!")
}

pub fn joined(username: &Username) -> String {
    format!("📢 {username} joined the chat")
}

pub fn left(username: &Username) -> String {
    format!("📢 {username} left the chat")
}

pub fn goodbye(username: &Username) -> String {
    format!("👋 Goodbye {username}!")
}

/// Format a chat line as `[HH:MM] <username>: <text>`.
pub fn chat_line(clock_time: &str, username: &Username, text: &str) -> String {
    format!("[{clock_time}] {username}: {text}")
}

/// Reply to `/help`.
pub fn help() -> Vec<String> {
    [
        "📚 Available commands:",
        "  /help - Show this help message",
        "  /users - List all connected users",
        "  /quit - Leave the chat",
        "  /time - Show current server time",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Reply to `/users`: a header with the count, then one line per name.
pub fn users(count: usize, usernames: &[Username]) -> Vec<String> {
    std::iter::once(format!("👥 Connected users ({count}):"))
        .chain(usernames.iter().map(|name| format!("  • {name}")))
        .collect()
}

pub fn server_time(formatted_time: &str) -> String {
    format!("🕐 Server time: {formatted_time}")
}

pub fn unknown_command(token: &str) -> String {
    format!("❓ Unknown command: {token}. Type /help for available commands.")
}
