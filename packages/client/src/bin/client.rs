//! Simple command-line chat client.
//!
//! Connects to the chat server, prints every line it receives, and sends every
//! line typed on stdin. Type `quit` to exit.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin parlor-client -- --username alice
//! cargo run --bin parlor-client -- --host 10.0.0.5 --port 12345
//! ```

use clap::Parser;

use parlor_client::session::run_client_session;
use parlor_shared::logger::setup_logger;

const DEFAULT_PORT: u16 = 12345;

#[derive(Parser, Debug)]
#[command(name = "parlor-client")]
#[command(about = "Command-line client for the Parlor chat relay", long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Username to send; when omitted, the first typed line is used
    #[arg(short = 'u', long)]
    username: Option<String>,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    // Run the client
    if let Err(e) = run_client_session(&addr, args.username).await {
        tracing::error!("Client error: {}", e);
        std::process::exit(1);
    }
}
