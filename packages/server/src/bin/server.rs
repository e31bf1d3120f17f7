//! Line-oriented chat relay server.
//!
//! Accepts TCP clients, asks each for a username, and rebroadcasts every chat
//! line to all other connected clients.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin parlor-server
//! cargo run --bin parlor-server -- --host 0.0.0.0 --port 3000 --max-clients 10
//! ```

use clap::Parser;
use parlor_server::{
    config::{DEFAULT_MAX_CLIENTS, DEFAULT_PORT, ServerConfig},
    ui::{Server, shutdown_signal},
};
use parlor_shared::logger::setup_logger;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "parlor-server")]
#[command(about = "Line-oriented chat relay server", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connections beyond this many are closed immediately
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "debug");

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_clients: args.max_clients,
        ..ServerConfig::default()
    };

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Server error: {}", e);
            std::process::exit(1);
        }
    };

    // Cancelled once, when the process is asked to stop
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.run(shutdown).await;
}
