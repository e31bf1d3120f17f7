//! Client session: prints every server line and forwards typed lines.

use rustyline::{DefaultEditor, error::ReadlineError};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};

use crate::error::ClientError;

/// Typing this (alone on a line) closes the client.
pub const EXIT_COMMAND: &str = "quit";

/// Whether a typed line should end the session instead of being sent
pub fn is_exit_command(line: &str) -> bool {
    line.trim() == EXIT_COMMAND
}

/// Run one client session against the server at `addr`.
///
/// If `username` is given it is sent as the answer to the server's username
/// prompt; otherwise the first typed line is.
///
/// # Errors
///
/// Returns [`ClientError::Connect`] if the server is unreachable and
/// [`ClientError::Io`] if sending fails.
pub async fn run_client_session(addr: &str, username: Option<String>) -> Result<(), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    tracing::info!("Connected to chat server at {}", addr);
    println!("Connected! Type your messages (or '{EXIT_COMMAND}' to exit):");

    let (read_half, mut write_half) = stream.into_split();

    // Spawn a task to print incoming lines
    let mut read_task = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => println!("{line}"),
                Ok(None) => {
                    tracing::info!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Connection lost: {}", e);
                    break;
                }
            }
        }
    });

    // Create channel for rustyline input
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();

    // Spawn a blocking thread for rustyline (synchronous readline)
    let _readline_handle = std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {}", e);
                return;
            }
        };

        loop {
            match rl.readline("") {
                Ok(line) => {
                    if is_exit_command(&line) {
                        break;
                    }
                    rl.add_history_entry(line.as_str()).ok();
                    if input_tx.send(line).is_err() {
                        // Channel closed, exit thread
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    tracing::error!("Readline error: {}", err);
                    break;
                }
            }
        }
    });

    // Spawn a task to forward typed lines to the server
    let mut write_task = tokio::spawn(async move {
        if let Some(username) = username {
            write_half
                .write_all(format!("{username}\n").as_bytes())
                .await?;
        }
        while let Some(line) = input_rx.recv().await {
            write_half.write_all(format!("{line}\n").as_bytes()).await?;
        }
        write_half.shutdown().await?;
        Ok::<(), std::io::Error>(())
    });

    // If any one of the tasks completes, abort the other
    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        write_result = &mut write_task => {
            read_task.abort();
            if let Ok(Err(e)) = write_result {
                return Err(ClientError::Io(e));
            }
        }
    }

    Ok(())
}
