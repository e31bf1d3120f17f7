//! Listener: accept loop, admission control, and shutdown coordination.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parlor_shared::time::{Clock, SystemClock};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    domain::notice,
    infrastructure::{Connection, SessionRegistry},
};

use super::session::Session;

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound; the server does not start
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line-oriented chat server
///
/// # Example
///
/// ```no_run
/// # async fn example() -> Result<(), parlor_server::ui::ServerError> {
/// use parlor_server::{config::ServerConfig, ui::Server};
/// use tokio_util::sync::CancellationToken;
///
/// let server = Server::bind(ServerConfig::default()).await?;
/// let shutdown = CancellationToken::new();
/// server.run(shutdown).await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
    /// Parent of every connection's token; cancelled once shutdown has
    /// notified the active sessions
    sessions_token: CancellationToken,
}

impl Server {
    /// Bind the listening socket using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address is unavailable.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Bind the listening socket with a custom time source.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address is unavailable.
    pub async fn bind_with_clock(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let registry = Arc::new(SessionRegistry::new(config.max_clients));

        Ok(Self {
            listener,
            config,
            registry,
            clock,
            sessions_token: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept clients until `shutdown` is cancelled, then shut down.
    ///
    /// Cancelling the token more than once, or while an accept is in
    /// progress, is fine: the loop observes it at its next suspension point.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Chat server listening on {}", addr),
            Err(e) => tracing::warn!("Chat server listening on unknown address: {}", e),
        }
        tracing::info!("Maximum clients: {}", self.config.max_clients);
        tracing::info!("Press Ctrl+C to shutdown gracefully");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        tracing::warn!("Session task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer, &mut sessions),
                    Err(e) => {
                        tracing::error!("Error accepting client connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        self.shutdown(sessions).await;
    }

    /// Start a session for `stream`, or close it at once if at capacity.
    fn admit(&self, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        let Some(admission) = self.registry.try_admit() else {
            tracing::info!("Maximum clients reached. Rejecting connection from: {}", peer);
            drop(stream);
            return;
        };

        let connection = Connection::new(stream, peer.to_string(), self.sessions_token.child_token());
        let session = Session::new(connection, &self.registry, self.clock.clone(), admission);
        sessions.spawn(session.run());
        tracing::info!("New client connected from: {}", peer);
    }

    /// Notify, disconnect and reap every session within `shutdown_grace`.
    ///
    /// The notice fan-out and the wait for session tasks share one deadline.
    /// A peer that stopped reading can stall the notice; it is abandoned at
    /// the deadline and the stragglers are aborted.
    async fn shutdown(self, mut sessions: JoinSet<()>) {
        tracing::info!("Shutting down server...");
        let grace = self.config.shutdown_grace;
        let deadline = Instant::now() + grace;

        let notified =
            tokio::time::timeout_at(deadline, self.registry.broadcast_to_all(notice::SHUTDOWN))
                .await;
        if notified.is_err() {
            tracing::warn!(
                "Shutdown notice not delivered to every client within {:?}",
                grace
            );
        }

        let drained = self.registry.drain().await;
        tracing::info!("Disconnecting {} active sessions", drained.len());
        drop(drained);
        self.sessions_token.cancel();

        let finished = tokio::time::timeout_at(deadline, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            tracing::warn!(
                "{} sessions still running after {:?}; aborting them",
                sessions.len(),
                grace
            );
            sessions.shutdown().await;
        }

        drop(self.listener);
        tracing::info!("Server shutdown complete");
    }
}
