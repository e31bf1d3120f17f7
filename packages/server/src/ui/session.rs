//! Per-client session: username handshake, message loop, commands, teardown.

use std::{
    ops::ControlFlow,
    sync::{Arc, OnceLock, Weak},
};

use async_trait::async_trait;
use parlor_shared::time::{Clock, format_clock_time, format_server_time};
use tokio::sync::watch;

use crate::{
    domain::{Command, ConnectionError, Member, SessionId, Username, notice},
    infrastructure::{Admission, Connection, SessionRegistry},
};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the client to send its username
    Handshaking,
    /// Registered and relaying chat lines
    Active,
    /// Torn down; terminal
    Disconnected,
}

/// One connected client.
///
/// The session owns its [`Connection`] and only looks the registry up through
/// a weak reference; the registry holds the strong one while the session is
/// `Active`.
pub struct Session {
    id: SessionId,
    connection: Connection,
    registry: Weak<SessionRegistry>,
    clock: Arc<dyn Clock>,
    username: OnceLock<Username>,
    state: watch::Sender<SessionState>,
    _admission: Admission,
}

impl Session {
    /// Create a session in the `Handshaking` state.
    ///
    /// # Arguments
    ///
    /// * `connection` - The accepted connection, owned by this session
    /// * `registry` - Registry to join once the handshake completes
    /// * `clock` - Time source for chat timestamps, `/time` and fallback names
    /// * `admission` - Capacity slot held for the lifetime of the session
    pub fn new(
        connection: Connection,
        registry: &Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
        admission: Admission,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::generate(),
            connection,
            registry: Arc::downgrade(registry),
            clock,
            username: OnceLock::new(),
            state: watch::Sender::new(SessionState::Handshaking),
            _admission: admission,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session until it disconnects.
    pub async fn run(self: Arc<Self>) {
        tracing::debug!("Session {} started for {}", self.id, self.connection.peer());

        if let Some(username) = self.negotiate_username().await
            && self.activate(username).await
        {
            self.message_loop().await;
        }

        self.disconnect().await;
    }

    /// Tear the session down.
    ///
    /// Safe to call from several triggers at once (read failure, write
    /// failure, `/quit`, shutdown): only the first call closes the
    /// connection and removes the session from the registry.
    pub async fn disconnect(&self) {
        let first = self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                false
            } else {
                *state = SessionState::Disconnected;
                true
            }
        });
        if !first {
            return;
        }

        self.connection.close().await;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id).await;
        }

        match self.username.get() {
            Some(username) => tracing::info!("Client {} disconnected", username),
            None => tracing::info!(
                "Client at {} disconnected before choosing a username",
                self.connection.peer()
            ),
        }
    }

    /// Greet the client and wait for the first non-blank line.
    ///
    /// Returns `None` if the peer goes away first.
    async fn negotiate_username(&self) -> Option<Username> {
        self.reply(notice::WELCOME).await;
        self.reply(notice::USERNAME_PROMPT).await;

        loop {
            let requested = self.connection.receive().await?;
            if requested.trim().is_empty() {
                continue;
            }
            return Some(Username::normalize(&requested, self.clock.as_ref()));
        }
    }

    /// Enter `Active`: register, confirm the name, announce the join.
    ///
    /// Returns `false` if the session was torn down (or the server is going
    /// away) in the meantime.
    async fn activate(self: &Arc<Self>, username: Username) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };

        let _ = self.username.set(username.clone());
        let activated = self.state.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if !activated {
            return false;
        }

        registry.register(self.clone()).await;
        // disconnect() may have run between the transition and register()
        if self.state() == SessionState::Disconnected {
            registry.remove(&self.id).await;
            return false;
        }

        self.reply(&notice::welcome_user(&username)).await;
        self.reply(notice::READY).await;
        registry
            .broadcast_excluding(&notice::joined(&username), &self.id)
            .await;
        tracing::info!(
            "User '{}' connected from {}",
            username,
            self.connection.peer()
        );
        true
    }

    async fn message_loop(&self) {
        while let Some(line) = self.connection.receive().await {
            if line.trim().is_empty() {
                continue;
            }

            match Command::parse(&line) {
                Some(command) => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                None => self.publish(&line).await,
            }
        }
    }

    /// Broadcast a chat line to everyone but this session.
    async fn publish(&self, text: &str) {
        let (Some(registry), Some(username)) = (self.registry.upgrade(), self.username.get())
        else {
            return;
        };

        let clock_time = format_clock_time(&self.clock.now());
        let line = notice::chat_line(&clock_time, username, text);
        let delivered = registry.broadcast_excluding(&line, &self.id).await;
        tracing::info!(
            "Message from {}: {} (delivered to {})",
            username,
            text,
            delivered
        );
    }

    async fn handle_command(&self, command: Command) -> ControlFlow<()> {
        tracing::debug!("Session {} issued {:?}", self.id, command);

        match command {
            Command::Help => self.reply_all(notice::help()).await,
            Command::Users => {
                let usernames = match self.registry.upgrade() {
                    Some(registry) => registry.usernames().await,
                    None => Vec::new(),
                };
                self.reply_all(notice::users(usernames.len(), &usernames)).await;
            }
            Command::Quit => {
                if let Some(username) = self.username.get() {
                    self.reply(&notice::goodbye(username)).await;
                }
                return ControlFlow::Break(());
            }
            Command::Time => {
                let now = format_server_time(&self.clock.now());
                self.reply(&notice::server_time(&now)).await;
            }
            Command::Unknown(token) => self.reply(&notice::unknown_command(&token)).await,
        }

        ControlFlow::Continue(())
    }

    /// Send a line to this client only.
    ///
    /// A failure closes the connection, which ends the message loop on its
    /// next `receive`.
    async fn reply(&self, line: &str) {
        if let Err(e) = self.connection.send(line).await {
            tracing::debug!("Reply to session {} dropped: {}", self.id, e);
        }
    }

    async fn reply_all(&self, lines: Vec<String>) {
        for line in lines {
            self.reply(&line).await;
        }
    }
}

#[async_trait]
impl Member for Session {
    fn id(&self) -> SessionId {
        self.id
    }

    fn username(&self) -> Option<Username> {
        self.username.get().cloned()
    }

    fn is_connected(&self) -> bool {
        self.state() == SessionState::Active && self.connection.is_open()
    }

    async fn deliver(&self, line: &str) -> Result<(), ConnectionError> {
        self.connection.send(line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Local, TimeZone};
    use parlor_shared::time::FixedClock;
    use std::time::Duration;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
        task::JoinHandle,
    };
    use tokio_util::sync::CancellationToken;

    // ========================================
    // テスト作業記録
    // ========================================
    // 【何をテストするか】
    // - ハンドシェイク（ユーザー名の正規化、フォールバック、空行の無視）
    // - メッセージループ（チャットのブロードキャスト、コマンド、空行）
    // - 切断処理の冪等性（退室通知は 1 回だけ）
    // ========================================

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// The far end of a session's duplex stream, as a client would see it
    struct TestClient {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> String {
            tokio::time::timeout(TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("stream closed")
        }

        async fn recv_eof(&mut self) {
            let next = tokio::time::timeout(TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for end of stream");
            assert!(matches!(next, Ok(None)), "expected EOF, got {next:?}");
        }

        /// Send the username and consume the handshake lines
        async fn join_as(&mut self, name: &str) {
            assert_eq!(self.recv().await, notice::WELCOME);
            assert_eq!(self.recv().await, notice::USERNAME_PROMPT);
            self.send(name).await;
            self.recv().await;
            assert_eq!(self.recv().await, notice::READY);
        }
    }

    fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 1, 1, 9, 5, 30)
            .single()
            .expect("unambiguous local time")
    }

    fn spawn_session(
        registry: &Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Session>, TestClient, JoinHandle<()>) {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let connection = Connection::new(server_side, "test-peer", CancellationToken::new());
        let admission = registry.try_admit().expect("capacity available");
        let session = Session::new(connection, registry, clock, admission);
        let handle = tokio::spawn(session.clone().run());

        let (read_half, writer) = tokio::io::split(client_side);
        let client = TestClient {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        (session, client, handle)
    }

    async fn wait_for_count(registry: &SessionRegistry, expected: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while registry.count().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry never reached the expected size");
    }

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(10))
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(fixed_time()))
    }

    #[tokio::test]
    async fn test_handshake_assigns_valid_username_unchanged() {
        // テスト項目: 有効なユーザー名がそのまま割り当てられ Active になる
        // given (前提条件):
        let registry = registry();
        let (session, mut client, _handle) = spawn_session(&registry, clock());

        // when (操作):
        assert_eq!(client.recv().await, notice::WELCOME);
        assert_eq!(client.recv().await, notice::USERNAME_PROMPT);
        client.send("alice_01").await;

        // then (期待する結果):
        assert_eq!(client.recv().await, "✅ Welcome to the chat, alice_01!");
        assert_eq!(client.recv().await, notice::READY);
        wait_for_count(&registry, 1).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(Member::username(session.as_ref()).unwrap().as_str(), "alice_01");
    }

    #[tokio::test]
    async fn test_handshake_falls_back_for_unusable_username() {
        // テスト項目: 使用できる文字がないユーザー名は時刻由来の名前に置き換えられる
        // given (前提条件):
        let registry = registry();
        let clock = Arc::new(FixedClock::new(
            Local.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        ));
        let (session, mut client, _handle) = spawn_session(&registry, clock);

        // when (操作):
        client.recv().await;
        client.recv().await;
        client.send("!!! ???").await;

        // then (期待する結果):
        assert_eq!(client.recv().await, "✅ Welcome to the chat, User123!");
        wait_for_count(&registry, 1).await;
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_handshake_ignores_blank_lines() {
        // テスト項目: ハンドシェイク中の空行は無視され、最初の空でない行が名前になる
        // given (前提条件):
        let registry = registry();
        let (_session, mut client, _handle) = spawn_session(&registry, clock());

        // when (操作):
        client.recv().await;
        client.recv().await;
        client.send("").await;
        client.send("   ").await;
        client.send("bob").await;

        // then (期待する結果):
        assert_eq!(client.recv().await, "✅ Welcome to the chat, bob!");
    }

    #[tokio::test]
    async fn test_peer_closing_during_handshake_disconnects() {
        // テスト項目: ユーザー名送信前に切断されると登録されずに Disconnected になる
        // given (前提条件):
        let registry = registry();
        let (session, mut client, handle) = spawn_session(&registry, clock());
        client.recv().await;
        client.recv().await;

        // when (操作):
        drop(client);

        // then (期待する結果):
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_chat_line_is_broadcast_to_others_only() {
        // テスト項目: チャット行が整形され、送信者以外にだけ届く
        // given (前提条件):
        let registry = registry();
        let (_alice, mut alice, _h1) = spawn_session(&registry, clock());
        alice.join_as("alice").await;
        let (_bob, mut bob, _h2) = spawn_session(&registry, clock());
        bob.join_as("bob").await;
        assert_eq!(alice.recv().await, "📢 bob joined the chat");

        // when (操作):
        alice.send("hi").await;

        // then (期待する結果):
        assert_eq!(bob.recv().await, "[09:05] alice: hi");
        // alice には自分のメッセージが返らない（次に届くのは /time の応答）
        alice.send("/time").await;
        assert!(alice.recv().await.starts_with("🕐 Server time: 2024-01-01 09:05:30"));
    }

    #[tokio::test]
    async fn test_users_command_lists_count_and_names() {
        // テスト項目: /users で人数と全員の名前が返り、ブロードキャストされない
        // given (前提条件):
        let registry = registry();
        let (_alice, mut alice, _h1) = spawn_session(&registry, clock());
        alice.join_as("alice").await;
        let (_bob, mut bob, _h2) = spawn_session(&registry, clock());
        bob.join_as("bob").await;
        alice.recv().await; // bob joined

        // when (操作):
        bob.send("/users").await;

        // then (期待する結果):
        assert_eq!(bob.recv().await, "👥 Connected users (2):");
        let mut names = vec![bob.recv().await, bob.recv().await];
        names.sort();
        assert_eq!(names, vec!["  • alice", "  • bob"]);
        // コマンドは他の参加者に届かない
        alice.send("/help").await;
        assert_eq!(alice.recv().await, "📚 Available commands:");
    }

    #[tokio::test]
    async fn test_unknown_command_and_blank_lines_stay_local() {
        // テスト項目: 未知のコマンドは本人にだけ通知され、空行は無視される
        // given (前提条件):
        let registry = registry();
        let (_alice, mut alice, _h1) = spawn_session(&registry, clock());
        alice.join_as("alice").await;
        let (_bob, mut bob, _h2) = spawn_session(&registry, clock());
        bob.join_as("bob").await;
        alice.recv().await; // bob joined

        // when (操作):
        bob.send("   ").await;
        bob.send("/dance now").await;

        // then (期待する結果):
        assert_eq!(
            bob.recv().await,
            "❓ Unknown command: /dance. Type /help for available commands."
        );
        bob.send("after").await;
        assert_eq!(alice.recv().await, "[09:05] bob: after");
    }

    #[tokio::test]
    async fn test_quit_says_goodbye_and_announces_departure() {
        // テスト項目: /quit で別れの挨拶の後に切断され、残りの参加者に退室通知が届く
        // given (前提条件):
        let registry = registry();
        let (_alice, mut alice, _h1) = spawn_session(&registry, clock());
        alice.join_as("alice").await;
        let (bob_session, mut bob, bob_handle) = spawn_session(&registry, clock());
        bob.join_as("bob").await;
        alice.recv().await; // bob joined

        // when (操作):
        bob.send("/quit").await;

        // then (期待する結果):
        assert_eq!(bob.recv().await, "👋 Goodbye bob!");
        bob.recv_eof().await;
        tokio::time::timeout(TIMEOUT, bob_handle).await.unwrap().unwrap();
        assert_eq!(bob_session.state(), SessionState::Disconnected);
        assert_eq!(alice.recv().await, "📢 bob left the chat");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_stream_closing_mid_read_removes_session() {
        // テスト項目: 受信中にストリームが閉じると登録が外れ、退室通知が 1 回届く
        // given (前提条件):
        let registry = registry();
        let (_alice, mut alice, _h1) = spawn_session(&registry, clock());
        alice.join_as("alice").await;
        let (_bob, mut bob, _h2) = spawn_session(&registry, clock());
        bob.join_as("bob").await;
        alice.recv().await; // bob joined
        wait_for_count(&registry, 2).await;

        // when (操作):
        drop(bob);

        // then (期待する結果):
        assert_eq!(alice.recv().await, "📢 bob left the chat");
        wait_for_count(&registry, 1).await;
    }

    #[tokio::test]
    async fn test_disconnect_twice_removes_and_announces_once() {
        // テスト項目: 切断処理が同時に 2 回走っても登録解除と退室通知は 1 回だけ
        // given (前提条件):
        let registry = registry();
        let (_alice, mut alice, _h1) = spawn_session(&registry, clock());
        alice.join_as("alice").await;
        let (bob_session, mut bob, _h2) = spawn_session(&registry, clock());
        bob.join_as("bob").await;
        alice.recv().await; // bob joined
        wait_for_count(&registry, 2).await;

        // when (操作):
        tokio::join!(bob_session.disconnect(), bob_session.disconnect());
        bob_session.disconnect().await;

        // then (期待する結果):
        assert_eq!(alice.recv().await, "📢 bob left the chat");
        assert_eq!(registry.count().await, 1);
        // 2 回目の退室通知はない（次に届くのは /time の応答）
        alice.send("/time").await;
        assert!(alice.recv().await.starts_with("🕐 Server time:"));
    }
}
