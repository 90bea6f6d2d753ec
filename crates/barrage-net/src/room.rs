//! Per-room connection lifecycle.
//!
//! A [`Room`] is one live connection to the barrage server for one room id:
//! dial, authenticate, log in, join the message group, then stream. State
//! changes are published through a [`watch`] channel so the session and any
//! observer can react without polling.
//!
//! A `Room` value is never repaired in place. When its connection is beyond
//! saving it emits one [`ReconnectRequest`], cancels its own scope and lets
//! the session supervisor build the next generation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use barrage_config::NetworkConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::compression;
use crate::framing::{self, EncodeError, Frame, FrameConfig, FrameError};
use crate::reconnection::{ReconnectConfig, ReconnectRequest, ReconnectState};
use crate::stt::{self, FieldMap};
use crate::token::{Clock, Token, TokenError, TokenProvider, md5_hex};

/// Identity of a live room.
pub type RoomId = u64;

/// Read half handed from [`Room::enter`] to [`Room::run`].
pub type RoomReader = Box<dyn AsyncRead + Send + Unpin>;

type RoomWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Room lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Registered, not dialled yet.
    Disconnected,
    /// Dialling the server, including retries and backoff.
    Connecting,
    /// Connected; obtaining a token and sending the login request.
    Authenticating,
    /// Logged in; waiting for the login response to join the group.
    JoiningGroup,
    /// Group joined; events are flowing.
    Streaming,
    /// The connection gave up and a replacement was requested.
    Reconnecting,
    /// Stopped by removal or session shutdown.
    Closed,
}

/// Observable room state backed by a [`watch`] channel.
///
/// Shared by every generation of a room id, so subscribers survive reconnects.
pub struct RoomStateWatch {
    tx: watch::Sender<RoomState>,
    rx: watch::Receiver<RoomState>,
}

impl Default for RoomStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStateWatch {
    /// Create a new watch initialized to [`RoomState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(RoomState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: RoomState) {
        let _ = self.tx.send(state);
    }

    /// Set the state on behalf of a room generation, unless `scope` has
    /// already been cancelled. The check and the update happen under the
    /// channel's lock, so a generation that was removed concurrently cannot
    /// overwrite the state its remover published.
    pub fn set_within(&self, state: RoomState, scope: &CancellationToken) {
        self.tx.send_if_modified(|current| {
            if scope.is_cancelled() {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> RoomState {
        *self.rx.borrow()
    }
}

/// Runtime connection settings for rooms.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Server dialled when the seed has no host.
    pub default_server: String,
    /// Port dialled when the seed has port 0.
    pub default_port: u16,
    /// Immediate dial retries before backing off.
    pub connect_retries: u32,
    /// Spacing between immediate dial retries.
    pub connect_retry_delay: Duration,
    /// Backoff between dial rounds.
    pub backoff: ReconnectConfig,
    /// Delay between login and the first heartbeat.
    pub heartbeat_initial_delay: Duration,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Consecutive write failures that trigger a reconnect.
    pub write_failure_threshold: u32,
    /// Pause after EOF or a timed-out read.
    pub read_retry_delay: Duration,
    /// Consecutive EOF/timeout reads that trigger a reconnect.
    pub read_failure_threshold: u32,
    /// Frame size limits.
    pub frame: FrameConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for RoomConfig {
    fn from(net: &NetworkConfig) -> Self {
        Self {
            default_server: net.default_server.clone(),
            default_port: net.default_port,
            connect_retries: net.connect_retries,
            connect_retry_delay: Duration::from_millis(net.connect_retry_delay_ms),
            backoff: ReconnectConfig {
                initial_delay: Duration::from_millis(net.backoff_initial_ms),
                max_delay: Duration::from_millis(net.backoff_max_ms),
                ..ReconnectConfig::default()
            },
            heartbeat_initial_delay: Duration::from_millis(net.heartbeat_initial_delay_ms),
            heartbeat_interval: Duration::from_millis(net.heartbeat_interval_ms),
            write_failure_threshold: net.heartbeat_failure_threshold.max(1),
            read_retry_delay: Duration::from_millis(net.read_retry_delay_ms),
            read_failure_threshold: net.read_failure_threshold.max(1),
            frame: FrameConfig {
                max_payload_size: net.max_frame_size,
            },
        }
    }
}

/// Everything needed to bring up one generation of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSeed {
    /// Room identity.
    pub room_id: RoomId,
    /// Application id.
    pub aid: String,
    /// Application secret.
    pub secret: String,
    /// Server host; empty selects the configured default.
    pub server: String,
    /// Server port; 0 selects the configured default.
    pub port: u16,
    /// Token carried over from a previous generation.
    pub token: Option<Token>,
}

impl RoomSeed {
    /// Host and port to dial. An empty host or a zero port selects the
    /// configured default endpoint as a whole.
    pub fn endpoint(&self, config: &RoomConfig) -> (String, u16) {
        if self.server.is_empty() || self.port == 0 {
            (config.default_server.clone(), config.default_port)
        } else {
            (self.server.clone(), self.port)
        }
    }
}

/// Session-wide collaborators shared by every room.
#[derive(Clone)]
pub struct RoomContext {
    /// Connection settings.
    pub config: Arc<RoomConfig>,
    /// Token issuer.
    pub provider: Arc<dyn TokenProvider>,
    /// Time source for token freshness and login signatures.
    pub clock: Arc<dyn Clock>,
    /// Shared inbound queue feeding the dispatch pipeline.
    pub inbound: mpsc::Sender<InboundMessage>,
    /// The session's reconnect queue.
    pub reconnect: mpsc::Sender<ReconnectRequest>,
}

/// A decoded frame tagged with the room generation that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Room the frame arrived on.
    pub room_id: RoomId,
    /// Generation of that room.
    pub generation: u64,
    /// Decoded body.
    pub fields: FieldMap,
}

/// Errors surfaced by a room.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// No token could be obtained. Terminal for the room.
    #[error("authentication failed: {0}")]
    Auth(#[from] TokenError),
    /// Writing to the connection failed.
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    /// An outgoing request could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),
    /// Dial rounds were capped and all of them failed.
    #[error("server unreachable after {rounds} rounds")]
    Unreachable {
        /// Dial rounds attempted.
        rounds: u32,
    },
    /// The room's scope was cancelled.
    #[error("room cancelled")]
    Cancelled,
}

/// One live generation of a room.
pub struct Room {
    room_id: RoomId,
    generation: u64,
    aid: String,
    secret: String,
    server: String,
    port: u16,
    token: Token,
    auth: String,
    writer: Mutex<RoomWriter>,
    state: Arc<RoomStateWatch>,
    cancel: CancellationToken,
    context: RoomContext,
    write_failures: AtomicU32,
    reconnect_requested: AtomicBool,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.room_id)
            .field("generation", &self.generation)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("state", &self.state.current())
            .finish_non_exhaustive()
    }
}

impl Room {
    /// Connect, authenticate and log in.
    ///
    /// Dials with immediate retries, then backs off and starts over until
    /// `cancel` fires. A token older than two hours (or none at all) is
    /// replaced through the context's provider before logging in. Returns the
    /// room in [`RoomState::JoiningGroup`] together with the read half for
    /// [`Room::run`].
    #[tracing::instrument(skip_all, fields(room_id = seed.room_id, generation = generation))]
    pub async fn enter(
        seed: RoomSeed,
        generation: u64,
        context: RoomContext,
        state: Arc<RoomStateWatch>,
        cancel: CancellationToken,
    ) -> Result<(Arc<Room>, RoomReader), RoomError> {
        let config = Arc::clone(&context.config);
        let (server, port) = seed.endpoint(&config);
        let mut backoff = ReconnectState::new(config.backoff.clone());
        let mut carried = seed.token.clone();

        loop {
            state.set_within(RoomState::Connecting, &cancel);
            let stream = connect(&server, port, &config, &mut backoff, &cancel).await?;

            state.set_within(RoomState::Authenticating, &cancel);
            let now = context.clock.unix_now();
            let token = match carried.take().filter(|t| t.is_fresh(now)) {
                Some(token) => token,
                None => {
                    tracing::debug!("Requesting a new token");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RoomError::Cancelled),
                        issued = context.provider.issue(&seed.aid, &seed.secret, now) => issued?,
                    }
                }
            };

            let auth = login_signature(&seed.secret, &seed.aid, now, &token.value);
            let login = framing::encode(&login_request(seed.room_id, &seed.aid, &token, now, &auth))?;

            let (reader, writer) = stream.into_split();
            let mut writer: RoomWriter = Box::new(writer);
            let written = tokio::select! {
                _ = cancel.cancelled() => return Err(RoomError::Cancelled),
                r = framing::write_frame(&mut writer, &login) => r,
            };

            match written {
                Ok(()) => {
                    tracing::info!(%server, port, "Logged in");
                    state.set_within(RoomState::JoiningGroup, &cancel);
                    let room = Room {
                        room_id: seed.room_id,
                        generation,
                        aid: seed.aid,
                        secret: seed.secret,
                        server,
                        port,
                        token,
                        auth,
                        writer: Mutex::new(writer),
                        state,
                        cancel,
                        context,
                        write_failures: AtomicU32::new(0),
                        reconnect_requested: AtomicBool::new(false),
                    };
                    return Ok((Arc::new(room), Box::new(reader)));
                }
                Err(e) => {
                    tracing::warn!("Login write failed: {e}");
                    carried = Some(token);
                    let delay = backoff.next_delay().ok_or(RoomError::Unreachable {
                        rounds: backoff.attempts(),
                    })?;
                    sleep_or_cancel(&cancel, delay).await?;
                }
            }
        }
    }

    /// Room identity.
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Generation of this room value.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token this generation logged in with.
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RoomState {
        self.state.current()
    }

    /// The room's cancellation scope.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether this generation has already asked to be replaced.
    pub fn reconnect_requested(&self) -> bool {
        self.reconnect_requested.load(Ordering::Acquire)
    }

    /// Snapshot used to build the next generation.
    pub fn reconnect_request(&self) -> ReconnectRequest {
        ReconnectRequest {
            room_id: self.room_id,
            generation: self.generation,
            server: self.server.clone(),
            port: self.port,
            token: self.token.clone(),
            aid: self.aid.clone(),
            secret: self.secret.clone(),
            auth: self.auth.clone(),
        }
    }

    /// Send the join-group request and move to [`RoomState::Streaming`].
    ///
    /// The server sends no acknowledgement, so the transition happens as soon
    /// as the write succeeds.
    pub async fn join_group(&self) -> Result<(), RoomError> {
        let mut fields = FieldMap::new();
        fields.insert("type", "joingroup");
        fields.insert("rid", self.room_id.to_string());
        fields.insert("token", self.token.value.as_str());
        fields.insert("time", self.token.issued_at.to_string());
        fields.insert("auth", self.auth.as_str());
        let bytes = framing::encode(&fields)?;

        self.send(&bytes).await?;
        self.state.set_within(RoomState::Streaming, &self.cancel);
        tracing::info!(room_id = self.room_id, "Joined message group");
        Ok(())
    }

    /// Run the heartbeat and receive loops until the room is cancelled or
    /// asks to be replaced.
    pub async fn run(self: Arc<Self>, reader: RoomReader) {
        tokio::join!(self.heartbeat_loop(), self.receive_loop(reader));

        if !self.reconnect_requested() {
            self.state.set(RoomState::Closed);
        }
        tracing::debug!(
            room_id = self.room_id,
            generation = self.generation,
            "Room loops stopped"
        );
    }

    /// Write one encoded frame, tracking consecutive failures.
    async fn send(&self, bytes: &[u8]) -> Result<(), RoomError> {
        let result = {
            let mut writer = self.writer.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RoomError::Cancelled),
                r = framing::write_frame(&mut *writer, bytes) => r,
            }
        };

        match result {
            Ok(()) => {
                self.write_failures.store(0, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                let failures = self.write_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(room_id = self.room_id, failures, "Write failed: {e}");
                if failures >= self.context.config.write_failure_threshold {
                    self.request_reconnect("write failures").await;
                }
                Err(RoomError::Write(e))
            }
        }
    }

    /// Emit the single reconnect request of this generation and stop its loops.
    async fn request_reconnect(&self, reason: &str) {
        if self.reconnect_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::warn!(
            room_id = self.room_id,
            generation = self.generation,
            reason,
            "Requesting reconnect"
        );
        self.state.set_within(RoomState::Reconnecting, &self.cancel);

        let request = self.reconnect_request();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            r = self.context.reconnect.send(request) => {
                if r.is_err() {
                    tracing::debug!(room_id = self.room_id, "Reconnect queue closed");
                }
            }
        }
        self.cancel.cancel();
    }

    /// Send `mrkl` after the initial delay, then once per interval.
    async fn heartbeat_loop(&self) {
        let config = &self.context.config;
        let bytes = match framing::encode(&[("type", "mrkl")].into_iter().collect()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Heartbeat encoding failed: {e}");
                return;
            }
        };

        if sleep_or_cancel(&self.cancel, config.heartbeat_initial_delay)
            .await
            .is_err()
        {
            return;
        }

        let mut interval = tokio::time::interval(config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.send(&bytes).await {
                Ok(()) => tracing::trace!(room_id = self.room_id, "Heartbeat sent"),
                Err(RoomError::Cancelled) => break,
                Err(_) if self.reconnect_requested() => break,
                Err(_) => {}
            }
        }
    }

    /// Read frames and push them onto the inbound queue.
    async fn receive_loop(&self, mut reader: RoomReader) {
        let config = &self.context.config;
        let mut transient_failures = 0u32;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = framing::read_frame(&mut reader, &config.frame) => r,
            };

            let frame = match result {
                Ok(frame) => {
                    transient_failures = 0;
                    frame
                }
                Err(FrameError::LengthMismatch {
                    declared,
                    duplicate,
                }) => {
                    tracing::debug!(declared, duplicate, "Dropped frame with inconsistent header");
                    continue;
                }
                Err(FrameError::PayloadTooLarge { size, max }) => {
                    tracing::debug!(room_id = self.room_id, size, max, "Dropped oversized frame");
                    continue;
                }
                Err(e) if is_transient(&e) => {
                    transient_failures += 1;
                    if transient_failures >= config.read_failure_threshold {
                        self.request_reconnect("connection lost").await;
                        break;
                    }
                    tracing::debug!(
                        room_id = self.room_id,
                        transient_failures,
                        "Read interrupted: {e}"
                    );
                    if sleep_or_cancel(&self.cancel, config.read_retry_delay)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(room_id = self.room_id, "Read failed: {e}");
                    self.request_reconnect("read failure").await;
                    break;
                }
            };

            let Some(fields) = self.decode(frame) else {
                continue;
            };
            tracing::trace!(room_id = self.room_id, kind = ?fields.kind(), "Frame received");

            let message = InboundMessage {
                room_id: self.room_id,
                generation: self.generation,
                fields,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.context.inbound.send(message) => {
                    if r.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn decode(&self, frame: Frame) -> Option<FieldMap> {
        let body = if frame.header.is_compressed() {
            match compression::decompress(&frame.body) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(room_id = self.room_id, "Dropped frame: {e}");
                    return None;
                }
            }
        } else {
            frame.body
        };

        match stt::decode_body(&body) {
            Ok(fields) => Some(fields),
            Err(e) => {
                tracing::debug!(room_id = self.room_id, "Dropped frame: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
impl Room {
    /// A logged-in room writing to `writer`, for exercising the stages after
    /// login without a socket.
    pub(crate) fn with_writer(
        room_id: RoomId,
        generation: u64,
        context: RoomContext,
        writer: RoomWriter,
    ) -> Arc<Room> {
        Arc::new(Room {
            room_id,
            generation,
            aid: "app".into(),
            secret: "shh".into(),
            server: "127.0.0.1".into(),
            port: 9,
            token: Token {
                value: "tok".into(),
                issued_at: 1_700_000_000 - 60,
                expire: 7200,
            },
            auth: "sig".into(),
            writer: Mutex::new(writer),
            state: Arc::new(RoomStateWatch::new()),
            cancel: CancellationToken::new(),
            context,
            write_failures: AtomicU32::new(0),
            reconnect_requested: AtomicBool::new(false),
        })
    }
}

/// Login signature: md5 of `{secret}_{aid}_{time}_{token}`.
pub fn login_signature(secret: &str, aid: &str, time: i64, token: &str) -> String {
    md5_hex(&format!("{secret}_{aid}_{time}_{token}"))
}

fn login_request(room_id: RoomId, aid: &str, token: &Token, now: i64, auth: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("type", "loginreq");
    fields.insert("roomid", room_id.to_string());
    fields.insert("aid", aid);
    fields.insert("token", token.value.as_str());
    fields.insert("time", now.to_string());
    fields.insert("auth", auth);
    fields
}

fn is_transient(err: &FrameError) -> bool {
    match err {
        FrameError::ConnectionClosed => true,
        FrameError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<(), RoomError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RoomError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Dial with immediate retries, backing off between rounds.
async fn connect(
    server: &str,
    port: u16,
    config: &RoomConfig,
    backoff: &mut ReconnectState,
    cancel: &CancellationToken,
) -> Result<TcpStream, RoomError> {
    loop {
        for attempt in 0..=config.connect_retries {
            if attempt > 0 {
                sleep_or_cancel(cancel, config.connect_retry_delay).await?;
            }
            tracing::debug!(server, port, attempt, "Dialling");

            let dialled = tokio::select! {
                _ = cancel.cancelled() => return Err(RoomError::Cancelled),
                r = TcpStream::connect((server, port)) => r,
            };
            match dialled {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY: {e}");
                    }
                    backoff.reset();
                    return Ok(stream);
                }
                Err(e) => tracing::warn!(server, port, attempt, "Connect failed: {e}"),
            }
        }

        let delay = backoff.next_delay().ok_or(RoomError::Unreachable {
            rounds: backoff.attempts(),
        })?;
        tracing::info!(server, port, ?delay, "Backing off before next dial round");
        sleep_or_cancel(cancel, delay).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use tokio::io::{AsyncWriteExt, duplex};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::error::TryRecvError;

    const NOW: i64 = 1_700_000_000;

    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn unix_now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl TokenProvider for CountingProvider {
        async fn issue(&self, _aid: &str, _secret: &str, now: i64) -> Result<Token, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token {
                value: format!("tok{n}"),
                issued_at: now,
                expire: 7200,
            })
        }
    }

    struct RejectingProvider;

    #[async_trait::async_trait]
    impl TokenProvider for RejectingProvider {
        async fn issue(&self, _aid: &str, _secret: &str, _now: i64) -> Result<Token, TokenError> {
            Err(TokenError::Rejected {
                code: 401,
                msg: "bad secret".into(),
            })
        }
    }

    fn fast_config() -> RoomConfig {
        RoomConfig {
            connect_retry_delay: Duration::from_millis(5),
            backoff: ReconnectConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                jitter: 0.0,
                ..ReconnectConfig::default()
            },
            heartbeat_initial_delay: Duration::ZERO,
            heartbeat_interval: Duration::from_millis(5),
            write_failure_threshold: 3,
            read_retry_delay: Duration::from_millis(5),
            read_failure_threshold: 3,
            ..RoomConfig::default()
        }
    }

    struct Harness {
        context: RoomContext,
        clock: Arc<ManualClock>,
        provider: Arc<CountingProvider>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        reconnect_rx: mpsc::Receiver<ReconnectRequest>,
    }

    fn harness(config: RoomConfig) -> Harness {
        let clock = Arc::new(ManualClock(AtomicI64::new(NOW)));
        let provider = Arc::new(CountingProvider::default());
        let (inbound, inbound_rx) = mpsc::channel(16);
        let (reconnect, reconnect_rx) = mpsc::channel(4);
        let context = RoomContext {
            config: Arc::new(config),
            provider: provider.clone(),
            clock: clock.clone(),
            inbound,
            reconnect,
        };
        Harness {
            context,
            clock,
            provider,
            inbound_rx,
            reconnect_rx,
        }
    }

    fn seed(port: u16, token: Option<Token>) -> RoomSeed {
        RoomSeed {
            room_id: 288016,
            aid: "app".into(),
            secret: "shh".into(),
            server: "127.0.0.1".into(),
            port,
            token,
        }
    }

    fn room_with_writer(context: RoomContext, writer: RoomWriter) -> Arc<Room> {
        Room::with_writer(7, 2, context, writer)
    }

    /// Accept connections and forward the first frame of each to `tx`.
    async fn login_server() -> (u16, mpsc::UnboundedReceiver<FieldMap>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(frame) = framing::read_frame(&mut stream, &FrameConfig::default()).await
                else {
                    continue;
                };
                if let Ok(fields) = stt::decode_body(&frame.body) {
                    let _ = tx.send(fields);
                }
            }
        });
        (port, rx)
    }

    #[test]
    fn test_state_starts_disconnected() {
        let watch = RoomStateWatch::new();
        assert_eq!(watch.current(), RoomState::Disconnected);
    }

    #[tokio::test]
    async fn test_state_subscribers_see_transitions() {
        let watch = RoomStateWatch::new();
        let mut rx = watch.subscribe();
        watch.set(RoomState::Streaming);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), RoomState::Streaming);
    }

    #[test]
    fn test_state_is_frozen_once_scope_is_cancelled() {
        let watch = RoomStateWatch::new();
        let scope = CancellationToken::new();

        watch.set_within(RoomState::Connecting, &scope);
        assert_eq!(watch.current(), RoomState::Connecting);

        scope.cancel();
        watch.set(RoomState::Closed);
        watch.set_within(RoomState::JoiningGroup, &scope);
        assert_eq!(watch.current(), RoomState::Closed);
    }

    #[test]
    fn test_default_endpoint_for_empty_server_or_zero_port() {
        let config = RoomConfig::default();
        let mut s = seed(0, None);
        assert_eq!(s.endpoint(&config), ("openapi-danmu.douyu.com".to_string(), 80));

        s.port = 8601;
        s.server.clear();
        assert_eq!(s.endpoint(&config), ("openapi-danmu.douyu.com".to_string(), 80));

        s.server = "danmu.example".into();
        assert_eq!(s.endpoint(&config), ("danmu.example".to_string(), 8601));
    }

    #[test]
    fn test_login_signature_format() {
        assert_eq!(
            login_signature("S", "A", 100, "T"),
            md5_hex("S_A_100_T")
        );
    }

    #[tokio::test]
    async fn test_enter_sends_login_request() {
        let (port, mut frames) = login_server().await;
        let h = harness(fast_config());

        let (room, _reader) = Room::enter(
            seed(port, None),
            1,
            h.context.clone(),
            Arc::new(RoomStateWatch::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let login = frames.recv().await.unwrap();
        assert_eq!(login.kind(), Some("loginreq"));
        assert_eq!(login.get("roomid"), Some("288016"));
        assert_eq!(login.get("aid"), Some("app"));
        assert_eq!(login.get("token"), Some("tok1"));
        assert_eq!(login.int("time"), NOW);
        assert_eq!(
            login.get("auth"),
            Some(login_signature("shh", "app", NOW, "tok1").as_str())
        );
        assert_eq!(room.state(), RoomState::JoiningGroup);
        assert_eq!(room.generation(), 1);
    }

    #[tokio::test]
    async fn test_token_reused_within_ttl_and_refreshed_after() {
        let (port, mut frames) = login_server().await;
        let h = harness(fast_config());
        let enter = |token: Option<Token>| {
            Room::enter(
                seed(port, token),
                1,
                h.context.clone(),
                Arc::new(RoomStateWatch::new()),
                CancellationToken::new(),
            )
        };

        let (first, _r1) = enter(None).await.unwrap();
        frames.recv().await.unwrap();
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);

        h.clock.0.store(NOW + 3600, Ordering::SeqCst);
        let (second, _r2) = enter(Some(first.token().clone())).await.unwrap();
        frames.recv().await.unwrap();
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.token(), first.token());

        h.clock.0.store(NOW + 2 * 3600, Ordering::SeqCst);
        let (third, _r3) = enter(Some(second.token().clone())).await.unwrap();
        let login = frames.recv().await.unwrap();
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(third.token().value, "tok2");
        assert_eq!(login.get("token"), Some("tok2"));
    }

    #[tokio::test]
    async fn test_token_failure_is_terminal() {
        let (port, _frames) = login_server().await;
        let mut h = harness(fast_config());
        h.context.provider = Arc::new(RejectingProvider);

        let result = Room::enter(
            seed(port, None),
            1,
            h.context.clone(),
            Arc::new(RoomStateWatch::new()),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(RoomError::Auth(TokenError::Rejected { code: 401, .. }))));
    }

    #[tokio::test]
    async fn test_cancel_stops_dialling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let h = harness(fast_config());
        let cancel = CancellationToken::new();
        let state = Arc::new(RoomStateWatch::new());
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = Room::enter(seed(port, None), 1, h.context.clone(), state.clone(), cancel).await;
        assert!(matches!(result, Err(RoomError::Cancelled)));
        assert_eq!(state.current(), RoomState::Connecting);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_join_group_sends_request_and_streams() {
        let h = harness(fast_config());
        let (writer, mut peer) = duplex(1024);
        let room = room_with_writer(h.context.clone(), Box::new(writer));

        room.join_group().await.unwrap();

        let frame = framing::read_frame(&mut peer, &FrameConfig::default())
            .await
            .unwrap();
        let fields = stt::decode_body(&frame.body).unwrap();
        assert_eq!(fields.kind(), Some("joingroup"));
        assert_eq!(fields.get("rid"), Some("7"));
        assert_eq!(fields.get("token"), Some("tok"));
        assert_eq!(fields.int("time"), NOW - 60);
        assert_eq!(fields.get("auth"), Some("sig"));
        assert_eq!(room.state(), RoomState::Streaming);
    }

    #[tokio::test]
    async fn test_join_group_after_removal_keeps_closed_state() {
        let h = harness(fast_config());
        let (writer, _peer) = duplex(1024);
        let room = room_with_writer(h.context.clone(), Box::new(writer));

        room.cancel_token().cancel();
        room.state.set(RoomState::Closed);
        let _ = room.join_group().await;

        assert_eq!(room.state(), RoomState::Closed);
    }

    #[tokio::test]
    async fn test_write_failures_emit_single_reconnect_request() {
        let mut h = harness(fast_config());
        let (writer, peer) = duplex(64);
        drop(peer);
        let room = room_with_writer(h.context.clone(), Box::new(writer));

        tokio::time::timeout(Duration::from_secs(5), room.heartbeat_loop())
            .await
            .expect("heartbeat loop should stop after the failure threshold");

        let request = h.reconnect_rx.recv().await.unwrap();
        assert_eq!(request.room_id, 7);
        assert_eq!(request.generation, 2);
        assert_eq!(request.token.value, "tok");
        assert!(room.cancel_token().is_cancelled());
        assert_eq!(room.state(), RoomState::Reconnecting);

        // Further failures on the same generation stay silent.
        assert!(room.join_group().await.is_err());
        assert!(matches!(h.reconnect_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_join_group_failures_share_the_counter() {
        let mut h = harness(fast_config());
        let (writer, peer) = duplex(64);
        drop(peer);
        let room = room_with_writer(h.context.clone(), Box::new(writer));

        for _ in 0..2 {
            assert!(matches!(room.join_group().await, Err(RoomError::Write(_))));
        }
        assert!(matches!(h.reconnect_rx.try_recv(), Err(TryRecvError::Empty)));

        assert!(room.join_group().await.is_err());
        assert_eq!(h.reconnect_rx.recv().await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_receive_preserves_order_and_tags_generation() {
        let mut h = harness(fast_config());
        let (writer, _peer) = duplex(64);
        let room = room_with_writer(h.context.clone(), Box::new(writer));
        let (mut server, reader) = duplex(4096);

        let chat = |txt: &str| {
            let fields: FieldMap = [("type", "chatmsg"), ("txt", txt)].into_iter().collect();
            stt::encode_body(&fields).unwrap()
        };
        let kind = framing::SERVER_MESSAGE_KIND;
        let frames = [
            Frame::new(kind, 0, chat("one")),
            Frame::new(
                kind,
                framing::FLAG_COMPRESSED,
                compression::compress(&chat("two")).unwrap(),
            ),
            Frame::new(kind, 0, b"garbage\0".to_vec()),
            Frame::new(kind, 0, chat("three")),
        ];
        for frame in frames {
            server.write_all(&frame.unwrap().to_bytes()).await.unwrap();
        }

        let task = tokio::spawn({
            let room = room.clone();
            async move { room.receive_loop(Box::new(reader)).await }
        });

        let mut texts = Vec::new();
        for _ in 0..3 {
            let msg = h.inbound_rx.recv().await.unwrap();
            assert_eq!((msg.room_id, msg.generation), (7, 2));
            texts.push(msg.fields.string("txt"));
        }
        assert_eq!(texts, ["one", "two", "three"]);

        room.cancel_token().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_dropped_and_stream_continues() {
        let mut config = fast_config();
        config.frame.max_payload_size = 64;
        let mut h = harness(config);
        let (writer, _peer) = duplex(64);
        let room = room_with_writer(h.context.clone(), Box::new(writer));
        let (mut server, reader) = duplex(4096);

        let kind = framing::SERVER_MESSAGE_KIND;
        let oversized = Frame::new(kind, 0, vec![b'x'; 200]).unwrap();
        server.write_all(&oversized.to_bytes()).await.unwrap();
        let after: FieldMap = [("type", "chatmsg"), ("txt", "after")].into_iter().collect();
        server
            .write_all(&framing::encode(&after).unwrap())
            .await
            .unwrap();

        let task = tokio::spawn({
            let room = room.clone();
            async move { room.receive_loop(Box::new(reader)).await }
        });

        let msg = tokio::time::timeout(Duration::from_secs(5), h.inbound_rx.recv())
            .await
            .expect("frame after the oversized one should arrive")
            .unwrap();
        assert_eq!(msg.fields.get("txt"), Some("after"));
        assert!(!room.reconnect_requested());
        assert!(matches!(h.reconnect_rx.try_recv(), Err(TryRecvError::Empty)));

        room.cancel_token().cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_escalates_after_threshold() {
        let mut h = harness(fast_config());
        let (writer, _peer) = duplex(64);
        let room = room_with_writer(h.context.clone(), Box::new(writer));
        let (server, reader) = duplex(64);
        drop(server);

        tokio::time::timeout(Duration::from_secs(5), room.receive_loop(Box::new(reader)))
            .await
            .expect("receive loop should give up after repeated EOF");

        assert_eq!(h.reconnect_rx.recv().await.unwrap().room_id, 7);
        assert!(matches!(h.reconnect_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_run_closes_on_cancel() {
        let h = harness(RoomConfig {
            heartbeat_initial_delay: Duration::from_secs(60),
            ..fast_config()
        });
        let (writer, _peer) = duplex(64);
        let room = room_with_writer(h.context.clone(), Box::new(writer));
        let (_server, reader) = duplex(64);

        let task = tokio::spawn(room.clone().run(Box::new(reader)));
        room.cancel_token().cancel();
        task.await.unwrap();

        assert_eq!(room.state(), RoomState::Closed);
        assert!(!room.reconnect_requested());
    }
}
