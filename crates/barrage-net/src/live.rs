//! Live session: room registry, dispatch pipeline and reconnect supervision.
//!
//! A [`Live`] owns every room joined through it. Rooms push decoded frames
//! onto one bounded inbound queue shared by the whole session; a pool of
//! dispatch workers drains it into the registered [`Handlers`]. Rooms that
//! give up send a [`ReconnectRequest`] to the session's supervisor, which
//! builds the next generation only if the room is still registered with the
//! same generation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use barrage_config::Config;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::events::{Event, EventKind};
use crate::handlers::Handlers;
use crate::reconnection::ReconnectRequest;
use crate::room::{
    InboundMessage, Room, RoomConfig, RoomContext, RoomError, RoomId, RoomSeed, RoomState,
    RoomStateWatch,
};
use crate::token::{Clock, HttpTokenProvider, SystemClock, TokenError, TokenProvider};

/// Session settings.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Per-room connection settings.
    pub room: RoomConfig,
    /// Dispatch workers. With one worker, handlers see events in exactly the
    /// order they were enqueued across all rooms; with more, no ordering
    /// between events is guaranteed.
    pub dispatch_workers: usize,
    /// Capacity of the shared inbound queue. Rooms wait when it is full.
    pub inbound_capacity: usize,
    /// Ceiling on registered rooms, and the capacity of the reconnect queue.
    /// Joining past it is rejected with [`LiveError::RoomLimitReached`], a
    /// guard in addition to the empty and already-joined checks. The default
    /// is high enough that ordinary sessions never reach it.
    pub max_rooms: usize,
    /// Base URL of the token endpoint.
    pub token_base_url: String,
    /// Token request timeout.
    pub token_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for LiveConfig {
    fn from(config: &Config) -> Self {
        Self {
            room: RoomConfig::from(&config.network),
            dispatch_workers: config.dispatch.workers.max(1),
            inbound_capacity: config.dispatch.inbound_capacity.max(1),
            max_rooms: config.dispatch.max_rooms.max(1),
            token_base_url: config.token.base_url.clone(),
            token_timeout: Duration::from_secs(config.token.request_timeout_secs),
        }
    }
}

/// Errors returned synchronously by the session API. None of them change
/// session state.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The call named no rooms.
    #[error("no room ids given")]
    NoRooms,
    /// A room in the call is already registered.
    #[error("room {0} is already joined")]
    AlreadyJoined(RoomId),
    /// Joining would exceed [`LiveConfig::max_rooms`].
    #[error("joining {requested} rooms would exceed the limit of {max}")]
    RoomLimitReached {
        /// Rooms in the rejected call.
        requested: usize,
        /// Configured limit.
        max: usize,
    },
    /// The HTTP token client could not be built.
    #[error("token client setup failed: {0}")]
    TokenClient(#[from] TokenError),
}

struct RoomEntry {
    generation: u64,
    cancel: CancellationToken,
    state: Arc<RoomStateWatch>,
    /// Set once the current generation has logged in.
    room: Option<Arc<Room>>,
}

struct Shared {
    registry: RwLock<HashMap<RoomId, RoomEntry>>,
    context: RoomContext,
    handlers: Handlers,
    tracker: TaskTracker,
    cancel: CancellationToken,
    max_rooms: usize,
    next_generation: AtomicU64,
}

/// A live session managing any number of rooms.
pub struct Live {
    shared: Arc<Shared>,
}

impl Live {
    /// Start a session that obtains tokens from the configured HTTP endpoint.
    ///
    /// Must be called from within a tokio runtime. Background work runs until
    /// `cancel` fires.
    pub fn start(
        config: LiveConfig,
        handlers: Handlers,
        cancel: CancellationToken,
    ) -> Result<Self, LiveError> {
        let provider = HttpTokenProvider::new(&config.token_base_url, config.token_timeout)?;
        Ok(Self::start_with(
            config,
            handlers,
            Arc::new(provider),
            Arc::new(SystemClock),
            cancel,
        ))
    }

    /// Start a session with an explicit token provider and clock.
    pub fn start_with(
        config: LiveConfig,
        handlers: Handlers,
        provider: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (reconnect_tx, reconnect_rx) = mpsc::channel(config.max_rooms.max(1));

        let shared = Arc::new(Shared {
            registry: RwLock::new(HashMap::new()),
            context: RoomContext {
                config: Arc::new(config.room),
                provider,
                clock,
                inbound: inbound_tx,
                reconnect: reconnect_tx,
            },
            handlers,
            tracker: TaskTracker::new(),
            cancel,
            max_rooms: config.max_rooms.max(1),
            next_generation: AtomicU64::new(1),
        });

        let inbound_rx = Arc::new(Mutex::new(inbound_rx));
        let workers = config.dispatch_workers.max(1);
        for worker in 0..workers {
            shared
                .tracker
                .spawn(dispatch_worker(Arc::clone(&shared), Arc::clone(&inbound_rx), worker));
        }
        shared
            .tracker
            .spawn(supervise(Arc::clone(&shared), reconnect_rx));

        tracing::info!(workers, "Live session started");
        Self { shared }
    }

    /// Join rooms on `server:port` (empty server or port 0 selects the
    /// configured default endpoint).
    ///
    /// Fails without registering anything if `room_ids` is empty, names a
    /// room that is already joined, or would exceed the room limit.
    /// Otherwise every room is registered before any of them starts
    /// connecting.
    pub async fn join(
        &self,
        aid: &str,
        secret: &str,
        server: &str,
        port: u16,
        room_ids: &[RoomId],
    ) -> Result<(), LiveError> {
        if room_ids.is_empty() {
            return Err(LiveError::NoRooms);
        }

        let mut ids = room_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut pending = Vec::with_capacity(ids.len());
        {
            let mut registry = self.shared.registry.write().await;
            if let Some(id) = ids.iter().find(|id| registry.contains_key(*id)) {
                return Err(LiveError::AlreadyJoined(*id));
            }
            if registry.len() + ids.len() > self.shared.max_rooms {
                return Err(LiveError::RoomLimitReached {
                    requested: ids.len(),
                    max: self.shared.max_rooms,
                });
            }

            for room_id in ids {
                let generation = self.shared.next_generation();
                let cancel = self.shared.cancel.child_token();
                let state = Arc::new(RoomStateWatch::new());
                registry.insert(
                    room_id,
                    RoomEntry {
                        generation,
                        cancel: cancel.clone(),
                        state: Arc::clone(&state),
                        room: None,
                    },
                );
                let seed = RoomSeed {
                    room_id,
                    aid: aid.to_string(),
                    secret: secret.to_string(),
                    server: server.to_string(),
                    port,
                    token: None,
                };
                pending.push((seed, generation, state, cancel));
            }
        }

        for (seed, generation, state, cancel) in pending {
            tracing::info!(room_id = seed.room_id, "Joining room");
            self.shared.spawn_room(seed, generation, state, cancel);
        }
        Ok(())
    }

    /// Stop and forget rooms. Ids that are not registered are skipped.
    pub async fn remove(&self, room_ids: &[RoomId]) -> Result<(), LiveError> {
        if room_ids.is_empty() {
            return Err(LiveError::NoRooms);
        }

        let mut registry = self.shared.registry.write().await;
        for room_id in room_ids {
            if let Some(entry) = registry.remove(room_id) {
                entry.cancel.cancel();
                entry.state.set(RoomState::Closed);
                tracing::info!(room_id, "Removed room");
            }
        }
        Ok(())
    }

    /// Registered room ids, ascending.
    pub async fn rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.shared.registry.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current state of a registered room.
    pub async fn room_state(&self, room_id: RoomId) -> Option<RoomState> {
        self.shared
            .registry
            .read()
            .await
            .get(&room_id)
            .map(|entry| entry.state.current())
    }

    /// Subscribe to state changes of a registered room. The subscription
    /// follows the room across reconnects.
    pub async fn subscribe(&self, room_id: RoomId) -> Option<watch::Receiver<RoomState>> {
        self.shared
            .registry
            .read()
            .await
            .get(&room_id)
            .map(|entry| entry.state.subscribe())
    }

    /// Wait until the session's cancellation token has fired and every room
    /// loop, dispatch worker and the supervisor have exited.
    pub async fn wait(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Cancel the session and wait for it to drain.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.wait().await;
    }
}

impl Shared {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_room(
        self: &Arc<Self>,
        seed: RoomSeed,
        generation: u64,
        state: Arc<RoomStateWatch>,
        cancel: CancellationToken,
    ) {
        self.tracker.spawn(run_room(
            Arc::clone(self),
            seed,
            generation,
            state,
            cancel,
        ));
    }

    /// Drop the registry entry if it still belongs to `generation`.
    async fn retire(&self, room_id: RoomId, generation: u64) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get(&room_id) {
            Some(entry) if entry.generation == generation => {
                registry.remove(&room_id);
                true
            }
            _ => false,
        }
    }

    async fn current_room(&self, room_id: RoomId, generation: u64) -> Option<Arc<Room>> {
        self.registry
            .read()
            .await
            .get(&room_id)
            .filter(|entry| entry.generation == generation)
            .and_then(|entry| entry.room.clone())
    }

    async fn dispatch(&self, message: InboundMessage) {
        let Some(tag) = message.fields.kind() else {
            tracing::debug!(room_id = message.room_id, "Dropped frame without a type");
            return;
        };
        let Some(kind) = EventKind::from_tag(tag) else {
            tracing::debug!(room_id = message.room_id, tag, "Dropped unrecognized event");
            return;
        };

        if kind == EventKind::LoginResponse {
            match self.current_room(message.room_id, message.generation).await {
                Some(room) => {
                    if let Err(e) = room.join_group().await {
                        tracing::warn!(room_id = message.room_id, "Join group failed: {e}");
                    }
                }
                None => tracing::debug!(
                    room_id = message.room_id,
                    generation = message.generation,
                    "Login response for a retired room generation"
                ),
            }
        }

        if self.handlers.is_registered(kind) {
            let event = Event::project(kind, &message.fields);
            self.handlers.dispatch(message.room_id, &event);
        }
    }
}

/// Bring up one room generation and run it until it stops.
async fn run_room(
    shared: Arc<Shared>,
    seed: RoomSeed,
    generation: u64,
    state: Arc<RoomStateWatch>,
    cancel: CancellationToken,
) {
    let room_id = seed.room_id;
    let entered = Room::enter(
        seed,
        generation,
        shared.context.clone(),
        Arc::clone(&state),
        cancel.clone(),
    )
    .await;

    match entered {
        Ok((room, reader)) => {
            let attached = {
                let mut registry = shared.registry.write().await;
                match registry.get_mut(&room_id) {
                    Some(entry) if entry.generation == generation => {
                        entry.room = Some(Arc::clone(&room));
                        true
                    }
                    _ => false,
                }
            };
            if !attached {
                tracing::debug!(room_id, generation, "Room retired while connecting");
                cancel.cancel();
                state.set(RoomState::Closed);
                return;
            }
            room.run(reader).await;
        }
        Err(RoomError::Cancelled) => {
            tracing::debug!(room_id, generation, "Room cancelled before streaming");
            state.set(RoomState::Closed);
        }
        Err(e) => {
            tracing::error!(room_id, generation, "Room failed: {e}");
            if shared.retire(room_id, generation).await {
                state.set(RoomState::Closed);
                shared.handlers.room_failed(room_id, &e);
            }
        }
    }
}

/// Drain the shared inbound queue into the handlers.
async fn dispatch_worker(
    shared: Arc<Shared>,
    inbound: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    worker: usize,
) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            m = async { inbound.lock().await.recv().await } => m,
        };
        let Some(message) = next else {
            break;
        };
        shared.dispatch(message).await;
    }
    tracing::debug!(worker, "Dispatch worker stopped");
}

/// Build replacement rooms for reconnect requests that are still current.
async fn supervise(shared: Arc<Shared>, mut requests: mpsc::Receiver<ReconnectRequest>) {
    loop {
        let request = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            r = requests.recv() => match r {
                Some(request) => request,
                None => break,
            },
        };

        let (generation, state, cancel) = {
            let mut registry = shared.registry.write().await;
            let Some(entry) = registry.get_mut(&request.room_id) else {
                tracing::debug!(room_id = request.room_id, "Ignored reconnect for removed room");
                continue;
            };
            if entry.generation != request.generation {
                tracing::debug!(
                    room_id = request.room_id,
                    stale = request.generation,
                    current = entry.generation,
                    "Ignored stale reconnect request"
                );
                continue;
            }

            entry.cancel.cancel();
            entry.generation = shared.next_generation();
            entry.cancel = shared.cancel.child_token();
            entry.room = None;
            (entry.generation, Arc::clone(&entry.state), entry.cancel.clone())
        };

        tracing::info!(
            room_id = request.room_id,
            generation,
            server = %request.server,
            port = request.port,
            "Reconnecting room"
        );
        shared.spawn_room(request.to_seed(), generation, state, cancel);
    }
    tracing::debug!("Reconnect supervisor stopped");
}
