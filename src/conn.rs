//! Connection supervisor.
//!
//! Owns the identity keys, the room set and the reconnection policy. Each
//! room dials its own socket; the supervisor groups them into generations:
//! when any room's transport fails fatally, the whole generation is torn
//! down, `Disconnected` is emitted, and after an exponential backoff every
//! persisted room is rejoined.

use crate::bex::{self, Record};
use crate::bus::{Bus, DispatchPolicy};
use crate::db::{Database, MemoryDb, KEY_COLOR, KEY_IDENTITY, KEY_MODS, KEY_PAIRWISE, KEY_ROOMS};
use crate::multiparty::Session;
use crate::pairwise::PairwiseProvider;
use crate::room::{self, RoomHandle};
use crate::transport::ws::{LegacyWs, ModernWs, RoomTransport, TransportKind};
use crate::transport::TransportError;
use crate::types::{Event, EventKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// First reconnect delay; grows by [`BACKOFF_FACTOR`] per failure.
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_FACTOR: f64 = 1.6;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Window after (re)connecting during which newly observed peers are the
/// initial roster catching up, not interactive joins.
const JOIN_SUPPRESS_WINDOW: Duration = Duration::from_secs(4);

const DEFAULT_COLOR: &str = "#413ed1";

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("no such room: {0}")]
    NoSuchRoom(String),
    #[error("room is shutting down")]
    RoomClosed,
    #[error("invalid color: {0}")]
    InvalidColor(String),
    #[error("run may only be called once")]
    AlreadyRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Supervisor configuration. `..Default::default()` gives a human client
/// on the modern transport with an in-memory store.
pub struct Options {
    /// WebSocket URL of the gateway (modern) or stream endpoint (legacy).
    pub url: String,
    /// Stream host, legacy transport only.
    pub host: String,
    /// Conference service host, legacy transport only.
    pub conference: String,
    pub transport: TransportKind,
    /// Skip all Binary Extensions traffic, inbound and outbound.
    pub bex_disabled: bool,
    /// Skip the private channel entirely.
    pub dm_disabled: bool,
    /// Suppresses the bot flag in the introduction burst.
    pub human: bool,
    pub dispatch: DispatchPolicy,
    /// Storage shim; defaults to an in-memory store.
    pub db: Option<Arc<dyn Database>>,
    /// External deniable-auth library for the private channel.
    pub pairwise: Option<Arc<dyn PairwiseProvider>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            url: "ws://127.0.0.1:8009/ws".to_string(),
            host: "localhost".to_string(),
            conference: "conference.localhost".to_string(),
            transport: TransportKind::Modern,
            bex_disabled: false,
            dm_disabled: false,
            human: false,
            dispatch: DispatchPolicy::Spawn,
            db: None,
            pairwise: None,
        }
    }
}

/// Services every room actor shares. Rooms hold an `Arc` to this, never to
/// each other or to the supervisor's room table, so ownership stays
/// one-directional.
pub(crate) struct Shared {
    pub(crate) options: Options,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) bus: Bus,
    rooms: Mutex<HashMap<String, RoomHandle>>,
    fatal_tx: mpsc::UnboundedSender<(String, TransportError)>,
    killed: AtomicBool,
    kill: Notify,
    started: StdMutex<Instant>,
    epoch: Instant,
}

impl Shared {
    pub(crate) fn report_fatal(&self, room: &str, err: TransportError) {
        let _ = self.fatal_tx.send((room.to_string(), err));
    }

    /// True while the current generation is still inside the initial
    /// roster catch-up window.
    pub(crate) fn suppressing_joins(&self) -> bool {
        self.started.lock().expect("clock lock poisoned").elapsed() < JOIN_SUPPRESS_WINDOW
    }

    pub(crate) fn mods(&self) -> Vec<String> {
        self.db
            .load(KEY_MODS)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Persisted display color, initialized to the default on first use.
    pub(crate) fn color(&self) -> String {
        match self.db.load(KEY_COLOR) {
            Some(color) if !color.is_empty() => color,
            _ => {
                self.db.store(KEY_COLOR, DEFAULT_COLOR);
                DEFAULT_COLOR.to_string()
            }
        }
    }

    pub(crate) fn emit_later(self: &Arc<Self>, event: Event, delay: Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            shared.bus.emit(event);
        });
    }
}

/// The client connection. Cheap to clone-by-`Arc` internally; consumers
/// hold one and drive it from event handlers.
pub struct Conn {
    shared: Arc<Shared>,
    fatal_rx: StdMutex<Option<mpsc::UnboundedReceiver<(String, TransportError)>>>,
}

impl Conn {
    pub fn new(options: Options) -> Arc<Conn> {
        let db = options
            .db
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryDb::new()));
        let bus = Bus::new(options.dispatch);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Conn {
            shared: Arc::new(Shared {
                options,
                db,
                bus,
                rooms: Mutex::new(HashMap::new()),
                fatal_tx,
                killed: AtomicBool::new(false),
                kill: Notify::new(),
                started: StdMutex::new(Instant::now()),
                epoch: Instant::now(),
            }),
            fatal_rx: StdMutex::new(Some(fatal_rx)),
        });

        // introduce ourselves (color, bot flag) whenever we or a peer joins
        let weak = Arc::downgrade(&conn.shared);
        conn.shared
            .bus
            .on(EventKind::RoomJoined, move |event| introduction(&weak, event));
        let weak = Arc::downgrade(&conn.shared);
        conn.shared
            .bus
            .on(EventKind::UserJoined, move |event| introduction(&weak, event));

        conn
    }

    /// Register an event handler.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, handler);
    }

    pub fn uptime(&self) -> Duration {
        self.shared.epoch.elapsed()
    }

    /// Drive the connection until [`Conn::disconnect`] is called. Emits
    /// `Connected` after each successful generation start and
    /// `Disconnected` (followed by a backoff and a rejoin of every
    /// persisted room) when any room's transport fails.
    pub async fn run(&self) -> Result<(), ConnError> {
        self.ensure_keys();

        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .expect("run lock poisoned")
            .take()
            .ok_or(ConnError::AlreadyRunning)?;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.shared.killed.load(Ordering::SeqCst) {
                self.destroy_all_rooms().await;
                return Ok(());
            }

            *self.shared.started.lock().expect("clock lock poisoned") = Instant::now();

            match self.rejoin_persisted().await {
                Ok(()) => {
                    self.shared.bus.emit(Event {
                        kind: EventKind::Connected,
                        ..Default::default()
                    });
                    backoff = INITIAL_BACKOFF;

                    tokio::select! {
                        fatal = fatal_rx.recv() => {
                            if let Some((room, err)) = fatal {
                                warn!(room = %room, error = %err, "room failed, recycling connection");
                            }
                        }
                        _ = self.shared.kill.notified() => {}
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }

            self.destroy_all_rooms().await;
            // rooms torn down above may have reported their own failures
            while fatal_rx.try_recv().is_ok() {}

            if self.shared.killed.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.shared.bus.emit(Event {
                kind: EventKind::Disconnected,
                ..Default::default()
            });

            warn!(seconds = backoff.as_secs_f64(), "waiting to reconnect");
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = self.shared.kill.notified() => {}
            }
            backoff = backoff.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF);
        }
    }

    /// Stop reconnecting and tear everything down. Idempotent; `run`
    /// returns `Ok` shortly after.
    pub fn disconnect(&self) {
        if !self.shared.killed.swap(true, Ordering::SeqCst) {
            info!("disconnect requested");
            // notify_one stores a permit, so a disconnect that lands
            // between two waits is not lost
            self.shared.kill.notify_one();
        }
    }

    /// Join `room` under `nick`. A no-op if the room is already joined.
    pub async fn join_room(&self, room: &str, nick: &str) -> Result<(), ConnError> {
        {
            let rooms = self.shared.rooms.lock().await;
            if rooms.contains_key(room) {
                return Ok(());
            }
        }

        // dial outside the lock; a concurrent join may beat us to it
        let handle = self.spawn_room(room, nick).await?;
        let stale = {
            let mut rooms = self.shared.rooms.lock().await;
            if rooms.contains_key(room) {
                Some(handle)
            } else {
                rooms.insert(room.to_string(), handle);
                self.store_rooms(&rooms);
                None
            }
        };
        if let Some(stale) = stale {
            stale.leave().await;
        }
        Ok(())
    }

    /// Leave `room`, announcing departure and releasing its socket.
    pub async fn leave_room(&self, room: &str) -> Result<(), ConnError> {
        let handle = {
            let mut rooms = self.shared.rooms.lock().await;
            let handle = rooms
                .remove(room)
                .ok_or_else(|| ConnError::NoSuchRoom(room.to_string()))?;
            self.store_rooms(&rooms);
            handle
        };
        handle.leave().await;
        Ok(())
    }

    /// Handle to a joined room.
    pub async fn room(&self, name: &str) -> Option<RoomHandle> {
        self.shared.rooms.lock().await.get(name).cloned()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.shared.rooms.lock().await.keys().cloned().collect()
    }

    /// Send a UTF-8 group message to `room`.
    pub async fn gm(&self, room: &str, body: &str) -> Result<(), ConnError> {
        self.group(room, body.as_bytes().to_vec()).await
    }

    /// Send raw group bytes to `room`.
    pub async fn group(&self, room: &str, payload: Vec<u8>) -> Result<(), ConnError> {
        self.require_room(room).await?.group(payload).await
    }

    /// Send a direct message to `user` in `room`.
    pub async fn dm(&self, room: &str, user: &str, text: &str) -> Result<(), ConnError> {
        self.require_room(room).await?.dm(user, text).await
    }

    /// Start socialist-millionaire verification with `user`.
    pub async fn ask(
        &self,
        room: &str,
        user: &str,
        question: &str,
        answer: &str,
    ) -> Result<(), ConnError> {
        self.require_room(room).await?.ask(user, question, answer).await
    }

    /// Answer a pending verification question from `user`.
    pub async fn answer(&self, room: &str, user: &str, answer: &str) -> Result<(), ConnError> {
        self.require_room(room).await?.answer(user, answer).await
    }

    /// Persist the moderator fingerprint list shared by cooperating
    /// clients.
    pub fn set_mods(&self, fingerprints: &[String]) {
        if let Ok(encoded) = serde_json::to_string_pretty(fingerprints) {
            self.shared.db.store(KEY_MODS, &encoded);
        }
    }

    pub fn mods(&self) -> Vec<String> {
        self.shared.mods()
    }

    /// Set the display color (`#RRGGBB`), persist it, and broadcast it to
    /// every active room.
    pub async fn set_color(&self, color: &str) -> Result<(), ConnError> {
        let rgb =
            bex::parse_color(color).ok_or_else(|| ConnError::InvalidColor(color.to_string()))?;
        self.shared.db.store(KEY_COLOR, color);

        if self.shared.options.bex_disabled {
            return Ok(());
        }
        let handles: Vec<RoomHandle> =
            self.shared.rooms.lock().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.send_bex(vec![Record::SetColor { rgb }]).await;
        }
        Ok(())
    }

    /// Export the base64 identity secret for backup.
    pub fn save_profile(&self) -> Option<String> {
        self.shared.db.load(KEY_IDENTITY)
    }

    async fn require_room(&self, room: &str) -> Result<RoomHandle, ConnError> {
        self.room(room)
            .await
            .ok_or_else(|| ConnError::NoSuchRoom(room.to_string()))
    }

    /// Lazily generate the identity secret and, when a pairwise provider
    /// is configured, its long-term key.
    fn ensure_keys(&self) {
        let db = &self.shared.db;
        if db.load(KEY_IDENTITY).unwrap_or_default().is_empty() {
            let mut secret = [0u8; 32];
            OsRng.fill_bytes(&mut secret);
            db.store(KEY_IDENTITY, &BASE64.encode(secret));
            info!("generated fresh identity key");
        }

        if !self.shared.options.dm_disabled {
            if let Some(provider) = &self.shared.options.pairwise {
                if db.load(KEY_PAIRWISE).unwrap_or_default().is_empty() {
                    db.store(KEY_PAIRWISE, &provider.generate_key());
                    info!("generated fresh pairwise key");
                }
            }
        }
    }

    fn identity_secret(&self) -> Option<[u8; 32]> {
        let raw = self.shared.db.load(KEY_IDENTITY)?;
        let decoded = BASE64.decode(raw.trim()).ok()?;
        decoded.try_into().ok()
    }

    async fn spawn_room(&self, name: &str, nick: &str) -> Result<RoomHandle, ConnError> {
        self.ensure_keys();
        let session = Session::new(nick, self.identity_secret());

        let options = &self.shared.options;
        let transport = match options.transport {
            TransportKind::Modern => RoomTransport::Modern(ModernWs::dial(&options.url).await?),
            TransportKind::Legacy => RoomTransport::Legacy(
                LegacyWs::dial(
                    &options.url,
                    &options.host,
                    &options.conference,
                    name,
                    nick,
                )
                .await?,
            ),
        };

        info!(room = name, nick, "joining room");
        Ok(room::spawn(self.shared.clone(), name, nick, session, transport))
    }

    async fn rejoin_persisted(&self) -> Result<(), ConnError> {
        let persisted = self.load_rooms();
        for (room, nick) in persisted {
            self.join_room(&room, &nick).await?;
        }
        Ok(())
    }

    async fn destroy_all_rooms(&self) {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.shared.rooms.lock().await;
            rooms.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.leave().await;
        }
    }

    fn load_rooms(&self) -> HashMap<String, String> {
        self.shared
            .db
            .load(KEY_ROOMS)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn store_rooms(&self, rooms: &HashMap<String, RoomHandle>) {
        let map: HashMap<&str, &str> = rooms
            .iter()
            .map(|(room, handle)| (room.as_str(), handle.nick.as_str()))
            .collect();
        if let Ok(encoded) = serde_json::to_string_pretty(&map) {
            self.shared.db.store(KEY_ROOMS, &encoded);
        }
    }
}

/// Burst our color (and bot flag, unless marked human) at whoever just
/// appeared. The BEX batcher coalesces these into one wire message.
fn introduction(shared: &Weak<Shared>, event: Event) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if shared.options.bex_disabled {
        return;
    }

    tokio::spawn(async move {
        let color = shared.color();
        let mut records = Vec::new();
        if let Some(rgb) = bex::parse_color(&color) {
            records.push(Record::SetColor { rgb });
        }
        if !shared.options.human {
            records.push(Record::FlagMeAsBot);
        }
        if records.is_empty() {
            return;
        }

        let handle = shared.rooms.lock().await.get(&event.room).cloned();
        match handle {
            Some(handle) => {
                if handle.send_bex(records).await.is_err() {
                    debug!(room = %event.room, "introduction raced room shutdown");
                }
            }
            None => debug!(room = %event.room, "introduction for unknown room"),
        }
    });
}
