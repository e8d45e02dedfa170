//! Room coordinator: one actor per joined room.
//!
//! The actor owns the room's transport socket, its multiparty session and
//! its member table; callers enqueue requests over the command channel, so
//! every mutation is serialized on one task. A companion task batches
//! outbound BEX records into as few wire messages as the server's flood
//! heuristics allow.
//!
//! Lifecycle: `Joining` until the roster ack arrives, then `Joined`;
//! `Leaving` on an explicit leave; `Dead` once the socket is closed.
//! Transport failures are reported to the supervisor, which owns
//! reconnection policy.

use crate::bex::{self, Record};
use crate::conn::{ConnError, Shared};
use crate::db::KEY_PAIRWISE;
use crate::multiparty::{Received, Session};
use crate::pairwise::{prepare_answer, PairwiseSession, SmpEvent};
use crate::transport::ws::RoomTransport;
use crate::transport::{Frame, TransportError};
use crate::types::{Event, EventKind, IceCandidate};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Delay between joining a room and publishing our public key, giving the
/// server time to deliver the roster first.
pub(crate) const KEY_PUBLISH_DELAY: Duration = Duration::from_millis(200);

/// Quiet period between the join ack and the `RoomJoined` event, so the
/// initial burst of key exchanges settles first.
const ROOM_JOINED_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Small defer before announcing a newly established peer.
const USER_JOINED_DELAY: Duration = Duration::from_millis(200);

const BEX_WINDOW_BASE: Duration = Duration::from_millis(100);
const BEX_WINDOW_MAX: Duration = Duration::from_millis(2000);
const BEX_WINDOW_GROWTH: Duration = Duration::from_millis(900);
const BEX_WINDOW_SHRINK: f64 = 0.75;
const BEX_CHUNK_RECORDS: usize = 2;
/// Pacing between chunks, per byte of encoded chunk.
const BEX_PACE_PER_BYTE: Duration = Duration::from_micros(1200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Joining,
    Joined,
    Leaving,
    Dead,
}

/// A peer currently present in the room.
pub struct Member {
    pub nick: String,
    pub is_bot: bool,
    pairwise: Option<Box<dyn PairwiseSession>>,
}

impl Member {
    fn new(nick: String) -> Self {
        Member {
            nick,
            is_bot: false,
            pairwise: None,
        }
    }
}

pub(crate) enum RoomCmd {
    /// Encrypt and send a group payload.
    Group(Vec<u8>),
    Dm {
        to: String,
        text: String,
    },
    BexPrivate {
        to: String,
        records: Vec<Record>,
    },
    Blacklist(String),
    Unblacklist(String),
    ClearBlacklist,
    NamesByFingerprint {
        fp: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    IsMod {
        user: String,
        reply: oneshot::Sender<bool>,
    },
    ModerationTable {
        key: String,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    SmpAsk {
        user: String,
        question: String,
        answer: String,
    },
    SmpAnswer {
        user: String,
        answer: String,
    },
    Usernames(oneshot::Sender<Vec<String>>),
    Fingerprint {
        user: Option<String>,
        spaced: bool,
        reply: oneshot::Sender<Option<String>>,
    },
    PublishKey,
    EmitRoomJoined,
    Leave,
}

/// Cheap cloneable handle to a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    pub name: String,
    pub nick: String,
    cmd: mpsc::Sender<RoomCmd>,
    bex: mpsc::Sender<Vec<Record>>,
    bex_timeout: mpsc::Sender<Duration>,
}

impl RoomHandle {
    async fn send(&self, cmd: RoomCmd) -> Result<(), ConnError> {
        self.cmd.send(cmd).await.map_err(|_| ConnError::RoomClosed)
    }

    /// Send raw bytes to the group channel, encrypted to every peer.
    pub async fn group(&self, payload: Vec<u8>) -> Result<(), ConnError> {
        self.send(RoomCmd::Group(payload)).await
    }

    /// Send a UTF-8 text message to the group channel.
    pub async fn gm(&self, body: &str) -> Result<(), ConnError> {
        self.group(body.as_bytes().to_vec()).await
    }

    /// Queue BEX records on the group batcher.
    pub async fn send_bex(&self, records: Vec<Record>) -> Result<(), ConnError> {
        self.bex.send(records).await.map_err(|_| ConnError::RoomClosed)
    }

    /// Extend the batcher's next flush window, deferring BEX traffic.
    pub async fn add_bex_timeout(&self, extra: Duration) -> Result<(), ConnError> {
        self.bex_timeout
            .send(extra)
            .await
            .map_err(|_| ConnError::RoomClosed)
    }

    /// Send BEX records to a single member over the private channel.
    pub async fn send_bex_private(&self, to: &str, records: Vec<Record>) -> Result<(), ConnError> {
        self.send(RoomCmd::BexPrivate {
            to: to.to_string(),
            records,
        })
        .await
    }

    /// Send a direct message to a member.
    pub async fn dm(&self, to: &str, text: &str) -> Result<(), ConnError> {
        self.send(RoomCmd::Dm {
            to: to.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// Stop encrypting to `nick` without forgetting their key.
    pub async fn blacklist(&self, nick: &str) -> Result<(), ConnError> {
        self.send(RoomCmd::Blacklist(nick.to_string())).await
    }

    pub async fn unblacklist(&self, nick: &str) -> Result<(), ConnError> {
        self.send(RoomCmd::Unblacklist(nick.to_string())).await
    }

    pub async fn clear_blacklist(&self) -> Result<(), ConnError> {
        self.send(RoomCmd::ClearBlacklist).await
    }

    /// Signal that we started typing in the group channel.
    pub async fn send_group_composing(&self) -> Result<(), ConnError> {
        self.send_bex(vec![Record::Composing]).await
    }

    /// Signal that we stopped typing in the group channel.
    pub async fn send_group_paused(&self) -> Result<(), ConnError> {
        self.send_bex(vec![Record::Paused]).await
    }

    /// Signal typing to one member over the private channel.
    pub async fn send_private_composing(&self, to: &str) -> Result<(), ConnError> {
        self.send_bex_private(to, vec![Record::Composing]).await
    }

    pub async fn send_private_paused(&self, to: &str) -> Result<(), ConnError> {
        self.send_bex_private(to, vec![Record::Paused]).await
    }

    /// Peers whose key matches `fp`, sorted.
    pub async fn names_by_fingerprint(&self, fp: &str) -> Result<Vec<String>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCmd::NamesByFingerprint {
            fp: fp.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ConnError::RoomClosed)
    }

    /// True when `user`'s fingerprint is on the shared moderator list.
    pub async fn is_mod(&self, user: &str) -> Result<bool, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCmd::IsMod {
            user: user.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ConnError::RoomClosed)
    }

    /// Sorted entries of a moderation table announced by a moderator.
    pub async fn moderation_table(&self, key: &str) -> Result<Option<Vec<String>>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCmd::ModerationTable {
            key: key.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ConnError::RoomClosed)
    }

    /// Start socialist-millionaire verification with `user`.
    pub async fn ask(&self, user: &str, question: &str, answer: &str) -> Result<(), ConnError> {
        self.send(RoomCmd::SmpAsk {
            user: user.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
        })
        .await
    }

    /// Answer a pending verification question from `user`.
    pub async fn answer(&self, user: &str, answer: &str) -> Result<(), ConnError> {
        self.send(RoomCmd::SmpAnswer {
            user: user.to_string(),
            answer: answer.to_string(),
        })
        .await
    }

    /// Sorted nicks of every peer the session knows.
    pub async fn usernames(&self) -> Result<Vec<String>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCmd::Usernames(tx)).await?;
        rx.await.map_err(|_| ConnError::RoomClosed)
    }

    /// Key fingerprint of `user`, or our own when `None`.
    pub async fn fingerprint(&self, user: Option<&str>) -> Result<Option<String>, ConnError> {
        self.query_fingerprint(user, false).await
    }

    /// Fingerprint grouped in blocks of eight for human comparison.
    pub async fn fingerprint_spaced(&self, user: Option<&str>) -> Result<Option<String>, ConnError> {
        self.query_fingerprint(user, true).await
    }

    async fn query_fingerprint(
        &self,
        user: Option<&str>,
        spaced: bool,
    ) -> Result<Option<String>, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCmd::Fingerprint {
            user: user.map(str::to_string),
            spaced,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ConnError::RoomClosed)
    }

    /// Announce departure and shut the actor down.
    pub async fn leave(&self) {
        let _ = self.cmd.send(RoomCmd::Leave).await;
    }
}

/// Wire a new room actor and its BEX batcher onto the runtime.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    name: &str,
    nick: &str,
    session: Session,
    transport: RoomTransport,
) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (bex_tx, bex_rx) = mpsc::channel(16);
    let (timeout_tx, timeout_rx) = mpsc::channel(16);

    tokio::spawn(bex_transmitter(bex_rx, timeout_rx, cmd_tx.clone()));

    let publish = cmd_tx.clone();
    tokio::spawn(async move {
        sleep(KEY_PUBLISH_DELAY).await;
        let _ = publish.send(RoomCmd::PublishKey).await;
    });

    let task = RoomTask {
        name: name.to_string(),
        nick: nick.to_string(),
        session,
        members: HashMap::new(),
        moderation_tables: HashMap::new(),
        transport,
        shared,
        cmd_tx: cmd_tx.clone(),
        phase: Phase::Joining,
        roster_seen: false,
    };
    tokio::spawn(task.run(cmd_rx));

    RoomHandle {
        name: name.to_string(),
        nick: nick.to_string(),
        cmd: cmd_tx,
        bex: bex_tx,
        bex_timeout: timeout_tx,
    }
}

struct RoomTask {
    name: String,
    nick: String,
    session: Session,
    members: HashMap<String, Member>,
    moderation_tables: HashMap<String, BTreeSet<String>>,
    transport: RoomTransport,
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<RoomCmd>,
    phase: Phase,
    roster_seen: bool,
}

impl RoomTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RoomCmd>) {
        let join = Frame::Join {
            name: self.nick.clone(),
            room: self.name.clone(),
        };
        if let Err(e) = self.transport.send_frame(&join).await {
            self.fatal(e).await;
            return;
        }

        loop {
            tokio::select! {
                frame = self.transport.recv_frame() => match frame {
                    Ok(Frame::Disconnected) => {
                        self.fatal(TransportError::Closed).await;
                        return;
                    }
                    Ok(frame) => {
                        if let Err(e) = self.handle_frame(frame).await {
                            self.fatal(e).await;
                            return;
                        }
                    }
                    Err(e) => {
                        self.fatal(e).await;
                        return;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(RoomCmd::Leave) => {
                        self.leave().await;
                        return;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.handle_cmd(cmd).await {
                            self.fatal(e).await;
                            return;
                        }
                    }
                },
            }
        }
    }

    async fn fatal(&mut self, err: TransportError) {
        warn!(room = %self.name, error = %err, "room transport failed");
        self.phase = Phase::Dead;
        self.transport.close().await;
        self.shared.report_fatal(&self.name, err);
    }

    async fn leave(&mut self) {
        self.phase = Phase::Leaving;
        let _ = self
            .transport
            .send_frame(&Frame::Leave {
                name: String::new(),
            })
            .await;
        self.transport.close().await;
        self.phase = Phase::Dead;
    }

    fn emit(&self, mut event: Event) {
        event.room = self.name.clone();
        self.shared.bus.emit(event);
    }

    async fn transmit_group(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let text = String::from_utf8_lossy(&payload).into_owned();
        self.transport
            .send_frame(&Frame::Group {
                name: String::new(),
                text,
            })
            .await
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Roster { users } => {
                debug!(room = %self.name, peers = users.len(), "roster received");
                if self.phase == Phase::Joining {
                    self.phase = Phase::Joined;
                }
                if !self.roster_seen {
                    self.roster_seen = true;
                    let cmd = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        sleep(ROOM_JOINED_DEBOUNCE).await;
                        let _ = cmd.send(RoomCmd::EmitRoomJoined).await;
                    });
                }
                Ok(())
            }
            Frame::Join { name, .. } => {
                // membership becomes real when the peer's key arrives
                debug!(room = %self.name, user = %name, "join announced");
                Ok(())
            }
            Frame::Leave { name } => {
                if !name.is_empty() {
                    self.members.remove(&name);
                    self.session.destroy_user(&name);
                    self.emit(Event {
                        kind: EventKind::UserLeft,
                        user: name,
                        ..Default::default()
                    });
                }
                Ok(())
            }
            Frame::Group { name, text } => self.handle_group(name, text).await,
            Frame::Private { from, text, .. } => self.handle_private(from, text).await,
            Frame::Error { error } => {
                if error == "Nickname in use." {
                    self.emit(Event {
                        kind: EventKind::NicknameInUse,
                        ..Default::default()
                    });
                    Ok(())
                } else {
                    Err(TransportError::Server(error))
                }
            }
            Frame::NicknameInUse => {
                self.emit(Event {
                    kind: EventKind::NicknameInUse,
                    ..Default::default()
                });
                Ok(())
            }
            Frame::RateLimited => {
                self.emit(Event {
                    kind: EventKind::RateLimited,
                    ..Default::default()
                });
                Ok(())
            }
            Frame::Disconnected => Err(TransportError::Closed),
        }
    }

    async fn handle_group(&mut self, from: String, text: String) -> Result<(), TransportError> {
        match self.session.receive(&from, &text) {
            Err(e) => {
                // crypto failures drop the message, never the connection
                warn!(room = %self.name, user = %from, error = %e, "dropping group message");
                Ok(())
            }
            Ok(Received::None) => Ok(()),
            Ok(Received::Reply(payload)) => self.transmit_group(payload).await,
            Ok(Received::NewPeer(nick)) => {
                info!(room = %self.name, user = %nick, "peer established");
                self.members
                    .entry(nick.clone())
                    .or_insert_with(|| Member::new(nick.clone()));
                if !self.shared.suppressing_joins() {
                    self.shared.emit_later(
                        Event {
                            kind: EventKind::UserJoined,
                            room: self.name.clone(),
                            user: nick,
                            ..Default::default()
                        },
                        USER_JOINED_DELAY,
                    );
                }
                Ok(())
            }
            Ok(Received::Plaintext(data)) => {
                self.handle_plaintext(from, data);
                Ok(())
            }
        }
    }

    fn handle_plaintext(&mut self, from: String, data: Vec<u8>) {
        if bex::is_bex(&data) {
            if self.shared.options.bex_disabled {
                return;
            }
            match bex::decode(&data) {
                Ok(records) => self.handle_group_bex(&from, records),
                Err(e) => warn!(room = %self.name, user = %from, error = %e, "bad bex message"),
            }
        } else {
            self.emit(Event {
                kind: EventKind::GroupMessage,
                user: from,
                body: String::from_utf8_lossy(&data).into_owned(),
                ..Default::default()
            });
        }
    }

    fn handle_group_bex(&mut self, from: &str, records: Vec<Record>) {
        for record in records {
            match record {
                Record::FileAttachment(file) => self.emit(Event {
                    kind: EventKind::FileAttachment,
                    user: from.to_string(),
                    file: Some(file),
                    ..Default::default()
                }),
                Record::Composing => self.emit(Event {
                    kind: EventKind::Composing,
                    user: from.to_string(),
                    ..Default::default()
                }),
                Record::Paused => self.emit(Event {
                    kind: EventKind::Paused,
                    user: from.to_string(),
                    ..Default::default()
                }),
                Record::SetColor { rgb } => self.emit(Event {
                    kind: EventKind::ColorModify,
                    user: from.to_string(),
                    body: bex::render_color(rgb),
                    ..Default::default()
                }),
                Record::FlagMeAsBot => {
                    if let Some(member) = self.members.get_mut(from) {
                        member.is_bot = true;
                    }
                }
                Record::RtcOffer { target, sdp } if target == self.nick => self.emit(Event {
                    kind: EventKind::WebRtcOffer,
                    user: from.to_string(),
                    body: sdp,
                    ..Default::default()
                }),
                Record::RtcAnswer { target, sdp } if target == self.nick => self.emit(Event {
                    kind: EventKind::WebRtcAnswer,
                    user: from.to_string(),
                    body: sdp,
                    ..Default::default()
                }),
                Record::IceCandidate {
                    target,
                    candidate,
                    sdp_mline_index,
                    sdp_mid,
                } if target == self.nick => {
                    let body = serde_json::to_string(&IceCandidate {
                        data: candidate,
                        sdp_mid,
                        sdp_mline_index,
                    })
                    .unwrap_or_default();
                    self.emit(Event {
                        kind: EventKind::WebRtcIceCandidate,
                        user: from.to_string(),
                        body,
                        ..Default::default()
                    });
                }
                Record::RtcSignalCapability => self.emit(Event {
                    kind: EventKind::WebRtcCapable,
                    user: from.to_string(),
                    ..Default::default()
                }),
                Record::ModElected { target } => self.emit(Event {
                    kind: EventKind::SubscribedToModerator,
                    user: from.to_string(),
                    body: target,
                    ..Default::default()
                }),
                Record::SetModerationTable { key, entries } => {
                    if self.is_mod(from) {
                        self.moderation_tables
                            .insert(key, entries.into_iter().collect());
                    } else {
                        debug!(room = %self.name, user = %from, "moderation table from non-mod ignored");
                    }
                }
                other => {
                    debug!(room = %self.name, user = %from, record = ?other, "advisory bex record");
                }
            }
        }
    }

    fn is_mod(&self, user: &str) -> bool {
        match self.session.fingerprint(Some(user)) {
            Some(fp) => self.shared.mods().contains(&fp),
            None => false,
        }
    }

    async fn handle_private(&mut self, from: String, text: String) -> Result<(), TransportError> {
        if self.shared.options.dm_disabled {
            debug!(room = %self.name, user = %from, "dms are disabled");
            return Ok(());
        }
        if !self.members.contains_key(&from) {
            warn!(room = %self.name, user = %from, "private message from unknown member");
            return Ok(());
        }

        let (plain, fragments, smp_events) = {
            let Some(member) = self.members.get_mut(&from) else {
                return Ok(());
            };
            if member.pairwise.is_none() {
                if let Some(provider) = &self.shared.options.pairwise {
                    let key = self.shared.db.load(KEY_PAIRWISE).unwrap_or_default();
                    member.pairwise = Some(provider.session(&key));
                }
            }
            match member.pairwise.as_mut() {
                Some(pw) => match pw.receive(&text) {
                    Ok((plain, fragments)) => {
                        let mut events = Vec::new();
                        while let Some(event) = pw.poll_event() {
                            events.push(event);
                        }
                        (plain, fragments, events)
                    }
                    Err(e) => {
                        warn!(room = %self.name, user = %from, error = %e, "dropping private message");
                        return Ok(());
                    }
                },
                None => (Some(text), Vec::new(), Vec::new()),
            }
        };

        for fragment in fragments {
            self.transport
                .send_frame(&Frame::Private {
                    from: String::new(),
                    to: from.clone(),
                    text: fragment,
                })
                .await?;
        }

        for event in smp_events {
            let (kind, body) = match event {
                SmpEvent::Question(q) => (EventKind::SmpQuestion, q),
                SmpEvent::Success => (EventKind::SmpSuccess, String::new()),
                SmpEvent::Failure => (EventKind::SmpFailure, String::new()),
            };
            self.emit(Event {
                kind,
                user: from.clone(),
                body,
                ..Default::default()
            });
        }

        if let Some(body) = plain {
            if !body.is_empty() {
                self.handle_private_plain(from, body);
            }
        }
        Ok(())
    }

    fn handle_private_plain(&mut self, from: String, body: String) {
        if let Ok(decoded) = BASE64.decode(&body) {
            if bex::is_bex(&decoded) {
                if self.shared.options.bex_disabled {
                    return;
                }
                match bex::decode(&decoded) {
                    Ok(records) => self.handle_private_bex(&from, records),
                    Err(e) => warn!(room = %self.name, user = %from, error = %e, "bad private bex"),
                }
                return;
            }
        }
        self.emit(Event {
            kind: EventKind::PrivateMessage,
            private: true,
            user: from,
            body,
            ..Default::default()
        });
    }

    /// Only typing indicators and attachments are defined for the private
    /// channel.
    fn handle_private_bex(&mut self, from: &str, records: Vec<Record>) {
        for record in records {
            match record {
                Record::Composing => self.emit(Event {
                    kind: EventKind::Composing,
                    private: true,
                    user: from.to_string(),
                    ..Default::default()
                }),
                Record::Paused => self.emit(Event {
                    kind: EventKind::Paused,
                    private: true,
                    user: from.to_string(),
                    ..Default::default()
                }),
                Record::FileAttachment(file) => self.emit(Event {
                    kind: EventKind::FileAttachment,
                    private: true,
                    user: from.to_string(),
                    file: Some(file),
                    ..Default::default()
                }),
                other => {
                    debug!(room = %self.name, user = %from, record = ?other, "ignoring private bex record");
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: RoomCmd) -> Result<(), TransportError> {
        match cmd {
            RoomCmd::Group(payload) => match self.session.send(&payload) {
                Ok(wire) => self.transmit_group(wire).await,
                Err(e) => {
                    warn!(room = %self.name, error = %e, "group encryption failed");
                    Ok(())
                }
            },
            RoomCmd::Dm { to, text } => self.send_dm(&to, &text).await,
            RoomCmd::BexPrivate { to, records } => {
                let encoded = BASE64.encode(bex::encode(&records));
                self.send_dm(&to, &encoded).await
            }
            RoomCmd::Blacklist(nick) => {
                self.session.blacklist_user(&nick);
                Ok(())
            }
            RoomCmd::Unblacklist(nick) => {
                self.session.unblacklist_user(&nick);
                Ok(())
            }
            RoomCmd::ClearBlacklist => {
                self.session.clear_blacklist();
                Ok(())
            }
            RoomCmd::NamesByFingerprint { fp, reply } => {
                let _ = reply.send(self.session.names_by_fingerprint(&fp));
                Ok(())
            }
            RoomCmd::IsMod { user, reply } => {
                let _ = reply.send(self.is_mod(&user));
                Ok(())
            }
            RoomCmd::ModerationTable { key, reply } => {
                let table = self
                    .moderation_tables
                    .get(&key)
                    .map(|set| set.iter().cloned().collect());
                let _ = reply.send(table);
                Ok(())
            }
            RoomCmd::SmpAsk {
                user,
                question,
                answer,
            } => self.smp(&user, Some(question), answer, true).await,
            RoomCmd::SmpAnswer { user, answer } => self.smp(&user, None, answer, false).await,
            RoomCmd::Usernames(reply) => {
                let _ = reply.send(self.session.sorted_names());
                Ok(())
            }
            RoomCmd::Fingerprint {
                user,
                spaced,
                reply,
            } => {
                let user = user.as_deref();
                let fp = if spaced {
                    self.session.fingerprint_spaced(user)
                } else {
                    self.session.fingerprint(user)
                };
                let _ = reply.send(fp);
                Ok(())
            }
            RoomCmd::PublishKey => {
                match (
                    self.session.public_key_request(""),
                    self.session.public_key_message(),
                ) {
                    (Ok(request), Ok(announce)) => {
                        self.transmit_group(request).await?;
                        self.transmit_group(announce).await
                    }
                    _ => Ok(()),
                }
            }
            RoomCmd::EmitRoomJoined => {
                self.emit(Event {
                    kind: EventKind::RoomJoined,
                    ..Default::default()
                });
                Ok(())
            }
            RoomCmd::Leave => Ok(()),
        }
    }

    async fn send_dm(&mut self, to: &str, text: &str) -> Result<(), TransportError> {
        if self.shared.options.dm_disabled {
            return Ok(());
        }

        let fragments = {
            let member = self.members.get_mut(to);
            match member {
                Some(member) => {
                    if member.pairwise.is_none() {
                        if let Some(provider) = &self.shared.options.pairwise {
                            let key = self.shared.db.load(KEY_PAIRWISE).unwrap_or_default();
                            member.pairwise = Some(provider.session(&key));
                        }
                    }
                    match member.pairwise.as_mut() {
                        Some(pw) => match pw.send(text.as_bytes()) {
                            Ok(fragments) => fragments,
                            Err(e) => {
                                warn!(room = %self.name, user = %to, error = %e, "pairwise send failed");
                                return Ok(());
                            }
                        },
                        None => vec![text.to_string()],
                    }
                }
                None => vec![text.to_string()],
            }
        };

        for fragment in fragments {
            self.transport
                .send_frame(&Frame::Private {
                    from: String::new(),
                    to: to.to_string(),
                    text: fragment,
                })
                .await?;
        }
        Ok(())
    }

    async fn smp(
        &mut self,
        user: &str,
        question: Option<String>,
        answer: String,
        asking: bool,
    ) -> Result<(), TransportError> {
        let my_fp = self.session.fingerprint(None).unwrap_or_default();
        let peer_fp = self.session.fingerprint(Some(user)).unwrap_or_default();
        let prepared = prepare_answer(&answer, asking, &my_fp, &peer_fp);

        let fragments = {
            let Some(member) = self.members.get_mut(user) else {
                warn!(room = %self.name, user, "cannot verify unknown member");
                return Ok(());
            };
            if member.pairwise.is_none() {
                if let Some(provider) = &self.shared.options.pairwise {
                    let key = self.shared.db.load(KEY_PAIRWISE).unwrap_or_default();
                    member.pairwise = Some(provider.session(&key));
                }
            }
            let Some(pw) = member.pairwise.as_mut() else {
                warn!(room = %self.name, user, "no pairwise provider configured");
                return Ok(());
            };
            let result = match question {
                Some(q) => pw.smp_start(&q, &prepared),
                None => pw.smp_answer(&prepared),
            };
            match result {
                Ok(fragments) => fragments,
                Err(e) => {
                    warn!(room = %self.name, user, error = %e, "verification failed to start");
                    return Ok(());
                }
            }
        };

        for fragment in fragments {
            self.transport
                .send_frame(&Frame::Private {
                    from: String::new(),
                    to: user.to_string(),
                    text: fragment,
                })
                .await?;
        }
        Ok(())
    }
}

/// Accumulates queued BEX records and flushes them on an adaptive window:
/// the window shrinks toward the base while idle and backs off toward the
/// cap when busy. Oversized batches are split into two-record chunks with
/// per-byte pacing between them to stay under server flood heuristics.
async fn bex_transmitter(
    mut records_rx: mpsc::Receiver<Vec<Record>>,
    mut timeout_rx: mpsc::Receiver<Duration>,
    cmd: mpsc::Sender<RoomCmd>,
) {
    let mut pending: Vec<Record> = Vec::new();
    let mut window = BEX_WINDOW_BASE;

    loop {
        tokio::select! {
            _ = sleep(window) => {
                if pending.is_empty() {
                    window = window.mul_f64(BEX_WINDOW_SHRINK).max(BEX_WINDOW_BASE);
                    continue;
                }
                if pending.len() > BEX_CHUNK_RECORDS {
                    for chunk in pending.chunks(BEX_CHUNK_RECORDS) {
                        let payload = bex::encode(chunk);
                        let pace = BEX_PACE_PER_BYTE * payload.len() as u32;
                        if cmd.send(RoomCmd::Group(payload)).await.is_err() {
                            return;
                        }
                        sleep(pace).await;
                    }
                } else if cmd.send(RoomCmd::Group(bex::encode(&pending))).await.is_err() {
                    return;
                }
                pending.clear();
                window = (window + BEX_WINDOW_GROWTH).min(BEX_WINDOW_MAX);
            }
            extra = timeout_rx.recv() => match extra {
                Some(extra) => window += extra,
                None => return,
            },
            records = records_rx.recv() => match records {
                Some(records) => pending.extend(records),
                None => return,
            },
            _ = cmd.closed() => return,
        }
    }
}
