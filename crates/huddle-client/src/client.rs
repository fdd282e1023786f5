//! Collaboration client.
//!
//! A single background task owns the signaling channel, the negotiation
//! engine, local media and room activity. The application talks to it with
//! [`Command`]s and listens to [`RoomEvent`]s:
//!
//! ```rust,no_run
//! use huddle_client::{ClientConfig, CollabClient};
//! use huddle_client::memory::{MemoryDevices, MemoryNetwork};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> huddle_client::Result<()> {
//!     let mut client = CollabClient::new(
//!         ClientConfig::new("ws://localhost:5000/ws"),
//!         Arc::new(MemoryDevices::new()),
//!         Arc::new(MemoryNetwork::new()),
//!     )?;
//!     let mut events = client.subscribe();
//!     client.connect()?;
//!     client.join("room-1", "alice")?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Channel loss closes every session. The task reconnects with exponential
//! backoff (2^n seconds, capped at 30) and re-joins the room it was in.

use crate::activity::RoomActivity;
use crate::config::ClientConfig;
use crate::engine::{NegotiationEngine, SessionEvent};
use crate::error::{ClientError, MediaAccessError, Result};
use crate::gateway::SignalingChannel;
use crate::media::{LocalMediaController, MediaDevices};
use crate::transport::{PeerConnectionFactory, TransportEvent};
use crate::vad::{spawn_detector, VoiceSample};
use huddle_common::protocol::{ChatMessage, ClientMessage, ParticipantInfo, ServerMessage, Stroke};
use huddle_common::{ConnectionId, RoomId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Clone)]
pub enum Command {
    /// Acquire media and join a room, leaving any other room first.
    Join { room_id: RoomId, display_name: String },
    /// Hang up: close every session and release local media.
    Leave,
    SetMuted(bool),
    SetGain(f32),
    StartScreenShare,
    StopScreenShare,
    SendChat { text: String, color: Option<String> },
    Draw(Stroke),
    /// Clear the local board.
    ClearBoard,
    UpdateNote(String),
    SetBoardActive(bool),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Connected { connection_id: ConnectionId },
    Membership { room_id: RoomId, participants: Vec<ParticipantInfo> },
    RoomFull { room_id: RoomId, max_participants: usize },
    Session(SessionEvent),
    Chat(ChatMessage),
    Stroke { from: ConnectionId, stroke: Stroke },
    NoteChanged { from: ConnectionId, html: String },
    SpeakerChanged(Option<ConnectionId>),
    BoardUserChanged(Option<ConnectionId>),
    ScreenSharerChanged(Option<ConnectionId>),
    /// Local microphone level in [0, 1].
    VoiceLevel(f32),
    MediaError(MediaAccessError),
    ServerError { code: u32, message: String },
    ChannelLost { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted; the client task has stopped.
    Disconnected,
}

pub struct CollabClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RoomEvent>,
    runtime: Option<(Runtime, mpsc::UnboundedReceiver<Command>)>,
    task: Option<JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let runtime = Runtime::new(endpoint, config, devices, transport, events.clone());
        Ok(Self {
            commands,
            events,
            runtime: Some((runtime, command_rx)),
            task: None,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Spawn the background task. Returns immediately; progress is reported
    /// through [`subscribe`](Self::subscribe).
    pub fn connect(&mut self) -> Result<()> {
        let (runtime, command_rx) = self
            .runtime
            .take()
            .ok_or_else(|| ClientError::ChannelLost("client already started".into()))?;
        self.task = Some(tokio::spawn(runtime.run(command_rx)));
        Ok(())
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ChannelLost("client task stopped".into()))
    }

    pub fn join(&self, room_id: impl Into<RoomId>, display_name: impl Into<String>) -> Result<()> {
        self.send(Command::Join {
            room_id: room_id.into(),
            display_name: display_name.into(),
        })
    }

    pub fn leave(&self) -> Result<()> {
        self.send(Command::Leave)
    }

    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(Command::SetMuted(muted))
    }

    pub fn set_gain(&self, gain: f32) -> Result<()> {
        self.send(Command::SetGain(gain))
    }

    pub fn start_screen_share(&self) -> Result<()> {
        self.send(Command::StartScreenShare)
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.send(Command::StopScreenShare)
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendChat {
            text: text.into(),
            color: None,
        })
    }

    pub fn draw(&self, stroke: Stroke) -> Result<()> {
        self.send(Command::Draw(stroke))
    }

    pub fn update_note(&self, html: impl Into<String>) -> Result<()> {
        self.send(Command::UpdateNote(html.into()))
    }

    pub fn set_board_active(&self, active: bool) -> Result<()> {
        self.send(Command::SetBoardActive(active))
    }

    /// Leave the room, release media and wait for the task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct JoinedRoom {
    room_id: RoomId,
    display_name: String,
}

enum Exit {
    Shutdown,
    Lost(String),
}

struct Runtime {
    endpoint: Url,
    config: ClientConfig,
    engine: NegotiationEngine,
    media: LocalMediaController,
    activity: RoomActivity,
    room: Option<JoinedRoom>,
    events: broadcast::Sender<RoomEvent>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    voice_tx: mpsc::UnboundedSender<VoiceSample>,
    voice_rx: mpsc::UnboundedReceiver<VoiceSample>,
    vad_task: Option<JoinHandle<()>>,
}

impl Runtime {
    fn new(
        endpoint: Url,
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn PeerConnectionFactory>,
        events: broadcast::Sender<RoomEvent>,
    ) -> Self {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (voice_tx, voice_rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            transport,
            outbound_tx.clone(),
            transport_tx,
            config.pending_candidate_limit,
        );
        Self {
            endpoint,
            config,
            engine,
            media: LocalMediaController::new(devices),
            activity: RoomActivity::new(),
            room: None,
            events,
            outbound_tx,
            outbound,
            transport_rx,
            voice_tx,
            voice_rx,
            vad_task: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempts = 0u32;
        loop {
            let exit = match SignalingChannel::connect(&self.endpoint).await {
                Ok(channel) => self.serve(channel, &mut commands, &mut attempts).await,
                Err(e) => Exit::Lost(e.to_string()),
            };

            let reason = match exit {
                Exit::Shutdown => return,
                Exit::Lost(reason) => reason,
            };
            self.channel_lost(reason);

            attempts += 1;
            if attempts > self.config.max_reconnect {
                tracing::error!("Max reconnect attempts reached, giving up");
                self.hang_up();
                self.emit(RoomEvent::Disconnected);
                return;
            }
            let delay = Duration::from_secs(u64::min(2u64.saturating_pow(attempts), 30));
            tracing::warn!(attempt = attempts, ?delay, "Reconnecting to relay");
            self.emit(RoomEvent::Reconnecting {
                attempt: attempts,
                delay,
            });

            let wake = tokio::time::sleep(delay);
            tokio::pin!(wake);
            loop {
                tokio::select! {
                    _ = &mut wake => break,
                    command = commands.recv() => match command {
                        None | Some(Command::Shutdown) => {
                            self.hang_up();
                            return;
                        }
                        Some(command) => self.on_command(command).await,
                    },
                }
            }
        }
    }

    async fn serve(
        &mut self,
        mut channel: SignalingChannel,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        attempts: &mut u32,
    ) -> Exit {
        match channel.next().await {
            Some(Ok(ServerMessage::Welcome {
                connection_id,
                ice_servers,
            })) => {
                tracing::info!(connection = %connection_id, "Connected to relay");
                self.engine.set_identity(connection_id, ice_servers);
                *attempts = 0;
                self.emit(RoomEvent::Connected { connection_id });
            }
            Some(Ok(other)) => return Exit::Lost(format!("expected welcome, got {other:?}")),
            Some(Err(e)) => return Exit::Lost(e.to_string()),
            None => return Exit::Lost("relay closed before welcome".into()),
        }

        if let Some(room) = &self.room {
            let rejoin = ClientMessage::Join {
                room_id: room.room_id.clone(),
                display_name: room.display_name.clone(),
            };
            if let Err(e) = channel.send(&rejoin).await {
                return Exit::Lost(e.to_string());
            }
        }

        loop {
            tokio::select! {
                inbound = channel.next() => match inbound {
                    Some(Ok(message)) => self.on_server_message(message).await,
                    Some(Err(ClientError::Json(e))) => {
                        tracing::warn!(error = %e, "Ignoring malformed relay frame");
                    }
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("relay closed the channel".into()),
                },
                Some(message) = self.outbound.recv() => {
                    if let Err(e) = channel.send(&message).await {
                        return Exit::Lost(e.to_string());
                    }
                }
                Some(event) = self.transport_rx.recv() => {
                    let events = self.engine.handle_transport_event(event).await;
                    self.emit_sessions(events);
                }
                Some(sample) = self.voice_rx.recv() => self.on_voice_sample(sample),
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        if let Some(room) = &self.room {
                            let leave = ClientMessage::Leave { room_id: room.room_id.clone() };
                            let _ = channel.send(&leave).await;
                        }
                        self.hang_up();
                        channel.close().await;
                        return Exit::Shutdown;
                    }
                    Some(command) => self.on_command(command).await,
                },
            }
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { .. } => {
                tracing::debug!("Ignoring repeated welcome");
            }
            ServerMessage::Membership {
                room_id,
                participants,
            } => {
                if !self.in_room(&room_id) {
                    return;
                }
                let events = self.engine.reconcile(&participants).await;
                let present: HashSet<ConnectionId> =
                    participants.iter().map(|p| p.connection_id).collect();
                self.activity.retain_present(&present);
                self.emit(RoomEvent::Membership {
                    room_id,
                    participants,
                });
                self.emit_sessions(events);
            }
            ServerMessage::RoomFull {
                room_id,
                max_participants,
            } => {
                tracing::warn!(room = %room_id, max_participants, "Room is full");
                if self.in_room(&room_id) {
                    self.hang_up();
                }
                self.emit(RoomEvent::RoomFull {
                    room_id,
                    max_participants,
                });
            }
            message @ (ServerMessage::SessionOffer { .. }
            | ServerMessage::SessionAnswer { .. }
            | ServerMessage::IceCandidate { .. }) => {
                let events = self.engine.handle_server_message(&message).await;
                self.emit_sessions(events);
            }
            ServerMessage::ChatMessage(chat) => {
                if self.in_room(&chat.room_id) {
                    self.activity.push_chat(chat.clone());
                    self.emit(RoomEvent::Chat(chat));
                }
            }
            ServerMessage::Draw {
                room_id,
                from,
                stroke,
            } => {
                if self.in_room(&room_id) {
                    let stroke = self.activity.apply_stroke(stroke).clone();
                    self.emit(RoomEvent::Stroke { from, stroke });
                }
            }
            ServerMessage::NoteUpdate {
                room_id,
                from,
                html,
            } => {
                if self.in_room(&room_id) && self.activity.update_note(&html) {
                    self.emit(RoomEvent::NoteChanged { from, html });
                }
            }
            ServerMessage::ScreenShareStart { room_id, from } => {
                self.on_screen_share(&room_id, from, true)
            }
            ServerMessage::ScreenShareStop { room_id, from } => {
                self.on_screen_share(&room_id, from, false)
            }
            ServerMessage::Speaking {
                room_id,
                from,
                active,
            } => {
                if self.in_room(&room_id) && self.activity.set_speaking(from, active) {
                    self.emit(RoomEvent::SpeakerChanged(self.activity.speaker()));
                }
            }
            ServerMessage::BoardActive {
                room_id,
                from,
                active,
            } => {
                if self.in_room(&room_id) && self.activity.set_board_active(from, active) {
                    self.emit(RoomEvent::BoardUserChanged(self.activity.board_user()));
                }
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!(code, %message, "Relay rejected a message");
                self.emit(RoomEvent::ServerError { code, message });
            }
        }
    }

    fn on_screen_share(&mut self, room_id: &RoomId, from: ConnectionId, active: bool) {
        if self.in_room(room_id) && self.activity.set_screen_sharing(from, active) {
            self.emit(RoomEvent::ScreenSharerChanged(self.activity.screen_sharer()));
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join {
                room_id,
                display_name,
            } => self.join(room_id, display_name).await,
            Command::Leave => {
                let Some(room) = &self.room else {
                    tracing::debug!("Leave without a room");
                    return;
                };
                self.signal(ClientMessage::Leave {
                    room_id: room.room_id.clone(),
                });
                self.hang_up();
            }
            Command::SetMuted(muted) => self.media.set_muted(muted, self.engine.sessions()),
            Command::SetGain(gain) => self.media.set_gain(gain),
            Command::StartScreenShare => self.start_screen_share().await,
            Command::StopScreenShare => {
                if self.media.stop_screen_share().is_none() {
                    return;
                }
                let events = self.engine.stop_screen_share().await;
                self.emit_sessions(events);
                if let Some(room_id) = self.room_id() {
                    self.signal(ClientMessage::ScreenShareStop { room_id });
                }
                if let Some(local) = self.engine.local_id() {
                    self.activity.set_screen_sharing(local, false);
                }
            }
            Command::SendChat { text, color } => {
                let Some(room) = &self.room else {
                    return self.emit(RoomEvent::ServerError {
                        code: 0,
                        message: ClientError::NotJoined.to_string(),
                    });
                };
                self.signal(ClientMessage::ChatMessage {
                    room_id: room.room_id.clone(),
                    text,
                    display_name: room.display_name.clone(),
                    color,
                    is_system: false,
                });
            }
            Command::Draw(stroke) => {
                if let Some(room_id) = self.room_id() {
                    self.activity.apply_stroke(stroke.clone());
                    self.signal(ClientMessage::Draw { room_id, stroke });
                }
            }
            Command::ClearBoard => self.activity.clear_board(),
            Command::UpdateNote(html) => {
                if let Some(room_id) = self.room_id() {
                    if self.activity.update_note(&html) {
                        self.signal(ClientMessage::NoteUpdate { room_id, html });
                    }
                }
            }
            Command::SetBoardActive(active) => {
                if let Some(room_id) = self.room_id() {
                    self.signal(ClientMessage::BoardActive { room_id, active });
                    if let Some(local) = self.engine.local_id() {
                        self.activity.set_board_active(local, active);
                    }
                }
            }
            // Handled by the select loops.
            Command::Shutdown => {}
        }
    }

    async fn join(&mut self, room_id: RoomId, display_name: String) {
        if let Some(current) = &self.room {
            if current.room_id != room_id {
                self.signal(ClientMessage::Leave {
                    room_id: current.room_id.clone(),
                });
                self.hang_up();
            }
        }

        match self.media.acquire().await {
            Ok(()) => {
                let events = self.engine.set_local_tracks(self.media.local_tracks()).await;
                self.emit_sessions(events);
                self.start_vad();
            }
            Err(e) => {
                // The room stays usable without media: chat, board, notes.
                tracing::warn!(error = %e, "Joining without local media");
                self.emit(RoomEvent::MediaError(e));
            }
        }

        self.signal(ClientMessage::Join {
            room_id: room_id.clone(),
            display_name: display_name.clone(),
        });
        self.room = Some(JoinedRoom {
            room_id,
            display_name,
        });
    }

    async fn start_screen_share(&mut self) {
        let Some(room_id) = self.room_id() else {
            tracing::debug!("Screen share requested outside a room");
            return;
        };
        match self.media.start_screen_share().await {
            Ok(track) => {
                let events = self.engine.start_screen_share(track).await;
                self.emit_sessions(events);
                self.signal(ClientMessage::ScreenShareStart { room_id });
                if let Some(local) = self.engine.local_id() {
                    self.activity.set_screen_sharing(local, true);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Screen capture failed");
                self.emit(RoomEvent::MediaError(e));
            }
        }
    }

    fn on_voice_sample(&mut self, sample: VoiceSample) {
        self.emit(RoomEvent::VoiceLevel(sample.level));
        let (Some(active), Some(room_id)) = (sample.transition, self.room_id()) else {
            return;
        };
        self.signal(ClientMessage::Speaking { room_id, active });
        if let Some(local) = self.engine.local_id() {
            if self.activity.set_speaking(local, active) {
                self.emit(RoomEvent::SpeakerChanged(self.activity.speaker()));
            }
        }
    }

    fn start_vad(&mut self) {
        if self.vad_task.is_some() {
            return;
        }
        if let Some(analyser) = self.media.analyser() {
            self.vad_task = Some(spawn_detector(
                analyser,
                self.media.subscribe_muted(),
                self.config.vad_interval,
                self.voice_tx.clone(),
            ));
        }
    }

    fn stop_vad(&mut self) {
        if let Some(task) = self.vad_task.take() {
            task.abort();
        }
    }

    /// Close every session and release local media. The only path that
    /// stops local tracks.
    fn hang_up(&mut self) {
        let events = self.engine.close_all();
        self.emit_sessions(events);
        self.engine.clear_local_media();
        self.stop_vad();
        self.media.release();
        self.activity.clear();
        self.room = None;
    }

    /// No session survives a channel loss. Media and the room are kept for
    /// the re-join.
    fn channel_lost(&mut self, reason: String) {
        tracing::warn!(%reason, "Signaling channel lost");
        let events = self.engine.reset();
        self.emit_sessions(events);
        while self.outbound.try_recv().is_ok() {}
        self.activity.retain_present(&HashSet::new());
        self.emit(RoomEvent::ChannelLost { reason });
    }

    fn in_room(&self, room_id: &RoomId) -> bool {
        self.room.as_ref().is_some_and(|r| &r.room_id == room_id)
    }

    fn room_id(&self) -> Option<RoomId> {
        self.room.as_ref().map(|r| r.room_id.clone())
    }

    fn signal(&self, message: ClientMessage) {
        let _ = self.outbound_tx.send(message);
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn emit_sessions(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.emit(RoomEvent::Session(event));
        }
    }
}
