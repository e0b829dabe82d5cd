use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{ErrorEvent, EventRegistry, SubscriptionId};
use crate::audio::{capture_loop, playback_loop, AudioOutlet, AudioSink, AudioSource, PlaybackQueue};
use crate::core::{
    ClientConfig,
    ConnectConfig,
    ConnectionState,
    ConnectionStats,
    Error,
    ErrorKind,
    Result,
    SessionInfo,
};
use crate::network::{ConnectionSupervisor, StatsRegistry, SupervisorExit, TransportChannel};
use crate::protocol::{
    AudioFrame,
    ChatTtsText,
    ClientRequest,
    Compression,
    FrameCodec,
    Header,
    MessageBody,
    PreparedFrame,
    RequestEvent,
    SessionEnd,
    SessionStart,
    TtsTrigger,
};
use crate::util::lock;

/// One live transport and the tasks bound to it
pub(crate) struct Link {
    pub(crate) id: u64,
    pub(crate) channel: Arc<TransportChannel>,
    pub(crate) codec: FrameCodec,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Vec<JoinHandle<()>>,
    pub(crate) lost: bool,
}

struct ActiveSession {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// A session start waiting for the server's acknowledgement
pub(crate) struct PendingStart {
    pub(crate) ticket: u64,
    pub(crate) session_id: String,
    /// Known once the start frame is stamped
    pub(crate) sequence: Option<u32>,
    pub(crate) reply: oneshot::Sender<Result<()>>,
}

struct PumpHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    subscription: Option<SubscriptionId>,
}

impl PumpHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    async fn stop(self, events: &EventRegistry) {
        if let Some(id) = self.subscription {
            events.unsubscribe(id);
        }
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("audio pump panicked");
            }
        }
    }
}

#[derive(Default)]
struct PumpSlots {
    capture: Option<PumpHandle>,
    playback: Option<PumpHandle>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<ActiveSession>>,
    pub(crate) link: Mutex<Option<Link>>,
    pub(crate) pending_start: Mutex<Option<PendingStart>>,
    pumps: tokio::sync::Mutex<PumpSlots>,
    pub(crate) events: EventRegistry,
    pub(crate) stats: Arc<StatsRegistry>,
    next_link_id: AtomicU64,
    next_ticket: AtomicU64,
    /// Held for the whole of a teardown
    teardown_lock: tokio::sync::Mutex<()>,
    pub(crate) last_connect: Mutex<Option<ConnectConfig>>,
    pub(crate) reconnect_cancel: Mutex<CancellationToken>,
}

impl ClientInner {
    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Sets the state unconditionally
    pub(crate) fn set_state(&self, new: ConnectionState) -> ConnectionState {
        let old = std::mem::replace(&mut *lock(&self.state), new);
        self.announce(old, new);
        old
    }

    /// Moves from `from` to `to`; false if the state was something else
    pub(crate) fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.announce(from, to);
        true
    }

    fn announce(&self, old: ConnectionState, new: ConnectionState) {
        if old == new {
            return;
        }
        debug!(from = %old, to = %new, "state transition");

        let (old_level, new_level) = (old.connection_level(), new.connection_level());
        if old_level != new_level {
            info!(from = %old_level, to = %new_level, "connection state changed");
            self.events.emit_state(old_level, new_level);
        }
    }

    pub(crate) fn current_session_id(&self) -> Option<String> {
        lock(&self.session).as_ref().map(|s| s.info.session_id.clone())
    }

    fn require_session(&self, session_id: &str) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::SessionActive {
            return Err(Error::validation(format!("no active session while {}", state)));
        }
        match lock(&self.session).as_ref() {
            Some(active) if active.info.session_id == session_id => Ok(()),
            Some(active) => Err(Error::validation(format!(
                "session {} is not active (active session is {})",
                session_id, active.info.session_id
            ))),
            None => Err(Error::validation("no active session")),
        }
    }

    fn session_token(&self) -> Option<CancellationToken> {
        lock(&self.session).as_ref().map(|s| s.cancel.clone())
    }

    pub(crate) fn link_handles(&self) -> Result<(u64, FrameCodec, Arc<TransportChannel>)> {
        lock(&self.link)
            .as_ref()
            .map(|link| (link.id, link.codec.clone(), Arc::clone(&link.channel)))
            .ok_or_else(|| Error::validation("not connected"))
    }

    pub(crate) async fn connect_with(
        self: &Arc<Self>,
        config: ConnectConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.begin_connect()?;
        info!(endpoint = %config.endpoint, "connecting");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            opened = TransportChannel::connect(&config, Arc::clone(&self.stats)) => opened,
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                warn!(endpoint = %config.endpoint, error = %e, "connect failed");
                self.advance(ConnectionState::Connecting, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *lock(&self.last_connect) = Some(config);
        self.establish(channel).await
    }

    fn begin_connect(&self) -> Result<()> {
        if self.advance(ConnectionState::Disconnected, ConnectionState::Connecting) {
            Ok(())
        } else {
            Err(Error::validation(format!("cannot connect while {}", self.state())))
        }
    }

    /// Binds a freshly opened transport to this client and starts its tasks
    async fn establish(self: &Arc<Self>, channel: TransportChannel) -> Result<()> {
        let channel = Arc::new(channel);
        let codec = FrameCodec::with_max_payload(self.config.max_frame_payload);
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        // state and link change together so teardown never sees one without the other
        let accepted = {
            let mut slot = lock(&self.link);
            if self.advance(ConnectionState::Connecting, ConnectionState::Connected) {
                let tasks = self.spawn_link_tasks(link_id, &channel, &codec, &cancel);
                *slot = Some(Link {
                    id: link_id,
                    channel: Arc::clone(&channel),
                    codec,
                    cancel,
                    tasks,
                    lost: false,
                });
                true
            } else {
                false
            }
        };

        if !accepted {
            debug!(link = link_id, "connect abandoned");
            let _ = channel.close().await;
            return Err(Error::Cancelled);
        }
        info!(link = link_id, peer = channel.peer(), "connected");
        Ok(())
    }

    fn spawn_link_tasks(
        self: &Arc<Self>,
        link_id: u64,
        channel: &Arc<TransportChannel>,
        codec: &FrameCodec,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let receiver = tokio::spawn(Arc::clone(self).receive_loop(
            link_id,
            Arc::clone(channel),
            codec.clone(),
            cancel.clone(),
        ));

        // silence only ends the connection when a reconnect can follow
        let max_missed = self
            .config
            .reconnect
            .enabled
            .then_some(self.config.reconnect.max_missed_heartbeats)
            .flatten();
        let supervisor = ConnectionSupervisor::new(Arc::clone(&self.stats), self.config.heartbeat_interval, max_missed);
        let inner = Arc::clone(self);
        let (channel, codec, cancel) = (Arc::clone(channel), codec.clone(), cancel.clone());
        let heartbeat = tokio::spawn(async move {
            match supervisor.run(codec, channel, cancel).await {
                SupervisorExit::Cancelled => {}
                SupervisorExit::HeartbeatTimeout => {
                    inner.on_transport_lost(link_id, Error::timeout("peer stopped answering heartbeats"))
                }
                SupervisorExit::TransportFailed(e) => inner.on_transport_lost(link_id, e),
            }
        });

        vec![receiver, heartbeat]
    }

    /// Encodes and sends one body on the current link
    pub(crate) async fn send_body(
        self: &Arc<Self>,
        body: MessageBody,
        compression: Compression,
        cancel: &CancellationToken,
    ) -> Result<Header> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (link_id, codec, channel) = self.link_handles()?;
        let prepared = codec.prepare_offloaded(body, compression).await?;
        self.transmit(link_id, &channel, &codec, &prepared, cancel, |_| {}).await
    }

    /// Stamps and writes a prepared frame under the channel's write lock.
    ///
    /// `on_stamp` sees the final header before any byte is written.
    async fn transmit(
        self: &Arc<Self>,
        link_id: u64,
        channel: &TransportChannel,
        codec: &FrameCodec,
        prepared: &PreparedFrame,
        cancel: &CancellationToken,
        on_stamp: impl FnOnce(&Header) + Send,
    ) -> Result<Header> {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = channel.send_with(|| {
                let frame = codec.stamp(prepared);
                on_stamp(&frame.header);
                (frame.bytes, frame.header)
            }) => sent,
        };

        match sent {
            Ok(header) => {
                debug!(
                    kind = header.message_type.name(),
                    sequence = header.sequence,
                    len = header.payload_length,
                    "frame sent"
                );
                Ok(header)
            }
            Err(e) if e.kind() == ErrorKind::Transport => {
                let message = e.to_string();
                self.on_transport_lost(link_id, e);
                Err(Error::transport(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn start_session(
        self: &Arc<Self>,
        session_id: &str,
        config: Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if session_id.is_empty() {
            return Err(Error::validation("session id must not be empty"));
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Error::validation(format!("cannot start a session while {}", state)));
        }
        if lock(&self.pending_start).is_some() {
            return Err(Error::validation("another session start is in progress"));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (link_id, codec, channel) = self.link_handles()?;
        let body = MessageBody::SessionStart(SessionStart {
            session_id: session_id.to_string(),
            config: non_null(config.clone()),
        });
        let prepared = codec.prepare_offloaded(body, self.config.compression).await?;

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, acknowledged) = oneshot::channel();
        {
            let mut pending = lock(&self.pending_start);
            if pending.is_some() {
                return Err(Error::validation("another session start is in progress"));
            }
            *pending = Some(PendingStart {
                ticket,
                session_id: session_id.to_string(),
                sequence: None,
                reply,
            });
        }
        let _slot = PendingSlot { inner: self, ticket };

        self.transmit(link_id, &channel, &codec, &prepared, cancel, |header| {
            if let Some(pending) = lock(&self.pending_start).as_mut().filter(|p| p.ticket == ticket) {
                pending.sequence = Some(header.sequence);
            }
        })
        .await?;
        debug!(session_id, "session start sent, awaiting acknowledgement");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            waited = tokio::time::timeout(self.config.request_timeout, acknowledged) => match waited {
                Err(_) => Err(Error::timeout(format!("no acknowledgement for session {}", session_id))),
                Ok(Err(_)) => Err(Error::transport("connection closed while starting the session")),
                Ok(Ok(result)) => result,
            },
        };
        if let Err(e) = outcome {
            warn!(session_id, error = %e, "session start failed");
            return Err(e);
        }

        *lock(&self.session) = Some(ActiveSession {
            info: SessionInfo {
                session_id: session_id.to_string(),
                started_at: Utc::now(),
                config,
            },
            cancel: CancellationToken::new(),
        });
        if !self.advance(ConnectionState::Connected, ConnectionState::SessionActive) {
            lock(&self.session).take();
            return Err(Error::validation("connection changed while starting the session"));
        }
        info!(session_id, "session active");
        Ok(())
    }

    async fn finish_session(self: &Arc<Self>, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.require_session(session_id)?;

        let ended = {
            let mut session = lock(&self.session);
            if session.as_ref().is_some_and(|active| active.info.session_id == session_id) {
                session.take()
            } else {
                None
            }
        };
        let Some(ended) = ended else {
            return Err(Error::validation(format!("session {} is not active", session_id)));
        };
        ended.cancel.cancel();
        self.stop_pumps().await;

        let body = MessageBody::SessionEnd(SessionEnd {
            session_id: session_id.to_string(),
        });
        let sent = tokio::time::timeout(
            self.config.finish_timeout,
            self.send_body(body, self.config.compression, cancel),
        )
        .await
        .unwrap_or_else(|_| Err(Error::timeout(format!("sending end of session {}", session_id))));

        match sent {
            Ok(_) => info!(session_id, "session finished"),
            Err(Error::Cancelled) => debug!(session_id, "session end cancelled"),
            Err(e) => {
                warn!(session_id, error = %e, "session end not delivered");
                self.events.emit_error(&ErrorEvent::from(&e));
            }
        }

        self.advance(ConnectionState::SessionActive, ConnectionState::Connected);
        Ok(())
    }

    /// Drops the active session, its pumps and any pending start
    async fn end_session(&self) {
        let ended = lock(&self.session).take();
        if let Some(pending) = lock(&self.pending_start).take() {
            let _ = pending.reply.send(Err(Error::transport("connection closed")));
        }
        if let Some(ended) = ended {
            ended.cancel.cancel();
            debug!(session_id = %ended.info.session_id, "session discarded");
        }
        self.stop_pumps().await;
    }

    async fn stop_pumps(&self) {
        let (capture, playback) = {
            let mut pumps = self.pumps.lock().await;
            (pumps.capture.take(), pumps.playback.take())
        };
        if let Some(capture) = capture {
            capture.stop(&self.events).await;
        }
        if let Some(playback) = playback {
            playback.stop(&self.events).await;
        }
    }

    /// Closes the current link. With `only`, a newer link is left alone.
    ///
    /// Teardowns run one at a time, so a caller returning from here knows
    /// no older teardown is still winding down.
    pub(crate) async fn teardown(self: &Arc<Self>, only: Option<u64>) {
        let _serial = self.teardown_lock.lock().await;
        let link = {
            let mut slot = lock(&self.link);
            match only {
                Some(id) if slot.as_ref().map(|link| link.id) != Some(id) => return,
                _ => slot.take(),
            }
        };

        let Some(link) = link else {
            // no transport; abandons a connect still in flight
            self.end_session().await;
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        let link_id = link.id;
        self.set_state(ConnectionState::Closing);
        self.end_session().await;
        link.cancel.cancel();

        match tokio::time::timeout(self.config.finish_timeout, link.channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(link = link_id, error = %e, "close handshake failed"),
            Err(_) => debug!(link = link_id, "close handshake timed out"),
        }
        for task in link.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(link = link_id, "connection task panicked");
                }
            }
        }

        if !self.advance(ConnectionState::Closing, ConnectionState::Disconnected) {
            warn!(link = link_id, state = %self.state(), "state moved on during teardown");
        }
        info!(link = link_id, "disconnected");
    }

    /// Synchronous best-effort stop when the last handle goes away
    fn abandon(&self) {
        lock(&self.reconnect_cancel).cancel();
        if let Some(active) = lock(&self.session).as_ref() {
            active.cancel.cancel();
        }
        if let Some(link) = lock(&self.link).as_ref() {
            link.cancel.cancel();
        }
    }
}

/// Clears the pending start on every exit path of `start_session`
struct PendingSlot<'a> {
    inner: &'a ClientInner,
    ticket: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut pending = lock(&self.inner.pending_start);
        if pending.as_ref().map(|p| p.ticket) == Some(self.ticket) {
            pending.take();
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

/// Sends captured audio on behalf of one session
struct SessionOutlet {
    inner: Arc<ClientInner>,
    session_id: String,
}

impl AudioOutlet for SessionOutlet {
    async fn send_chunk(&self, chunk: Bytes, cancel: &CancellationToken) -> Result<()> {
        // the session ended under us; stop capturing quietly
        if self.inner.require_session(&self.session_id).is_err() {
            return Err(Error::Cancelled);
        }
        let body = MessageBody::ClientAudioOnly(AudioFrame::new(chunk));
        self.inner
            .send_body(body, self.inner.config.audio_compression, cancel)
            .await
            .map(|_| ())
    }
}

struct HandleGuard {
    inner: Weak<ClientInner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.abandon();
        }
    }
}

/// Client for one real-time dialogue connection.
///
/// Clones share the connection. Dropping the last clone stops background
/// work; call [`DialogClient::disconnect`] for an orderly close.
#[derive(Clone)]
pub struct DialogClient {
    inner: Arc<ClientInner>,
    _guard: Arc<HandleGuard>,
}

impl DialogClient {
    /// Creates a disconnected client
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(ClientInner {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            link: Mutex::new(None),
            pending_start: Mutex::new(None),
            pumps: tokio::sync::Mutex::new(PumpSlots::default()),
            events: EventRegistry::new(),
            stats: Arc::new(StatsRegistry::new()),
            next_link_id: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            teardown_lock: tokio::sync::Mutex::new(()),
            last_connect: Mutex::new(None),
            reconnect_cancel: Mutex::new(CancellationToken::new()),
        });
        let guard = Arc::new(HandleGuard {
            inner: Arc::downgrade(&inner),
        });
        Ok(DialogClient { inner, _guard: guard })
    }

    /// Opens the transport and starts the receive loop and heartbeats
    pub async fn connect(&self, config: ConnectConfig, cancel: &CancellationToken) -> Result<()> {
        self.inner.connect_with(config, cancel).await
    }

    /// Attaches an already-established WebSocket instead of dialing
    pub async fn connect_stream<S>(&self, ws: WebSocketStream<S>, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.inner.begin_connect()?;
        let channel = TransportChannel::from_websocket(ws, "stream", Arc::clone(&self.inner.stats));
        self.inner.establish(channel).await
    }

    /// Closes everything. Valid in any state.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut reconnect = lock(&self.inner.reconnect_cancel);
            reconnect.cancel();
            *reconnect = CancellationToken::new();
        }
        self.inner.teardown(None).await;
        Ok(())
    }

    /// Sends a session start and waits for the server to acknowledge it
    pub async fn start_session(&self, session_id: &str, config: Value, cancel: &CancellationToken) -> Result<()> {
        self.inner.start_session(session_id, config, cancel).await
    }

    /// Ends the session. The end frame is best-effort and bounded by the
    /// finish timeout; the session is closed locally regardless.
    pub async fn finish_session(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.inner.finish_session(session_id, cancel).await
    }

    pub async fn say_hello(&self, session_id: &str, payload: Value, cancel: &CancellationToken) -> Result<()> {
        self.send_request(session_id, RequestEvent::SayHello, payload, cancel).await
    }

    /// Sends a text query to the dialogue service
    pub async fn send_chat_query(&self, session_id: &str, payload: Value, cancel: &CancellationToken) -> Result<()> {
        self.send_request(session_id, RequestEvent::ChatQuery, payload, cancel).await
    }

    async fn send_request(
        &self,
        session_id: &str,
        event: RequestEvent,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.require_session(session_id)?;
        let body = MessageBody::ClientFullRequest(ClientRequest {
            session_id: session_id.to_string(),
            event,
            payload: non_null(payload),
        });
        self.inner
            .send_body(body, self.inner.config.compression, cancel)
            .await
            .map(|_| ())
    }

    /// Asks the service to speak `text`
    pub async fn send_chat_tts_text(
        &self,
        session_id: &str,
        text: ChatTtsText,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.require_session(session_id)?;
        let body = MessageBody::TtsTrigger(TtsTrigger {
            session_id: session_id.to_string(),
            text,
        });
        self.inner
            .send_body(body, self.inner.config.compression, cancel)
            .await
            .map(|_| ())
    }

    /// Sends one audio chunk. An explicit sequence marks a retransmission
    /// and does not consume the connection's counter.
    pub async fn send_audio_data(
        &self,
        session_id: &str,
        data: Bytes,
        sequence: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.require_session(session_id)?;
        if data.is_empty() {
            return Err(Error::validation("audio chunk is empty"));
        }
        let frame = match sequence {
            Some(sequence) => AudioFrame::with_sequence(data, sequence),
            None => AudioFrame::new(data),
        };
        self.inner
            .send_body(MessageBody::ClientAudioOnly(frame), self.inner.config.audio_compression, cancel)
            .await
            .map(|_| ())
    }

    /// Starts streaming `source` into the session
    pub async fn start_recording<S: AudioSource>(&self, session_id: &str, source: S) -> Result<()> {
        self.inner.require_session(session_id)?;
        let session_token = self
            .inner
            .session_token()
            .ok_or_else(|| Error::validation("no active session"))?;

        let mut pumps = self.inner.pumps.lock().await;
        if pumps.capture.as_ref().is_some_and(PumpHandle::is_running) {
            return Err(Error::validation("already recording"));
        }

        let cancel = session_token.child_token();
        let outlet = SessionOutlet {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
        };
        let inner = Arc::clone(&self.inner);
        let audio = self.inner.config.audio.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = capture_loop(source, outlet, audio, token).await {
                inner.events.emit_error(&ErrorEvent::from(&e));
            }
        });

        pumps.capture = Some(PumpHandle {
            cancel,
            task,
            subscription: None,
        });
        info!(session_id, "recording started");
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<()> {
        let capture = self.inner.pumps.lock().await.capture.take();
        if let Some(capture) = capture {
            capture.stop(&self.inner.events).await;
            info!("recording stopped");
        }
        Ok(())
    }

    /// Plays inbound audio through `sink` until stopped or the session ends
    pub async fn start_playback<K: AudioSink>(&self, sink: K) -> Result<()> {
        let state = self.inner.state();
        if state != ConnectionState::SessionActive {
            return Err(Error::validation(format!("cannot start playback while {}", state)));
        }
        let session_token = self
            .inner
            .session_token()
            .ok_or_else(|| Error::validation("no active session"))?;

        let mut pumps = self.inner.pumps.lock().await;
        if pumps.playback.as_ref().is_some_and(PumpHandle::is_running) {
            return Err(Error::validation("already playing"));
        }

        let queue = Arc::new(PlaybackQueue::new(self.inner.config.audio.playback_capacity));
        let subscription = {
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&self.inner.stats);
            self.inner.events.on_audio(move |event| {
                if queue.push(event.data.clone()) {
                    stats.update(|s| s.playback_frames_dropped += 1);
                }
            })
        };

        let cancel = session_token.child_token();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = playback_loop(sink, &queue, token).await {
                inner.events.emit_error(&ErrorEvent::from(&e));
            }
        });

        if let Some(stale) = pumps.playback.replace(PumpHandle {
            cancel,
            task,
            subscription: Some(subscription),
        }) {
            stale.stop(&self.inner.events).await;
        }
        info!("playback started");
        Ok(())
    }

    pub async fn stop_playback(&self) -> Result<()> {
        let playback = self.inner.pumps.lock().await.playback.take();
        if let Some(playback) = playback {
            playback.stop(&self.inner.events).await;
            info!("playback stopped");
        }
        Ok(())
    }

    /// Snapshot of the connection counters
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Current state, including session-level detail
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        lock(&self.inner.session).as_ref().map(|s| s.info.clone())
    }

    /// Listener registry for state, audio, dialog and error notifications
    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}
