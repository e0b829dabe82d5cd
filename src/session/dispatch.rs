//! Receive path: demultiplex, police ordering, dispatch to listeners.
//!
//! Also owns the reaction to transport loss, including reconnection.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::ClientInner;
use super::events::{AudioEvent, DialogEvent, ErrorEvent};
use crate::core::{ConnectionState, Error, ErrorKind};
use crate::network::{ReconnectState, TransportChannel};
use crate::protocol::{FrameCodec, Header, MessageBody, ProtocolMessage, SequenceTracker, SequenceVerdict, ServerAck};
use crate::util::lock;

impl ClientInner {
    pub(crate) async fn receive_loop(
        self: Arc<Self>,
        link_id: u64,
        channel: Arc<TransportChannel>,
        mut codec: FrameCodec,
        cancel: CancellationToken,
    ) {
        let mut tracker = SequenceTracker::new(self.config.sequence_policy);
        debug!(link = link_id, "receive loop started");

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = channel.receive() => received,
            };

            match received {
                Ok(bytes) => self.drain(&mut codec, &bytes, &mut tracker),
                Err(e) => {
                    if !cancel.is_cancelled() {
                        self.on_transport_lost(link_id, e);
                    }
                    break;
                }
            }
        }

        debug!(link = link_id, "receive loop stopped");
    }

    /// Dispatches every frame in one transport message, in order.
    ///
    /// A message may carry several frames; a frame never spans messages.
    fn drain(&self, codec: &mut FrameCodec, message: &Bytes, tracker: &mut SequenceTracker) {
        let mut buffer = BytesMut::from(&message[..]);
        loop {
            match codec.decode_eof(&mut buffer) {
                Ok(Some(message)) => self.dispatch(message, tracker),
                Ok(None) => break,
                Err(e) => self.report_integrity_failure(&e),
            }
        }
    }

    fn report_integrity_failure(&self, error: &Error) {
        self.stats.update(|s| s.integrity_failures += 1);
        warn!(error = %error, "discarding invalid frame");
        self.events.emit_error(&ErrorEvent::from(error));
    }

    fn dispatch(&self, message: ProtocolMessage, tracker: &mut SequenceTracker) {
        let header = message.header;
        self.stats.update(|s| s.frames_received += 1);
        debug!(
            kind = header.message_type.name(),
            sequence = header.sequence,
            len = header.payload_length,
            "frame received"
        );

        match tracker.observe(&header) {
            SequenceVerdict::InOrder => {}
            SequenceVerdict::Accepted => self.stats.update(|s| s.out_of_order_frames += 1),
            SequenceVerdict::Rejected => {
                self.stats.update(|s| s.out_of_order_frames += 1);
                warn!(kind = header.message_type.name(), sequence = header.sequence, "dropping stale frame");
                self.events.emit_error(&ErrorEvent::new(
                    ErrorKind::Integrity,
                    format!(
                        "dropped out-of-order {} frame with sequence {}",
                        header.message_type.name(),
                        header.sequence
                    ),
                ));
                return;
            }
        }

        self.resolve_start(&message.body);

        match message.body {
            MessageBody::ClientAudioOnly(frame) => {
                self.deliver_audio(&header, frame.data, self.current_session_id());
            }
            MessageBody::ServerAck(ServerAck {
                audio: Some(audio),
                session_id,
                ..
            }) => {
                let session_id = session_id.or_else(|| self.current_session_id());
                self.deliver_audio(&header, Bytes::from(audio), session_id);
            }
            MessageBody::ServerErrorResponse(failure) => {
                self.stats.update(|s| s.server_errors += 1);
                warn!(code = failure.code, message = %failure.message, "server reported an error");
                let error = Error::Protocol {
                    code: failure.code,
                    message: failure.message,
                };
                self.events.emit_error(&ErrorEvent::from(&error));
            }
            MessageBody::Heartbeat(heartbeat) => {
                self.stats.record_heartbeat_reply(heartbeat.timestamp_ms);
            }
            body => {
                let event = DialogEvent {
                    message_type: header.message_type,
                    sequence: header.sequence,
                    session_id: body.session_id().map(str::to_owned),
                    payload: body.to_json_value(),
                };
                self.events.emit_dialog(&event);
            }
        }
    }

    fn deliver_audio(&self, header: &Header, data: Bytes, session_id: Option<String>) {
        let event = AudioEvent {
            data,
            sequence: header.sequence,
            message_type: header.message_type,
            session_id,
        };
        self.events.emit_audio(&event);
    }

    /// Completes a pending session start if `body` answers it.
    ///
    /// An ack matches by session id or by acknowledging the start frame's
    /// sequence; acks carrying audio never do. An error matches its session
    /// or, without one, whatever start is pending.
    fn resolve_start(&self, body: &MessageBody) {
        let mut slot = lock(&self.pending_start);
        let Some(pending) = slot.as_ref() else {
            return;
        };

        let outcome = match body {
            MessageBody::ServerAck(ack)
                if ack.audio.is_none()
                    && (ack.session_id.as_deref() == Some(pending.session_id.as_str())
                        || (ack.ack_sequence.is_some() && ack.ack_sequence == pending.sequence)) =>
            {
                Ok(())
            }
            MessageBody::ServerFullResponse(response)
                if response.session_id.as_deref() == Some(pending.session_id.as_str()) =>
            {
                Ok(())
            }
            MessageBody::ServerErrorResponse(failure)
                if failure
                    .session_id
                    .as_deref()
                    .map_or(true, |id| id == pending.session_id) =>
            {
                Err(Error::Protocol {
                    code: failure.code,
                    message: failure.message.clone(),
                })
            }
            _ => return,
        };

        if let Some(pending) = slot.take() {
            debug!(session_id = %pending.session_id, ok = outcome.is_ok(), "session start answered");
            let _ = pending.reply.send(outcome);
        }
    }

    /// Reacts to a dead transport exactly once per link
    pub(crate) fn on_transport_lost(self: &Arc<Self>, link_id: u64, error: Error) {
        {
            let mut slot = lock(&self.link);
            match slot.as_mut() {
                Some(link) if link.id == link_id && !link.lost => link.lost = true,
                _ => return,
            }
        }

        error!(link = link_id, error = %error, "transport lost");
        self.events.emit_error(&ErrorEvent::from(&error));

        // a disconnect from here on cancels this token, even mid-teardown
        let reconnect = lock(&self.reconnect_cancel).clone();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.teardown(Some(link_id)).await;
            if inner.config.reconnect.enabled && !reconnect.is_cancelled() {
                inner.spawn_reconnect(reconnect);
            }
        });
    }

    fn spawn_reconnect(self: &Arc<Self>, cancel: CancellationToken) {
        let Some(target) = lock(&self.last_connect).clone() else {
            debug!("no endpoint to reconnect to");
            return;
        };
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let mut backoff = ReconnectState::new(inner.config.reconnect.clone());
            while let Some(delay) = backoff.next_delay() {
                info!(attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if inner.state() != ConnectionState::Disconnected {
                    debug!("connection re-established elsewhere, reconnect abandoned");
                    return;
                }

                match inner.connect_with(target.clone(), &cancel).await {
                    Ok(()) => {
                        inner.stats.update(|s| s.reconnect_count += 1);
                        info!(attempts = backoff.attempts(), "reconnected");
                        return;
                    }
                    Err(Error::Cancelled) => return,
                    Err(e) => warn!(attempt = backoff.attempts(), error = %e, "reconnect attempt failed"),
                }
            }

            let error = Error::transport(format!("gave up reconnecting after {} attempts", backoff.attempts()));
            error!(error = %error, "reconnect exhausted");
            inner.events.emit_error(&ErrorEvent::from(&error));
        });
    }
}
