use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use dialog_wire::protocol::{
    ServerAck,
    ServerError,
    ServerResponse,
};
use dialog_wire::{
    AudioConfig,
    AudioSink,
    AudioSource,
    ClientConfig,
    Compression,
    ConnectConfig,
    ConnectionState,
    DialogClient,
    DialogEvent,
    ErrorEvent,
    ErrorKind,
    FrameCodec,
    MessageBody,
    MessageType,
    ProtocolMessage,
    ReconnectConfig,
    Result,
    SequencePolicy,
};

const WAIT: Duration = Duration::from_secs(3);

enum PeerCommand {
    Send(MessageBody),
    Raw(Bytes),
    Close,
}

/// Scripted dialogue service on the far end of an in-memory socket
struct Peer {
    seen: mpsc::UnboundedReceiver<ProtocolMessage>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl Peer {
    async fn next_of(&mut self, kind: MessageType) -> ProtocolMessage {
        tokio::time::timeout(WAIT, async {
            loop {
                let message = self.seen.recv().await.expect("peer stopped");
                if message.message_type() == kind {
                    return message;
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    fn send(&self, body: MessageBody) {
        self.commands.send(PeerCommand::Send(body)).unwrap();
    }

    fn send_raw(&self, bytes: Bytes) {
        self.commands.send(PeerCommand::Raw(bytes)).unwrap();
    }

    fn close(&self) {
        self.commands.send(PeerCommand::Close).unwrap();
    }
}

async fn encode_and_send(ws: &mut WebSocketStream<DuplexStream>, codec: &FrameCodec, body: MessageBody) -> bool {
    let serialization = body.message_type().serialization();
    let frame = codec.encode_message(&body, Compression::None, serialization).unwrap();
    ws.send(WsMessage::Binary(frame.bytes)).await.is_ok()
}

async fn run_peer(
    mut ws: WebSocketStream<DuplexStream>,
    seen: mpsc::UnboundedSender<ProtocolMessage>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ack_sessions: bool,
) {
    let codec = FrameCodec::new();
    loop {
        tokio::select! {
            incoming = ws.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    _ => break,
                };
                let WsMessage::Binary(bytes) = message else { continue };
                let Ok(frame) = codec.decode_message(&bytes) else { continue };

                let reply = match &frame.body {
                    MessageBody::SessionStart(start) if ack_sessions => Some(MessageBody::ServerAck(ServerAck {
                        session_id: Some(start.session_id.clone()),
                        ack_sequence: Some(frame.sequence()),
                        audio: None,
                    })),
                    MessageBody::ClientFullRequest(request) => Some(MessageBody::ServerFullResponse(ServerResponse {
                        session_id: Some(request.session_id.clone()),
                        event: Some("chat_response".to_string()),
                        payload: Some(json!({ "text": "hello there" })),
                    })),
                    _ => None,
                };
                let _ = seen.send(frame);
                if let Some(body) = reply {
                    if !encode_and_send(&mut ws, &codec, body).await {
                        break;
                    }
                }
            }
            command = commands.recv() => match command {
                Some(PeerCommand::Send(body)) => {
                    if !encode_and_send(&mut ws, &codec, body).await {
                        break;
                    }
                }
                Some(PeerCommand::Raw(bytes)) => {
                    if ws.send(WsMessage::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
        }
    }
}

async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, peer_io) = tokio::io::duplex(1 << 20);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let peer = WebSocketStream::from_raw_socket(peer_io, Role::Server, None).await;
    (client, peer)
}

fn spawn_peer(ws: WebSocketStream<DuplexStream>, ack_sessions: bool) -> Peer {
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_peer(ws, seen_tx, commands_rx, ack_sessions));
    Peer { seen, commands }
}

async fn connected(config: ClientConfig) -> (DialogClient, Peer) {
    let client = DialogClient::new(config).unwrap();
    let (client_ws, peer_ws) = socket_pair().await;
    let peer = spawn_peer(peer_ws, true);
    assert_ok!(client.connect_stream(client_ws, &CancellationToken::new()).await);
    (client, peer)
}

async fn in_session(config: ClientConfig) -> (DialogClient, Peer) {
    let (client, mut peer) = connected(config).await;
    assert_ok!(client.start_session("s1", json!({ "dialog": { "bot_name": "echo" } }), &CancellationToken::new()).await);
    peer.next_of(MessageType::SessionStart).await;
    (client, peer)
}

fn record_errors(client: &DialogClient) -> Arc<Mutex<Vec<ErrorEvent>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.events().on_error(move |event| sink.lock().unwrap().push(event.clone()));
    errors
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn scenario_dialog_round_trip_notifies_connection_level_only() {
    let client = DialogClient::new(ClientConfig::default()).unwrap();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        client
            .events()
            .on_state_changed(move |old, new| transitions.lock().unwrap().push((old, new)));
    }
    let (dialog_tx, mut dialog_rx) = mpsc::unbounded_channel();
    client.events().on_dialog(move |event| {
        let _ = dialog_tx.send(event.clone());
    });

    let (client_ws, peer_ws) = socket_pair().await;
    let mut peer = spawn_peer(peer_ws, true);
    let cancel = CancellationToken::new();

    assert_ok!(client.connect_stream(client_ws, &cancel).await);
    assert_eq!(client.state(), ConnectionState::Connected);

    assert_ok!(client.start_session("s1", json!({ "tts": { "speaker": "narrator" } }), &cancel).await);
    assert_eq!(client.state(), ConnectionState::SessionActive);
    assert_eq!(client.session().unwrap().session_id, "s1");

    assert_ok!(client.say_hello("s1", json!({ "text": "hi" }), &cancel).await);
    let hello = peer.next_of(MessageType::ClientFullRequest).await;
    assert_eq!(hello.body.to_json_value()["payload"]["text"], "hi");

    let response = tokio::time::timeout(WAIT, async {
        loop {
            let event = dialog_rx.recv().await.unwrap();
            if event.message_type == MessageType::ServerFullResponse {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(response.session_id.as_deref(), Some("s1"));
    assert_eq!(response.payload["payload"]["text"], "hello there");

    assert_ok!(client.finish_session("s1", &cancel).await);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.session().is_none());
    peer.next_of(MessageType::SessionEnd).await;

    assert_ok!(client.disconnect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
            (ConnectionState::Connected, ConnectionState::Disconnected),
        ]
    );
}

#[tokio::test]
async fn scenario_audio_frames_arrive_intact_and_in_order() {
    let (client, mut peer) = in_session(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    for i in 0..10u8 {
        let chunk = Bytes::from(vec![i; 3200]);
        assert_ok!(client.send_audio_data("s1", chunk, None, &cancel).await);
    }

    let mut last_sequence = 0;
    for i in 0..10u8 {
        let frame = peer.next_of(MessageType::ClientAudioOnly).await;
        assert_eq!(frame.header.compression, Compression::None);
        assert!(frame.sequence() > last_sequence);
        last_sequence = frame.sequence();
        match frame.body {
            MessageBody::ClientAudioOnly(audio) => assert_eq!(audio.data, Bytes::from(vec![i; 3200])),
            other => panic!("unexpected body {:?}", other),
        }
    }

    let stats = client.stats();
    assert!(stats.frames_sent >= 11);
    assert!(stats.bytes_sent >= 10 * 3200);
    assert_ok!(client.disconnect().await);
}

struct StalledSink;

impl AudioSink for StalledSink {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_chunk(&mut self, _chunk: Bytes) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    fn stop(&mut self) {}
}

#[tokio::test]
async fn scenario_stalled_playback_drops_oldest_audio() {
    let config = ClientConfig {
        audio: AudioConfig {
            playback_capacity: 4,
            ..AudioConfig::default()
        },
        ..ClientConfig::default()
    };
    let (client, peer) = in_session(config).await;
    assert_ok!(client.start_playback(StalledSink).await);

    let received = Arc::new(AtomicU64::new(0));
    {
        let received = Arc::clone(&received);
        client.events().on_audio(move |_| {
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    for i in 0..30u8 {
        peer.send(MessageBody::ServerAck(ServerAck {
            session_id: Some("s1".to_string()),
            ack_sequence: None,
            audio: Some(vec![i; 640]),
        }));
    }
    wait_until(|| received.load(Ordering::SeqCst) == 30).await;

    assert!(client.stats().playback_frames_dropped >= 30 - 4 - 1);
    assert_ok!(client.stop_playback().await);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn operations_outside_their_state_fail_without_sending() {
    let client = DialogClient::new(ClientConfig::default()).unwrap();
    let cancel = CancellationToken::new();

    let err = assert_err!(client.start_session("s1", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(client.stats().frames_sent, 0);

    let (client, _peer) = connected(ClientConfig::default()).await;
    let err = assert_err!(client.send_audio_data("s1", Bytes::from_static(&[0u8; 320]), None, &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = assert_err!(client.say_hello("s1", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = assert_err!(client.start_playback(StalledSink).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(client.stats().frames_sent, 0);

    let err = assert_err!(client.connect(ConnectConfig::new("ws://127.0.0.1:9"), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn operations_against_another_session_are_rejected() {
    let (client, _peer) = in_session(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    let err = assert_err!(client.say_hello("s2", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = assert_err!(client.start_session("s2", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn concurrent_sends_draw_distinct_sequences() {
    let (client, mut peer) = in_session(ClientConfig::default()).await;

    let sends: Vec<_> = (0..20u8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_audio_data("s1", Bytes::from(vec![i; 320]), None, &CancellationToken::new())
                    .await
            })
        })
        .collect();
    for send in sends {
        assert_ok!(send.await.unwrap());
    }

    let mut sequences = BTreeSet::new();
    for _ in 0..20 {
        sequences.insert(peer.next_of(MessageType::ClientAudioOnly).await.sequence());
    }
    // the session start took sequence 1
    let expected: BTreeSet<u32> = (2..22).collect();
    assert_eq!(sequences, expected);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn retransmitted_audio_keeps_its_sequence() {
    let (client, mut peer) = in_session(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    assert_ok!(client.send_audio_data("s1", Bytes::from_static(&[1u8; 320]), Some(500), &cancel).await);
    assert_ok!(client.send_audio_data("s1", Bytes::from_static(&[2u8; 320]), None, &cancel).await);

    let retransmit = peer.next_of(MessageType::ClientAudioOnly).await;
    assert_eq!(retransmit.sequence(), 500);
    assert!(retransmit.header.has_sequence_override());
    let next = peer.next_of(MessageType::ClientAudioOnly).await;
    assert_eq!(next.sequence(), 2);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn server_error_is_notified_and_session_survives() {
    let (client, peer) = in_session(ClientConfig::default()).await;
    let errors = record_errors(&client);

    peer.send(MessageBody::ServerErrorResponse(ServerError {
        session_id: Some("s1".to_string()),
        code: 52000042,
        message: "rate limited".to_string(),
    }));
    wait_until(|| !errors.lock().unwrap().is_empty()).await;

    let event = errors.lock().unwrap()[0].clone();
    assert_eq!(event.kind, ErrorKind::Protocol);
    assert_eq!(event.code, Some(52000042));
    assert_eq!(client.state(), ConnectionState::SessionActive);
    assert_eq!(client.stats().server_errors, 1);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn corrupt_frame_is_skipped_and_the_loop_continues() {
    let (client, peer) = connected(ClientConfig::default()).await;
    let errors = record_errors(&client);
    let (dialog_tx, mut dialog_rx) = mpsc::unbounded_channel();
    client.events().on_dialog(move |event| {
        let _ = dialog_tx.send(event.clone());
    });

    let codec = FrameCodec::new();
    let body = MessageBody::ServerFullResponse(ServerResponse {
        session_id: None,
        event: Some("notice".to_string()),
        payload: None,
    });
    let frame = codec
        .encode_message(&body, Compression::None, body.message_type().serialization())
        .unwrap();
    let mut corrupt = frame.bytes.to_vec();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x20;

    peer.send_raw(Bytes::from(corrupt));
    peer.send(body);

    let event = tokio::time::timeout(WAIT, dialog_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.message_type, MessageType::ServerFullResponse);
    assert_eq!(event.payload["event"], "notice");

    assert_eq!(client.stats().integrity_failures, 1);
    assert_eq!(errors.lock().unwrap()[0].kind, ErrorKind::Integrity);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn unanswered_session_start_times_out_and_stays_connected() {
    let config = ClientConfig {
        request_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    let client = DialogClient::new(config).unwrap();
    let (client_ws, peer_ws) = socket_pair().await;
    let _peer = spawn_peer(peer_ws, false);
    let cancel = CancellationToken::new();
    assert_ok!(client.connect_stream(client_ws, &cancel).await);

    let err = assert_err!(client.start_session("s1", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(client.state(), ConnectionState::Connected);

    // a later start is not blocked by the abandoned one
    let err = assert_err!(client.start_session("s1", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn cancelled_session_start_rolls_back() {
    let client = DialogClient::new(ClientConfig::default()).unwrap();
    let (client_ws, peer_ws) = socket_pair().await;
    let _peer = spawn_peer(peer_ws, false);
    assert_ok!(client.connect_stream(client_ws, &CancellationToken::new()).await);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = assert_err!(client.start_session("s1", json!({}), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.session().is_none());
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn peer_close_forces_disconnected() {
    let (client, peer) = in_session(ClientConfig::default()).await;
    let errors = record_errors(&client);

    peer.close();
    wait_until(|| client.state() == ConnectionState::Disconnected).await;

    assert!(client.session().is_none());
    assert_eq!(errors.lock().unwrap()[0].kind, ErrorKind::Transport);
    let err = assert_err!(client.send_audio_data("s1", Bytes::from_static(&[0u8; 4]), None, &CancellationToken::new()).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn failed_connect_reverts_to_disconnected() {
    let client = DialogClient::new(ClientConfig::default()).unwrap();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        client
            .events()
            .on_state_changed(move |old, new| transitions.lock().unwrap().push((old, new)));
    }

    let config = ConnectConfig {
        connect_timeout: Duration::from_secs(2),
        ..ConnectConfig::new("ws://127.0.0.1:9/dialogue")
    };
    let err = assert_err!(client.connect(config, &CancellationToken::new()).await);
    assert!(err.is_retryable());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Disconnected),
        ]
    );
}

struct CountedSource {
    remaining: u8,
}

impl AudioSource for CountedSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_chunk(&mut self, len: usize) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(Bytes::from(vec![self.remaining; len])))
    }

    fn stop(&mut self) {}
}

#[tokio::test]
async fn recording_streams_source_chunks_into_the_session() {
    let config = ClientConfig {
        audio: AudioConfig {
            chunk_bytes: 320,
            ..AudioConfig::default()
        },
        ..ClientConfig::default()
    };
    let (client, mut peer) = in_session(config).await;

    let err = assert_err!(client.start_recording("other", CountedSource { remaining: 1 }).await);
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_ok!(client.start_recording("s1", CountedSource { remaining: 5 }).await);
    for expected in (0..5u8).rev() {
        match peer.next_of(MessageType::ClientAudioOnly).await.body {
            MessageBody::ClientAudioOnly(audio) => {
                assert_eq!(audio.data.len(), 320);
                assert_eq!(audio.data[0], expected);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    assert_ok!(client.stop_recording().await);
    assert_ok!(client.finish_session("s1", &CancellationToken::new()).await);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn lost_transport_reconnects_when_enabled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        // the first connection is closed right after the handshake
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = first.close(None).await;
        drop(first);

        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });

    let config = ClientConfig {
        reconnect: ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
            ..ReconnectConfig::default()
        },
        ..ClientConfig::default()
    };
    let client = DialogClient::new(config).unwrap();
    let errors = record_errors(&client);

    let endpoint = format!("ws://{}/dialogue", addr);
    assert_ok!(client.connect(ConnectConfig::new(endpoint), &CancellationToken::new()).await);

    let _second = server.await.unwrap();
    wait_until(|| client.stats().reconnect_count == 1 && client.state() == ConnectionState::Connected).await;
    assert_eq!(errors.lock().unwrap()[0].kind, ErrorKind::Transport);

    assert_ok!(client.disconnect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

fn dialog_events(client: &DialogClient) -> mpsc::UnboundedReceiver<DialogEvent> {
    let (dialog_tx, dialog_rx) = mpsc::unbounded_channel();
    client.events().on_dialog(move |event| {
        let _ = dialog_tx.send(event.clone());
    });
    dialog_rx
}

fn notice(event: &str) -> MessageBody {
    MessageBody::ServerFullResponse(ServerResponse {
        session_id: None,
        event: Some(event.to_string()),
        payload: None,
    })
}

async fn next_dialog(dialog_rx: &mut mpsc::UnboundedReceiver<DialogEvent>) -> DialogEvent {
    tokio::time::timeout(WAIT, dialog_rx.recv()).await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gzip_audio_reaches_the_wire_in_sequence_order() {
    let config = ClientConfig {
        audio_compression: Compression::Gzip,
        ..ClientConfig::default()
    };
    let (client, mut peer) = in_session(config).await;

    let sends: Vec<_> = (0..200u32)
        .map(|i| {
            let client = client.clone();
            // uneven sizes make some chunks slower to compress than others
            let chunk = Bytes::from(vec![(i % 251) as u8; 320 + (i as usize % 7) * 900]);
            tokio::spawn(async move { client.send_audio_data("s1", chunk, None, &CancellationToken::new()).await })
        })
        .collect();
    for send in sends {
        assert_ok!(send.await.unwrap());
    }

    let mut arrival = Vec::new();
    for _ in 0..200 {
        let frame = peer.next_of(MessageType::ClientAudioOnly).await;
        assert_eq!(frame.header.compression, Compression::Gzip);
        arrival.push(frame.sequence());
    }
    assert!(
        arrival.windows(2).all(|pair| pair[0] < pair[1]),
        "sequences out of wire order: {:?}",
        arrival
    );
    assert_eq!(arrival.first(), Some(&2));
    assert_eq!(arrival.last(), Some(&201));
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn gzip_control_and_audio_frames_work_end_to_end() {
    let config = ClientConfig {
        compression: Compression::Gzip,
        audio_compression: Compression::Gzip,
        ..ClientConfig::default()
    };
    let (client, mut peer) = connected(config).await;
    let mut dialog_rx = dialog_events(&client);
    let cancel = CancellationToken::new();

    assert_ok!(client.start_session("s1", json!({ "asr": { "language": "en" } }), &cancel).await);
    let start = peer.next_of(MessageType::SessionStart).await;
    assert_eq!(start.header.compression, Compression::Gzip);
    assert_eq!(start.body.to_json_value()["config"]["asr"]["language"], "en");

    assert_ok!(client.say_hello("s1", json!({ "text": "compressed hello" }), &cancel).await);
    let hello = peer.next_of(MessageType::ClientFullRequest).await;
    assert_eq!(hello.header.compression, Compression::Gzip);
    assert_eq!(hello.body.to_json_value()["payload"]["text"], "compressed hello");

    assert_ok!(client.send_audio_data("s1", Bytes::from(vec![3u8; 3200]), None, &cancel).await);
    match peer.next_of(MessageType::ClientAudioOnly).await.body {
        MessageBody::ClientAudioOnly(audio) => assert_eq!(audio.data, Bytes::from(vec![3u8; 3200])),
        other => panic!("unexpected body {:?}", other),
    }

    // inbound gzip from the service
    let body = notice("compressed notice");
    let frame = FrameCodec::new()
        .encode_message(&body, Compression::Gzip, body.message_type().serialization())
        .unwrap();
    peer.send_raw(frame.bytes);
    loop {
        let event = next_dialog(&mut dialog_rx).await;
        if event.payload["event"] == "compressed notice" {
            break;
        }
    }

    assert_ok!(client.finish_session("s1", &cancel).await);
    let end = peer.next_of(MessageType::SessionEnd).await;
    assert_eq!(end.header.compression, Compression::Gzip);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn truncated_message_costs_only_its_own_frame() {
    let (client, peer) = connected(ClientConfig::default()).await;
    let errors = record_errors(&client);
    let mut dialog_rx = dialog_events(&client);

    let body = notice("cut short");
    let frame = FrameCodec::new()
        .encode_message(&body, Compression::None, body.message_type().serialization())
        .unwrap();
    peer.send_raw(frame.bytes.slice(..frame.bytes.len() - 5));
    for i in 0..5 {
        peer.send(notice(&format!("valid {}", i)));
    }

    for i in 0..5 {
        let event = next_dialog(&mut dialog_rx).await;
        assert_eq!(event.payload["event"], format!("valid {}", i));
    }
    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert_eq!(errors[0].kind, ErrorKind::Integrity);
    assert_eq!(client.stats().integrity_failures, 1);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn reject_policy_drops_stale_frames_and_reports_them() {
    let config = ClientConfig {
        sequence_policy: SequencePolicy::Reject,
        ..ClientConfig::default()
    };
    let (client, peer) = connected(config).await;
    let errors = record_errors(&client);
    let mut dialog_rx = dialog_events(&client);

    let codec = FrameCodec::new();
    let frames: Vec<Bytes> = ["first", "second", "third", "fourth"]
        .iter()
        .map(|event| {
            let body = notice(event);
            codec
                .encode_message(&body, Compression::None, body.message_type().serialization())
                .unwrap()
                .bytes
        })
        .collect();
    // sequences 1, 3, then a stale 2, then 4
    for index in [0, 2, 1, 3] {
        peer.send_raw(frames[index].clone());
    }

    for expected in ["first", "third", "fourth"] {
        assert_eq!(next_dialog(&mut dialog_rx).await.payload["event"], expected);
    }
    assert!(dialog_rx.try_recv().is_err());

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert_eq!(errors[0].kind, ErrorKind::Integrity);
    assert_eq!(client.stats().out_of_order_frames, 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn server_error_answering_start_fails_it_and_stays_connected() {
    let client = DialogClient::new(ClientConfig::default()).unwrap();
    let (client_ws, peer_ws) = socket_pair().await;
    let mut peer = spawn_peer(peer_ws, false);
    assert_ok!(client.connect_stream(client_ws, &CancellationToken::new()).await);

    let starting = {
        let client = client.clone();
        tokio::spawn(async move { client.start_session("s1", json!({}), &CancellationToken::new()).await })
    };
    peer.next_of(MessageType::SessionStart).await;
    peer.send(MessageBody::ServerErrorResponse(ServerError {
        session_id: Some("s1".to_string()),
        code: 45000001,
        message: "invalid speaker".to_string(),
    }));

    let err = assert_err!(starting.await.unwrap());
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.session().is_none());
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn cancelled_connect_rolls_back_to_disconnected() {
    // accepts TCP but never answers the WebSocket handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/dialogue", listener.local_addr().unwrap());

    let client = DialogClient::new(ClientConfig::default()).unwrap();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        client
            .events()
            .on_state_changed(move |old, new| transitions.lock().unwrap().push((old, new)));
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = assert_err!(client.connect(ConnectConfig::new(endpoint), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Disconnected),
        ]
    );
    drop(listener);
}

#[tokio::test]
async fn disconnect_waits_out_a_teardown_already_in_flight() {
    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(100),
        finish_timeout: Duration::from_millis(500),
        reconnect: ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_missed_heartbeats: Some(1),
            ..ReconnectConfig::default()
        },
        ..ClientConfig::default()
    };
    let client = DialogClient::new(config).unwrap();

    // a peer that never reads, behind a small socket buffer
    let (client_io, peer_io) = tokio::io::duplex(8 * 1024);
    let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let _silent_peer = WebSocketStream::from_raw_socket(peer_io, Role::Server, None).await;
    assert_ok!(client.connect_stream(client_ws, &CancellationToken::new()).await);
    wait_until(|| client.stats().heartbeats_sent >= 1).await;

    // an oversized start stalls mid-write and keeps the close handshake waiting
    let stalled = CancellationToken::new();
    let stalled_start = {
        let client = client.clone();
        let stalled = stalled.clone();
        let config = json!({ "padding": "x".repeat(256 * 1024) });
        tokio::spawn(async move { client.start_session("s0", config, &stalled).await })
    };
    wait_until(|| client.state() == ConnectionState::Closing).await;

    assert_ok!(client.disconnect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let (client_ws, peer_ws) = socket_pair().await;
    let _peer = spawn_peer(peer_ws, true);
    assert_ok!(client.connect_stream(client_ws, &CancellationToken::new()).await);

    // outlive the old close handshake bound
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ok!(client.start_session("s1", json!({}), &CancellationToken::new()).await);
    assert_eq!(client.state(), ConnectionState::SessionActive);
    assert_eq!(client.stats().reconnect_count, 0);

    stalled.cancel();
    assert_err!(stalled_start.await.unwrap());
    assert_eq!(client.state(), ConnectionState::SessionActive);
    assert_ok!(client.disconnect().await);
}

#[tokio::test]
async fn silent_peer_is_only_counted_without_reconnect() {
    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(20),
        finish_timeout: Duration::from_millis(100),
        reconnect: ReconnectConfig {
            enabled: false,
            max_missed_heartbeats: Some(1),
            ..ReconnectConfig::default()
        },
        ..ClientConfig::default()
    };
    let client = DialogClient::new(config).unwrap();
    let (client_ws, _silent_peer) = socket_pair().await;
    assert_ok!(client.connect_stream(client_ws, &CancellationToken::new()).await);

    wait_until(|| client.stats().missed_heartbeats >= 3).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ok!(client.disconnect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
