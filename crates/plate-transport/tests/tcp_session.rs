//! TCP session tests against a loopback server speaking the frame protocol.

use async_trait::async_trait;
use bytes::BytesMut;
use plate_protocol::frames::codes;
use plate_protocol::{codec, Frame, Jid, Stanza, PROTOCOL_VERSION};
use plate_transport::{
    Connector, Credentials, InboundHandler, ReconnectPolicy, SessionKind, TcpConfig, TcpConnector,
    TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};

const DOMAIN: &str = "fleet.local";
const GOOD_PASSWORD: &str = "correct-horse";

/// Events observed by the loopback server.
#[derive(Debug)]
enum ServerEvent {
    Authenticated(String),
    Stanza(Stanza),
    Pong(Option<u64>),
    Closed,
}

struct LoopbackServer {
    port: u16,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    /// Write half of the most recent authenticated stream.
    last_stream: Arc<Mutex<Option<TcpStream>>>,
}

impl LoopbackServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, events) = mpsc::unbounded_channel();
        let last_stream = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&last_stream);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, tx.clone(), Arc::clone(&slot)));
            }
        });

        Self {
            port,
            events,
            last_stream,
        }
    }

    fn config(&self) -> TcpConfig {
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            domain: DOMAIN.to_string(),
            compression: false,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy {
                enabled: false,
                delay: Duration::from_millis(50),
            },
        }
    }

    async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("server event")
            .expect("server running")
    }

    async fn push(&self, frame: &Frame) {
        let mut guard = self.last_stream.lock().await;
        let stream = guard.as_mut().expect("authenticated stream");
        stream.write_all(&codec::encode(frame).unwrap()).await.unwrap();
    }

    async fn drop_stream(&self) {
        if let Some(mut stream) = self.last_stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
    loop {
        if let Some(frame) = codec::decode_from(buf).ok()? {
            return Some(frame);
        }
        if stream.read_buf(buf).await.ok()? == 0 {
            return None;
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    events: mpsc::UnboundedSender<ServerEvent>,
    slot: Arc<Mutex<Option<TcpStream>>>,
) {
    let mut buf = BytesMut::new();
    let reply = |frame: Frame| codec::encode(&frame).unwrap();

    let Some(Frame::Open { domain, .. }) = read_frame(&mut stream, &mut buf).await else {
        return;
    };
    assert_eq!(domain, DOMAIN);
    let opened = Frame::Opened {
        stream_id: "s-1".to_string(),
        version: PROTOCOL_VERSION,
        compression: false,
    };
    stream.write_all(&reply(opened)).await.unwrap();

    let Some(Frame::Auth { username, password }) = read_frame(&mut stream, &mut buf).await else {
        return;
    };
    if password != GOOD_PASSWORD {
        let failed = Frame::AuthFailed {
            reason: "not-authorized".to_string(),
        };
        stream.write_all(&reply(failed)).await.unwrap();
        return;
    }
    let jid = Jid::new(username.clone(), DOMAIN);
    stream.write_all(&reply(Frame::AuthOk { jid })).await.unwrap();
    let _ = events.send(ServerEvent::Authenticated(username));

    // Keep a second handle so tests can push frames or drop the stream.
    let (mut reader, writer) = {
        let std_stream = stream.into_std().unwrap();
        let clone = std_stream.try_clone().unwrap();
        (
            TcpStream::from_std(std_stream).unwrap(),
            TcpStream::from_std(clone).unwrap(),
        )
    };
    *slot.lock().await = Some(writer);

    while let Some(frame) = read_frame(&mut reader, &mut buf).await {
        match frame {
            Frame::Stanza { stanza } => {
                let _ = events.send(ServerEvent::Stanza(stanza));
            }
            Frame::Register { id, username, .. } => {
                let answer = if username == "taken" {
                    Frame::error(id, codes::CONFLICT, "account exists")
                } else {
                    Frame::ack(id)
                };
                reader.write_all(&reply(answer)).await.unwrap();
            }
            Frame::Unregister { id, .. } => {
                reader.write_all(&reply(Frame::ack(id))).await.unwrap();
            }
            Frame::Pong { timestamp } => {
                let _ = events.send(ServerEvent::Pong(timestamp));
            }
            Frame::Close { .. } => break,
            _ => {}
        }
    }
    let _ = events.send(ServerEvent::Closed);
}

#[derive(Default)]
struct CollectingHandler {
    received: Mutex<Vec<(String, Stanza)>>,
}

#[async_trait]
impl InboundHandler for CollectingHandler {
    async fn on_stanza(&self, owner: &str, stanza: Stanza) {
        self.received.lock().await.push((owner.to_string(), stanza));
    }
}

/// Handler that parks on every stanza until released.
#[derive(Default)]
struct ParkedHandler {
    release: Notify,
    received: Mutex<Vec<Stanza>>,
}

#[async_trait]
impl InboundHandler for ParkedHandler {
    async fn on_stanza(&self, _owner: &str, stanza: Stanza) {
        self.release.notified().await;
        self.received.lock().await.push(stanza);
    }
}

fn creds(user: &str) -> Credentials {
    Credentials::new(user, GOOD_PASSWORD)
}

#[tokio::test]
async fn test_connect_and_send_stanza() {
    let mut server = LoopbackServer::start().await;
    let connector = TcpConnector::new(server.config());

    let session = connector
        .connect(&creds("34ABC123"), SessionKind::Principal)
        .await
        .unwrap();
    assert!(session.is_live());
    assert_eq!(session.principal(), "34ABC123");
    assert_eq!(session.jid().to_string(), "34ABC123@fleet.local");
    assert!(matches!(server.next_event().await, ServerEvent::Authenticated(u) if u == "34ABC123"));

    let stanza = Stanza::chat(Jid::new("06XY42", DOMAIN), "hello");
    let id = stanza.id.clone();
    session.send(stanza).await.unwrap();

    match server.next_event().await {
        ServerEvent::Stanza(received) => {
            assert_eq!(received.id, id);
            assert_eq!(received.to.local(), "06XY42");
            assert_eq!(received.from.unwrap().local(), "34ABC123");
            assert_eq!(received.body.as_deref(), Some("hello"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_password_fails_authentication() {
    let server = LoopbackServer::start().await;
    let connector = TcpConnector::new(server.config());

    let result = connector
        .connect(
            &Credentials::new("34ABC123", "wrong"),
            SessionKind::Principal,
        )
        .await;
    assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))));
}

#[tokio::test]
async fn test_inbound_stanza_reaches_handler() {
    let mut server = LoopbackServer::start().await;
    let connector = TcpConnector::new(server.config());
    let collector = Arc::new(CollectingHandler::default());
    let handler: Arc<dyn InboundHandler> = collector.clone();
    connector.set_inbound_handler(&handler);

    let _session = connector
        .connect(&creds("06XY42"), SessionKind::Principal)
        .await
        .unwrap();
    server.next_event().await;

    let stanza = Stanza::chat(Jid::new("06XY42", DOMAIN), "ping from afar")
        .with_from(Jid::new("34ABC123", DOMAIN));
    server.push(&Frame::stanza(stanza)).await;

    for _ in 0..100 {
        if !collector.received.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let received = collector.received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "06XY42");
    assert_eq!(received[0].1.body.as_deref(), Some("ping from afar"));
}

#[tokio::test]
async fn test_admin_requests_are_acknowledged() {
    let mut server = LoopbackServer::start().await;
    let connector = TcpConnector::new(server.config());

    let admin = connector
        .connect(&creds("admin"), SessionKind::Admin)
        .await
        .unwrap();
    server.next_event().await;

    admin.create_account("34ABC123", "pw").await.unwrap();
    admin.delete_account("34ABC123").await.unwrap();

    match admin.create_account("taken", "pw").await {
        Err(TransportError::Rejected { code, .. }) => assert_eq!(code, codes::CONFLICT),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_closes_stream() {
    let mut server = LoopbackServer::start().await;
    let connector = TcpConnector::new(server.config());

    let session = connector
        .connect(&creds("34ABC123"), SessionKind::Principal)
        .await
        .unwrap();
    server.next_event().await;

    session.disconnect().await.unwrap();
    assert!(!session.is_live());
    assert!(matches!(server.next_event().await, ServerEvent::Closed));
    assert!(matches!(
        session.send(Stanza::chat(Jid::new("x", DOMAIN), "late")).await,
        Err(TransportError::NotLive)
    ));
}

#[tokio::test]
async fn test_reconnects_after_stream_loss() {
    let mut server = LoopbackServer::start().await;
    let mut config = server.config();
    config.reconnect.enabled = true;
    let connector = TcpConnector::new(config);

    let session = connector
        .connect(&creds("34ABC123"), SessionKind::Principal)
        .await
        .unwrap();
    server.next_event().await;

    server.drop_stream().await;

    // A second authentication proves the session reconnected on its own.
    loop {
        if let ServerEvent::Authenticated(user) = server.next_event().await {
            assert_eq!(user, "34ABC123");
            break;
        }
    }
    for _ in 0..100 {
        if session.is_live() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.is_live());
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_slow_handler_does_not_block_pings() {
    let mut server = LoopbackServer::start().await;
    let connector = TcpConnector::new(server.config());
    let parked = Arc::new(ParkedHandler::default());
    let handler: Arc<dyn InboundHandler> = parked.clone();
    connector.set_inbound_handler(&handler);

    let _session = connector
        .connect(&creds("06XY42"), SessionKind::Principal)
        .await
        .unwrap();
    server.next_event().await;

    let stanza = Stanza::chat(Jid::new("06XY42", DOMAIN), "first")
        .with_from(Jid::new("34ABC123", DOMAIN));
    server.push(&Frame::stanza(stanza)).await;
    server.push(&Frame::Ping { timestamp: Some(7) }).await;

    // Answered while the handler is still parked on the stanza.
    assert!(matches!(server.next_event().await, ServerEvent::Pong(Some(7))));
    assert!(parked.received.lock().await.is_empty());

    parked.release.notify_one();
    for _ in 0..100 {
        if !parked.received.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let received = parked.received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body.as_deref(), Some("first"));
}
