//! TCP session implementation.
//!
//! Each session owns one TCP stream. A background reader task decodes frames,
//! answers pings, resolves pending administrative requests and queues
//! stanzas for a per-session delivery task, so a slow inbound handler never
//! holds up pongs or acks. When the stream drops and reconnection is
//! enabled, the reader re-establishes the stream after a fixed delay and swaps
//! the new write half in place; the session handle stays the same.

use crate::traits::{
    Connector, Credentials, InboundHandler, Session, SessionKind, TransportError,
};
use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use plate_protocol::frames::is_compatible;
use plate_protocol::{codec, Frame, Jid, Stanza};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_CAPACITY: usize = 4096;

/// Stanzas a session buffers ahead of its inbound handler.
const INBOUND_QUEUE: usize = 1024;

/// Fixed-delay reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(5),
        }
    }
}

/// Connection settings shared by every session a connector opens.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    /// Domain the stream is opened against; peers are addressed as `local@domain`.
    pub domain: String,
    /// Request stream compression in the open frame.
    pub compression: bool,
    /// Bound on TCP connect and on each handshake reply.
    pub connect_timeout: Duration,
    /// Bound on administrative request round trips.
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5222,
            domain: "localhost".to_string(),
            compression: true,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Opens TCP sessions.
///
/// Streams are plaintext: transport security is left to the deployment
/// network.
pub struct TcpConnector {
    config: TcpConfig,
    inbound: OnceLock<Weak<dyn InboundHandler>>,
}

impl TcpConnector {
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            inbound: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    /// Only the first call has an effect.
    fn set_inbound_handler(&self, handler: &Arc<dyn InboundHandler>) {
        if self.inbound.set(Arc::downgrade(handler)).is_err() {
            warn!("Inbound handler already installed, ignoring");
        }
    }

    async fn connect(
        &self,
        credentials: &Credentials,
        kind: SessionKind,
    ) -> Result<Arc<dyn Session>, TransportError> {
        debug!(
            principal = %credentials.username,
            host = %self.config.host,
            port = self.config.port,
            ?kind,
            "Opening session"
        );

        let (link, writer, jid) = establish(&self.config, credentials).await?;

        let shared = Arc::new(Shared {
            principal: credentials.username.clone(),
            jid,
            created_at: now_millis(),
            live: AtomicBool::new(true),
            writer: Mutex::new(Some(writer)),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            request_timeout: self.config.request_timeout,
        });

        let inbound = match (kind, self.inbound.get()) {
            (SessionKind::Principal, Some(handler)) => {
                let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
                tokio::spawn(deliver_inbound(
                    shared.principal.clone(),
                    Weak::clone(handler),
                    rx,
                ));
                Some(tx)
            }
            _ => None,
        };
        let reconnect = kind == SessionKind::Principal && self.config.reconnect.enabled;

        let reader = Reader {
            shared: Arc::clone(&shared),
            config: self.config.clone(),
            credentials: credentials.clone(),
            inbound,
            reconnect,
        };
        tokio::spawn(reader.run(link));

        info!(principal = %shared.principal, jid = %shared.jid, "Session established");
        Ok(Arc::new(TcpSession { shared }))
    }
}

/// Read side of an established stream.
struct Link {
    reader: OwnedReadHalf,
    buf: BytesMut,
}

/// State shared between the session handle and its reader task.
struct Shared {
    principal: String,
    jid: Jid,
    created_at: u64,
    live: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: DashMap<u64, oneshot::Sender<Result<(), TransportError>>>,
    next_request: AtomicU64,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl Shared {
    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotLive)?;

        if let Err(e) = writer.write_all(&data).await {
            // The reader notices the broken stream and drives reconnection.
            self.live.store(false, Ordering::Release);
            guard.take();
            return Err(e.into());
        }
        Ok(())
    }

    async fn request(&self, build: impl FnOnce(u64) -> Frame) -> Result<(), TransportError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.write_frame(&build(id)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn resolve(&self, id: u64, result: Result<(), TransportError>) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    async fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
        self.writer.lock().await.take();
        // Dropping the senders wakes every waiter with ConnectionClosed.
        self.pending.clear();
    }
}

struct Reader {
    shared: Arc<Shared>,
    config: TcpConfig,
    credentials: Credentials,
    inbound: Option<mpsc::Sender<Stanza>>,
    reconnect: bool,
}

/// Hand queued stanzas to the handler in arrival order. Ends with the reader.
async fn deliver_inbound(
    principal: String,
    handler: Weak<dyn InboundHandler>,
    mut stanzas: mpsc::Receiver<Stanza>,
) {
    while let Some(stanza) = stanzas.recv().await {
        match handler.upgrade() {
            Some(handler) => handler.on_stanza(&principal, stanza).await,
            None => debug!(principal = %principal, "Inbound handler gone, dropping stanza"),
        }
    }
}

impl Reader {
    async fn run(self, mut link: Link) {
        loop {
            let reason = self.pump(&mut link).await;
            self.shared.mark_dead().await;

            if self.shared.shutdown.is_cancelled() {
                debug!(principal = %self.shared.principal, "Reader stopped");
                return;
            }
            warn!(principal = %self.shared.principal, reason = %reason, "Session lost");

            if !self.reconnect {
                return;
            }
            match self.reestablish().await {
                Some(next) => link = next,
                None => return,
            }
        }
    }

    /// Process frames until the stream ends. Returns why it ended.
    async fn pump(&self, link: &mut Link) -> TransportError {
        loop {
            let frame = tokio::select! {
                () = self.shared.shutdown.cancelled() => return TransportError::ConnectionClosed,
                frame = read_frame(&mut link.reader, &mut link.buf) => frame,
            };

            match frame {
                Ok(Frame::Close { reason }) => {
                    debug!(principal = %self.shared.principal, ?reason, "Server closed stream");
                    return TransportError::ConnectionClosed;
                }
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => return e,
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Stanza { stanza } => {
                trace!(principal = %self.shared.principal, id = %stanza.id, "Inbound stanza");
                match &self.inbound {
                    Some(queue) => {
                        if queue.send(stanza).await.is_err() {
                            debug!(principal = %self.shared.principal, "Inbound delivery stopped, dropping stanza");
                        }
                    }
                    None => debug!(principal = %self.shared.principal, "No inbound handler, dropping stanza"),
                }
            }
            Frame::Ping { timestamp } => {
                if let Err(e) = self.shared.write_frame(&Frame::pong(timestamp)).await {
                    debug!(principal = %self.shared.principal, error = %e, "Failed to answer ping");
                }
            }
            Frame::Pong { .. } => {}
            Frame::Ack { id } => {
                if !self.shared.resolve(id, Ok(())) {
                    debug!(id, "Ack for unknown request");
                }
            }
            Frame::Error { id, code, message } => {
                let resolved = id != 0
                    && self.shared.resolve(
                        id,
                        Err(TransportError::Rejected {
                            code,
                            message: message.clone(),
                        }),
                    );
                if !resolved {
                    warn!(principal = %self.shared.principal, code, message = %message, "Server error");
                }
            }
            other => {
                warn!(
                    principal = %self.shared.principal,
                    frame_type = ?other.frame_type(),
                    "Unexpected frame type"
                );
            }
        }
    }

    async fn reestablish(&self) -> Option<Link> {
        let delay = self.config.reconnect.delay;
        loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match establish(&self.config, &self.credentials).await {
                Ok((link, writer, _)) => {
                    if self.shared.shutdown.is_cancelled() {
                        return None;
                    }
                    *self.shared.writer.lock().await = Some(writer);
                    self.shared.live.store(true, Ordering::Release);
                    info!(principal = %self.shared.principal, "Session reconnected");
                    return Some(link);
                }
                Err(e) => {
                    warn!(
                        principal = %self.shared.principal,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }
}

/// Handle to a TCP session.
pub struct TcpSession {
    shared: Arc<Shared>,
}

#[async_trait]
impl Session for TcpSession {
    fn principal(&self) -> &str {
        &self.shared.principal
    }

    fn jid(&self) -> &Jid {
        &self.shared.jid
    }

    fn created_at(&self) -> u64 {
        self.shared.created_at
    }

    fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire) && !self.shared.shutdown.is_cancelled()
    }

    async fn send(&self, stanza: Stanza) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::NotLive);
        }
        let stanza = stanza.with_from(self.shared.jid.clone());
        trace!(principal = %self.shared.principal, to = %stanza.to, id = %stanza.id, "Sending stanza");
        self.shared.write_frame(&Frame::stanza(stanza)).await
    }

    async fn create_account(&self, username: &str, password: &str) -> Result<(), TransportError> {
        self.shared
            .request(|id| Frame::register(id, username, password))
            .await
    }

    async fn delete_account(&self, username: &str) -> Result<(), TransportError> {
        self.shared.request(|id| Frame::unregister(id, username)).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let writer = self.shared.writer.lock().await.take();
        self.shared.shutdown.cancel();
        self.shared.live.store(false, Ordering::Release);

        if let Some(mut writer) = writer {
            let data = codec::encode(&Frame::close(None))?;
            writer.write_all(&data).await?;
            writer.shutdown().await?;
        }
        debug!(principal = %self.shared.principal, "Session disconnected");
        Ok(())
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Connect, open the stream and authenticate.
async fn establish(
    config: &TcpConfig,
    credentials: &Credentials,
) -> Result<(Link, OwnedWriteHalf, Jid), TransportError> {
    let addr = format!("{}:{}", config.host, config.port);
    let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true)?;

    let (reader, mut writer) = stream.into_split();
    let mut link = Link {
        reader,
        buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
    };

    write_to(&mut writer, &Frame::open(&config.domain, config.compression)).await?;
    match handshake_reply(config, &mut link).await? {
        Frame::Opened { version, .. } if is_compatible(version) => {}
        Frame::Opened { version, .. } => {
            return Err(TransportError::StreamRejected(format!(
                "unsupported protocol version {version}"
            )));
        }
        Frame::Error { message, .. } => return Err(TransportError::StreamRejected(message)),
        other => return Err(unexpected(&other)),
    }

    write_to(
        &mut writer,
        &Frame::auth(&credentials.username, &credentials.password),
    )
    .await?;
    let jid = match handshake_reply(config, &mut link).await? {
        Frame::AuthOk { jid } => jid,
        Frame::AuthFailed { reason } => return Err(TransportError::AuthenticationFailed(reason)),
        other => return Err(unexpected(&other)),
    };

    Ok((link, writer, jid))
}

async fn handshake_reply(config: &TcpConfig, link: &mut Link) -> Result<Frame, TransportError> {
    timeout(
        config.connect_timeout,
        read_frame(&mut link.reader, &mut link.buf),
    )
    .await
    .map_err(|_| TransportError::Timeout)?
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Frame, TransportError> {
    loop {
        if let Some(frame) = codec::decode_from(buf)? {
            return Ok(frame);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(TransportError::ConnectionClosed);
        }
    }
}

async fn write_to(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<(), TransportError> {
    let data = codec::encode(frame)?;
    writer.write_all(&data).await?;
    Ok(())
}

fn unexpected(frame: &Frame) -> TransportError {
    TransportError::UnexpectedFrame(format!("{:?}", frame.frame_type()))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
