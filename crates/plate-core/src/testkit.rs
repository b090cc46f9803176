//! In-process fakes shared by the unit tests.

use crate::credentials::SecretCipher;
use crate::gateway::{Gateway, GatewayConfig};
use crate::model::{ChatStateRecord, MessageRecord, NewMessage};
use crate::registry::VehicleRegistry;
use crate::store::{ChatStateStore, MemoryStore, MessageStore, StoreError, Stores};
use async_trait::async_trait;
use dashmap::DashMap;
use plate_protocol::frames::codes;
use plate_protocol::{ChatStateSignal, Jid, Stanza};
use plate_transport::{
    Connector, Credentials, InboundHandler, Session, SessionKind, TransportError,
};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub(crate) const DOMAIN: &str = "fleet.local";

#[derive(Default)]
struct ServerState {
    connects: DashMap<String, usize>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    sent: Mutex<Vec<Stanza>>,
    accounts: DashMap<String, String>,
    inbound: Mutex<Option<Weak<dyn InboundHandler>>>,
    clock: AtomicU64,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
    fail_disconnect: AtomicBool,
    reject_accounts: AtomicBool,
    connect_delay: Mutex<Duration>,
}

/// Remote server double recording everything the gateway does to it.
pub(crate) struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(ServerState::default()),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub(crate) fn connect_count(&self, principal: &str) -> usize {
        self.state.connects.get(principal).map(|c| *c).unwrap_or(0)
    }

    pub(crate) fn last_session(&self, principal: &str) -> Option<Arc<FakeSession>> {
        let sessions = self.state.sessions.lock().unwrap();
        sessions
            .iter()
            .rev()
            .find(|s| s.principal == principal)
            .cloned()
    }

    /// Simulate the server dropping every stream of `principal`.
    pub(crate) fn kill_sessions(&self, principal: &str) {
        for session in self.state.sessions.lock().unwrap().iter() {
            if session.principal == principal {
                session.live.store(false, Ordering::SeqCst);
            }
        }
    }

    pub(crate) fn sent_by(&self, principal: &str) -> Vec<Stanza> {
        self.state
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.from.as_ref().is_some_and(|j| j.local() == principal))
            .cloned()
            .collect()
    }

    pub(crate) fn chat_states_sent(&self, principal: &str) -> Vec<ChatStateSignal> {
        self.sent_by(principal)
            .into_iter()
            .filter_map(|s| s.chat_state)
            .collect()
    }

    pub(crate) fn account_password(&self, username: &str) -> Option<String> {
        self.state.accounts.get(username).map(|p| p.clone())
    }

    /// Push a stanza to the session owned by `owner`.
    pub(crate) async fn deliver(&self, owner: &str, stanza: Stanza) {
        let handler = self
            .state
            .inbound
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(handler) = handler {
            handler.on_stanza(owner, stanza).await;
        }
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_send(&self, fail: bool) {
        self.state.fail_send.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_disconnect(&self, fail: bool) {
        self.state.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_reject_accounts(&self, reject: bool) {
        self.state.reject_accounts.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }
}

struct FakeConnector {
    state: Arc<ServerState>,
}

#[async_trait]
impl Connector for FakeConnector {
    fn set_inbound_handler(&self, handler: &Arc<dyn InboundHandler>) {
        *self.state.inbound.lock().unwrap() = Some(Arc::downgrade(handler));
    }

    async fn connect(
        &self,
        credentials: &Credentials,
        kind: SessionKind,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self
            .state
            .connects
            .entry(credentials.username.clone())
            .or_default() += 1;

        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(expected) = self.state.accounts.get(&credentials.username) {
            if *expected != credentials.password {
                return Err(TransportError::AuthenticationFailed(
                    "not-authorized".to_string(),
                ));
            }
        }

        let session = Arc::new(FakeSession {
            principal: credentials.username.clone(),
            jid: Jid::new(credentials.username.as_str(), DOMAIN),
            created_at: self.state.clock.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            live: AtomicBool::new(true),
            state: Arc::clone(&self.state),
        });
        self.state
            .sessions
            .lock()
            .unwrap()
            .push(Arc::clone(&session));
        Ok(session)
    }
}

pub(crate) struct FakeSession {
    principal: String,
    jid: Jid,
    created_at: u64,
    kind: SessionKind,
    live: AtomicBool,
    state: Arc<ServerState>,
}

impl FakeSession {
    fn admin_request(&self) -> Result<(), TransportError> {
        if self.kind != SessionKind::Admin {
            return Err(TransportError::Rejected {
                code: codes::FORBIDDEN,
                message: "not an admin session".to_string(),
            });
        }
        if self.state.reject_accounts.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                code: codes::CONFLICT,
                message: "rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Session for FakeSession {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn jid(&self) -> &Jid {
        &self.jid
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn send(&self, stanza: Stanza) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::NotLive);
        }
        if self.state.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let stanza = stanza.with_from(self.jid.clone());
        self.state.sent.lock().unwrap().push(stanza);
        Ok(())
    }

    async fn create_account(&self, username: &str, password: &str) -> Result<(), TransportError> {
        self.admin_request()?;
        self.state
            .accounts
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn delete_account(&self, username: &str) -> Result<(), TransportError> {
        self.admin_request()?;
        self.state.accounts.remove(username);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.live.store(false, Ordering::SeqCst);
        if self.state.fail_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

/// Chat-state store remembering every upsert in order.
struct RecordingChatStateStore {
    inner: Arc<MemoryStore>,
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatStateStore for RecordingChatStateStore {
    async fn upsert_chat_state(
        &self,
        principal: &str,
        peer: &str,
        state: &str,
        timestamp: u64,
    ) -> Result<ChatStateRecord, StoreError> {
        self.log.lock().unwrap().push(state.to_string());
        self.inner
            .upsert_chat_state(principal, peer, state, timestamp)
            .await
    }

    async fn find_chat_state(
        &self,
        principal: &str,
        peer: &str,
    ) -> Result<Option<ChatStateRecord>, StoreError> {
        self.inner.find_chat_state(principal, peer).await
    }
}

/// Message store whose inserts take `delay` before reaching the inner store.
struct SlowMessageStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl MessageStore for SlowMessageStore {
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_message(message).await
    }

    async fn update_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.inner.update_message(record).await
    }

    async fn find_message(&self, id: u64) -> Result<Option<MessageRecord>, StoreError> {
        self.inner.find_message(id).await
    }

    async fn find_by_stanza_id(
        &self,
        stanza_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        self.inner.find_by_stanza_id(stanza_id).await
    }

    async fn messages_involving(&self, principal: &str) -> Result<Vec<MessageRecord>, StoreError> {
        self.inner.messages_involving(principal).await
    }

    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<MessageRecord>, StoreError> {
        self.inner.conversation(a, b).await
    }

    async fn count_unread(&self, principal: &str) -> Result<u64, StoreError> {
        self.inner.count_unread(principal).await
    }
}

/// A gateway over in-memory stores and a [`FakeServer`].
pub(crate) struct TestGateway {
    gateway: Gateway,
    store: Arc<MemoryStore>,
    chat_log: Arc<RecordingChatStateStore>,
}

impl TestGateway {
    /// Persisted chat states in upsert order.
    pub(crate) fn recorded_chat_states(&self) -> Vec<String> {
        self.chat_log.log.lock().unwrap().clone()
    }

    pub(crate) fn message_count(&self) -> usize {
        self.store.message_count()
    }
}

impl Deref for TestGateway {
    type Target = Gateway;

    fn deref(&self) -> &Gateway {
        &self.gateway
    }
}

pub(crate) fn gateway(server: &FakeServer) -> TestGateway {
    build_gateway(server, Duration::ZERO)
}

/// Like [`gateway`], with every message insert delayed.
pub(crate) fn gateway_with_slow_inserts(server: &FakeServer, delay: Duration) -> TestGateway {
    build_gateway(server, delay)
}

fn build_gateway(server: &FakeServer, insert_delay: Duration) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    let messages: Arc<dyn MessageStore> = if insert_delay.is_zero() {
        store.clone()
    } else {
        Arc::new(SlowMessageStore {
            inner: Arc::clone(&store),
            delay: insert_delay,
        })
    };
    let chat_log = Arc::new(RecordingChatStateStore {
        inner: Arc::clone(&store),
        log: Mutex::new(Vec::new()),
    });
    let stores = Stores {
        messages,
        chat_states: chat_log.clone(),
        vehicles: store.clone(),
        credentials: store.clone(),
    };
    let config = GatewayConfig {
        domain: DOMAIN.to_string(),
        admin: Credentials::new("admin", "admin-pw"),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(
        config,
        server.connector(),
        stores,
        Arc::new(SecretCipher::from_secret("test-secret")),
    );
    TestGateway {
        gateway,
        store,
        chat_log,
    }
}

pub(crate) fn registry(server: &FakeServer) -> Arc<VehicleRegistry> {
    Arc::clone(gateway(server).registry())
}
