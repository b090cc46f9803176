//! Debounced chat-state machine.
//!
//! Local clients report typing activity as fast as keys are pressed. For
//! each ordered (principal, peer) pair the machine forwards COMPOSING at
//! once and follows it with PAUSED after the debounce interval, unless a
//! newer state for the pair arrives first.
//!
//! ```text
//!            COMPOSING                    timer fires
//!   NONE ─────────────────▶ PENDING_PAUSE ───────────▶ NONE (emit PAUSED)
//!    ▲                           │
//!    └───────────────────────────┘
//!          any other state (cancel, emit)
//! ```
//!
//! Every emission transmits the chat-state signal from the principal's
//! pooled session, persists the pair's state and broadcasts the request to
//! `chat-state/<peer>`. Each of those steps fails on its own without
//! stopping the others.
//!
//! Emissions for one pair never overlap: submissions and fired timers take
//! the pair's lock, and a pause is only scheduled once its COMPOSING has
//! been emitted.

use crate::fanout::{broadcast, Fanout};
use crate::model::{chat_state_topic, now_millis, ChatState, ChatStateRecord, ChatStateRequest};
use crate::registry::VehicleRegistry;
use crate::store::{ChatStateStore, StoreError};
use dashmap::DashMap;
use plate_protocol::{Jid, Stanza};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default delay between COMPOSING and the automatic PAUSED.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

type PairKey = (String, String);

struct PendingPause {
    generation: u64,
    token: CancellationToken,
}

struct Inner {
    registry: Arc<VehicleRegistry>,
    store: Arc<dyn ChatStateStore>,
    fanout: Arc<dyn Fanout>,
    domain: String,
    debounce: Duration,
    pending: DashMap<PairKey, PendingPause>,
    /// Serializes emissions per pair.
    locks: DashMap<PairKey, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Chat-state machine. Cheap to clone.
#[derive(Clone)]
pub struct ChatStateMachine {
    inner: Arc<Inner>,
}

impl ChatStateMachine {
    #[must_use]
    pub fn new(
        registry: Arc<VehicleRegistry>,
        store: Arc<dyn ChatStateStore>,
        fanout: Arc<dyn Fanout>,
        domain: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                fanout,
                domain: domain.into(),
                debounce,
                pending: DashMap::new(),
                locks: DashMap::new(),
                next_generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Process one state report. Failures are logged, never returned.
    pub async fn submit(&self, request: ChatStateRequest) {
        match self.both_registered(&request).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    principal = %request.plate_number,
                    peer = %request.chat_with_plate,
                    "Chat state for unregistered vehicle dropped"
                );
                return;
            }
            Err(e) => {
                warn!(principal = %request.plate_number, error = %e, "Chat state lookup failed");
                return;
            }
        }

        let key = (request.plate_number.clone(), request.chat_with_plate.clone());
        let lock = self.pair_lock(&key);
        let _guard = lock.lock().await;

        self.cancel_pending(&key);
        self.emit(&request).await;
        if ChatState::parse(&request.state) == Some(ChatState::Composing) {
            self.schedule_pause(key, &request);
        }
    }

    /// [`submit`](Self::submit) on a spawned task.
    pub fn submit_detached(&self, request: ChatStateRequest) -> JoinHandle<()> {
        let machine = self.clone();
        tokio::spawn(async move { machine.submit(request).await })
    }

    /// Last emitted state for the ordered pair.
    pub async fn current_state(
        &self,
        principal: &str,
        peer: &str,
    ) -> Result<Option<ChatStateRecord>, StoreError> {
        self.inner.store.find_chat_state(principal, peer).await
    }

    /// Number of pairs with a PAUSED scheduled.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Cancel every scheduled PAUSED.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pending.clear();
        debug!("Chat-state machine stopped");
    }

    async fn both_registered(&self, request: &ChatStateRequest) -> Result<bool, StoreError> {
        let registry = &self.inner.registry;
        Ok(registry.exists(&request.plate_number).await?
            && registry.exists(&request.chat_with_plate).await?)
    }

    fn pair_lock(&self, key: &PairKey) -> Arc<Mutex<()>> {
        Arc::clone(self.inner.locks.entry(key.clone()).or_default().value())
    }

    fn cancel_pending(&self, key: &PairKey) {
        if let Some((_, pending)) = self.inner.pending.remove(key) {
            pending.token.cancel();
            trace!(principal = %key.0, peer = %key.1, "Cancelled pending pause");
        }
    }

    /// Replace the pair's pending pause with a fresh one. Caller holds the
    /// pair's lock.
    fn schedule_pause(&self, key: PairKey, request: &ChatStateRequest) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        let previous = self.inner.pending.insert(
            key.clone(),
            PendingPause {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let machine = self.clone();
        let paused = request.with_state(ChatState::Paused);
        let debounce = self.inner.debounce;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(debounce) => {}
            }
            let lock = machine.pair_lock(&key);
            let _guard = lock.lock().await;
            // A newer submission may have replaced this timer after it woke.
            let current = machine
                .inner
                .pending
                .remove_if(&key, |_, pending| pending.generation == generation);
            if current.is_none() {
                return;
            }
            machine.emit(&paused).await;
        });
    }

    async fn emit(&self, request: &ChatStateRequest) {
        let principal = request.plate_number.as_str();
        let peer = request.chat_with_plate.as_str();

        match ChatState::parse(&request.state) {
            Some(state) => self.transmit(principal, peer, state).await,
            None => debug!(principal = %principal, state = %request.state, "Unknown chat state, not transmitted"),
        }

        if let Err(e) = self
            .inner
            .store
            .upsert_chat_state(principal, peer, &request.state, now_millis())
            .await
        {
            warn!(principal = %principal, peer = %peer, error = %e, "Failed to persist chat state");
        }

        broadcast(self.inner.fanout.as_ref(), &chat_state_topic(peer), request);
        trace!(principal = %principal, peer = %peer, state = %request.state, "Emitted chat state");
    }

    async fn transmit(&self, principal: &str, peer: &str, state: ChatState) {
        let session = match self.inner.registry.session(principal).await {
            Ok(session) => session,
            Err(e) => {
                warn!(principal = %principal, error = %e, "No session for chat state");
                return;
            }
        };
        let stanza = Stanza::chat_state(Jid::new(peer, self.inner.domain.as_str()), state.signal());
        if let Err(e) = session.send(stanza).await {
            warn!(principal = %principal, peer = %peer, error = %e, "Failed to send chat state");
        }
    }
}
