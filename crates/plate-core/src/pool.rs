//! Per-principal connection pool.
//!
//! Holds zero or one session per principal. Each principal owns a slot
//! guarded by an async mutex, so the check-live, evict, connect and insert
//! sequence runs atomically per principal while the map lock is only held
//! for the slot lookup itself.

use dashmap::DashMap;
use plate_transport::{Connector, Credentials, Session, SessionKind, TransportError};
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Pool errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connecting or authenticating failed.
    #[error("Failed to connect {principal}: {source}")]
    Transport {
        principal: String,
        #[source]
        source: TransportError,
    },
}

impl ConnectionError {
    #[must_use]
    pub fn principal(&self) -> &str {
        match self {
            ConnectionError::Transport { principal, .. } => principal,
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Arc<dyn Session>>,
    /// Set once the slot has left the map. Waiters seeing it start over.
    retired: bool,
}

/// Pool of long-lived principal sessions.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    admin: Credentials,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, admin: Credentials) -> Self {
        Self {
            connector,
            admin,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, principal: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(principal.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Return the live session for `principal`, connecting if needed.
    ///
    /// A dead session is disconnected and replaced. On failure nothing is
    /// left in the pool for the principal.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] if connecting fails.
    pub async fn acquire(
        &self,
        principal: &str,
        password: &str,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        loop {
            let slot = self.slot(principal);
            let mut guard = slot.lock().await;
            if guard.retired {
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }

            if let Some(session) = guard.session.take() {
                if session.is_live() {
                    guard.session = Some(Arc::clone(&session));
                    return Ok(session);
                }
                debug!(principal = %principal, "Evicting stale session");
                if let Err(e) = session.disconnect().await {
                    debug!(principal = %principal, error = %e, "Stale session disconnect failed");
                }
            }

            let credentials = Credentials::new(principal, password);
            match self
                .connector
                .connect(&credentials, SessionKind::Principal)
                .await
            {
                Ok(session) => {
                    info!(principal = %principal, "Pooled new session");
                    guard.session = Some(Arc::clone(&session));
                    return Ok(session);
                }
                Err(source) => {
                    guard.retired = true;
                    drop(guard);
                    self.slots
                        .remove_if(principal, |_, current| Arc::ptr_eq(current, &slot));
                    warn!(principal = %principal, error = %source, "Connection failed");
                    return Err(ConnectionError::Transport {
                        principal: principal.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Disconnect and forget the session for `principal`.
    ///
    /// Disconnect errors are logged.
    pub async fn release(&self, principal: &str) {
        let Some((_, slot)) = self.slots.remove(principal) else {
            return;
        };
        let mut guard = slot.lock().await;
        guard.retired = true;
        if let Some(session) = guard.session.take() {
            // Always disconnect: a dead session may still be reconnecting.
            if let Err(e) = session.disconnect().await {
                warn!(principal = %principal, error = %e, "Disconnect failed");
            }
            debug!(principal = %principal, "Released session");
        }
    }

    /// Whether a live session is pooled for `principal`.
    pub async fn is_live(&self, principal: &str) -> bool {
        let Some(slot) = self.slots.get(principal).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let guard = slot.lock().await;
        guard.session.as_ref().is_some_and(|s| s.is_live())
    }

    /// Open an unpooled administrative session.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] if connecting fails.
    pub async fn acquire_admin(&self) -> Result<AdminSession, ConnectionError> {
        let session = self
            .connector
            .connect(&self.admin, SessionKind::Admin)
            .await
            .map_err(|source| ConnectionError::Transport {
                principal: self.admin.username.clone(),
                source,
            })?;
        debug!(admin = %self.admin.username, "Admin session opened");
        Ok(AdminSession {
            session: Some(session),
        })
    }

    /// Disconnect every pooled session.
    pub async fn shutdown_all(&self) {
        let principals: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        info!(sessions = principals.len(), "Shutting down connection pool");
        for principal in principals {
            self.release(&principal).await;
        }
    }

    /// Number of principals with a pool slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Scoped administrative session.
///
/// Disconnects on [`AdminSession::close`] or, failing that, on drop.
pub struct AdminSession {
    session: Option<Arc<dyn Session>>,
}

impl AdminSession {
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect().await {
                warn!(error = %e, "Admin session disconnect failed");
            }
        }
    }
}

impl Deref for AdminSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            // Only `close` clears the session and it consumes the guard.
            None => unreachable!("admin session used after close"),
        }
    }
}

impl Drop for AdminSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.disconnect().await {
                        warn!(error = %e, "Admin session disconnect failed");
                    }
                });
            }
            Err(_) => warn!("No runtime to disconnect admin session"),
        }
    }
}
