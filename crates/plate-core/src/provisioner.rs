//! Remote account provisioning.

use crate::pool::{ConnectionError, ConnectionPool};
use async_trait::async_trait;
use plate_transport::TransportError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Admin connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Account operation failed for {username}: {source}")]
    Rejected {
        username: String,
        #[source]
        source: TransportError,
    },
}

/// Creates and removes accounts on the remote server.
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    async fn create_account(&self, username: &str, password: &str) -> Result<(), ProvisionError>;

    async fn delete_account(&self, username: &str) -> Result<(), ProvisionError>;
}

/// Provisioner running each operation on its own admin session.
pub struct AdminProvisioner {
    pool: Arc<ConnectionPool>,
}

impl AdminProvisioner {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountProvisioner for AdminProvisioner {
    async fn create_account(&self, username: &str, password: &str) -> Result<(), ProvisionError> {
        let admin = self.pool.acquire_admin().await?;
        let result = admin.create_account(username, password).await;
        admin.close().await;
        result.map_err(|source| ProvisionError::Rejected {
            username: username.to_string(),
            source,
        })?;
        info!(username = %username, "Created remote account");
        Ok(())
    }

    async fn delete_account(&self, username: &str) -> Result<(), ProvisionError> {
        let admin = self.pool.acquire_admin().await?;
        let result = admin.delete_account(username).await;
        admin.close().await;
        result.map_err(|source| ProvisionError::Rejected {
            username: username.to_string(),
            source,
        })?;
        debug!(username = %username, "Deleted remote account");
        Ok(())
    }
}
