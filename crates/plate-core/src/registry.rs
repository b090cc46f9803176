//! Vehicle registration and principal credentials.
//!
//! A vehicle's plate number is its principal. Registering one creates the
//! remote account with a generated password and stores that password
//! encrypted; the pool later authenticates with it.

use crate::credentials::{generate_password, CredentialCipher, CryptoError, PASSWORD_LENGTH};
use crate::model::{NewVehicle, VehicleRecord};
use crate::pool::{ConnectionError, ConnectionPool};
use crate::provisioner::{AccountProvisioner, ProvisionError};
use crate::store::{CredentialStore, StoreError, VehicleStore};
use plate_transport::Session;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Vehicle not found: {0}")]
    NotFound(String),

    #[error("Vehicle already exists: {0}")]
    AlreadyExists(String),

    #[error("No stored credential for {0}")]
    MissingCredential(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(#[from] ProvisionError),

    #[error("Credential error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => RegistryError::AlreadyExists(key),
            other => RegistryError::Store(other),
        }
    }
}

pub struct VehicleRegistry {
    vehicles: Arc<dyn VehicleStore>,
    credentials: Arc<dyn CredentialStore>,
    cipher: Arc<dyn CredentialCipher>,
    provisioner: Arc<dyn AccountProvisioner>,
    pool: Arc<ConnectionPool>,
}

impl VehicleRegistry {
    #[must_use]
    pub fn new(
        vehicles: Arc<dyn VehicleStore>,
        credentials: Arc<dyn CredentialStore>,
        cipher: Arc<dyn CredentialCipher>,
        provisioner: Arc<dyn AccountProvisioner>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            vehicles,
            credentials,
            cipher,
            provisioner,
            pool,
        }
    }

    /// Register a vehicle and provision its remote account.
    ///
    /// The record is claimed first so concurrent registrations of one plate
    /// conflict; it is removed again if provisioning fails.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] for a known plate, otherwise the
    /// provisioning, encryption or store failure.
    pub async fn register(
        &self,
        user_id: &str,
        plate: &str,
    ) -> Result<VehicleRecord, RegistryError> {
        let record = self
            .vehicles
            .insert_vehicle(NewVehicle {
                user_id: user_id.to_string(),
                plate_number: plate.to_string(),
                xmpp_username: plate.to_string(),
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => RegistryError::AlreadyExists(plate.to_string()),
                other => RegistryError::Store(other),
            })?;

        if let Err(e) = self.provision(plate).await {
            warn!(plate = %plate, error = %e, "Registration failed, rolling back");
            if let Err(e) = self.vehicles.delete_vehicle(plate).await {
                warn!(plate = %plate, error = %e, "Rollback failed");
            }
            return Err(e);
        }

        info!(plate = %plate, user_id = %user_id, "Registered vehicle");
        Ok(record)
    }

    async fn provision(&self, plate: &str) -> Result<(), RegistryError> {
        let password = generate_password(PASSWORD_LENGTH);
        let sealed = self.cipher.encrypt(&password)?;
        self.provisioner.create_account(plate, &password).await?;
        if let Err(e) = self.credentials.put_credential(plate, &sealed).await {
            if let Err(rollback) = self.provisioner.delete_account(plate).await {
                error!(
                    plate = %plate,
                    error = %rollback,
                    "Remote account left behind after credential write failed"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove a vehicle, its pooled session, credential and remote account.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the plate is unknown.
    pub async fn delete(&self, plate: &str) -> Result<(), RegistryError> {
        if self.vehicles.find_vehicle(plate).await?.is_none() {
            return Err(RegistryError::NotFound(plate.to_string()));
        }

        self.pool.release(plate).await;
        if let Err(e) = self.provisioner.delete_account(plate).await {
            warn!(plate = %plate, error = %e, "Remote account removal failed");
        }
        self.credentials.delete_credential(plate).await?;
        self.vehicles.delete_vehicle(plate).await?;
        info!(plate = %plate, "Deleted vehicle");
        Ok(())
    }

    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the plate is unknown.
    pub async fn get(&self, plate: &str) -> Result<VehicleRecord, RegistryError> {
        self.vehicles
            .find_vehicle(plate)
            .await?
            .ok_or_else(|| RegistryError::NotFound(plate.to_string()))
    }

    pub async fn exists(&self, plate: &str) -> Result<bool, StoreError> {
        Ok(self.vehicles.find_vehicle(plate).await?.is_some())
    }

    pub async fn list(&self) -> Result<Vec<VehicleRecord>, RegistryError> {
        Ok(self.vehicles.list_vehicles().await?)
    }

    /// Decrypted protocol password for `plate`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::MissingCredential`] if none is stored.
    pub async fn credential(&self, plate: &str) -> Result<String, RegistryError> {
        let sealed = self
            .credentials
            .get_credential(plate)
            .await?
            .ok_or_else(|| RegistryError::MissingCredential(plate.to_string()))?;
        Ok(self.cipher.decrypt(&sealed)?)
    }

    /// Live pooled session for `plate`, authenticated with its stored credential.
    ///
    /// # Errors
    ///
    /// Credential or connection failures.
    pub async fn session(&self, plate: &str) -> Result<Arc<dyn Session>, RegistryError> {
        let password = self.credential(plate).await?;
        let session = self.pool.acquire(plate, &password).await?;
        if let Err(e) = self.touch_last_connected(plate, session.created_at()).await {
            debug!(plate = %plate, error = %e, "Could not record connection time");
        }
        Ok(session)
    }

    /// Record when the current session for `plate` was established.
    pub async fn touch_last_connected(&self, plate: &str, at: u64) -> Result<(), RegistryError> {
        let Some(mut record) = self.vehicles.find_vehicle(plate).await? else {
            return Err(RegistryError::NotFound(plate.to_string()));
        };
        if record.last_connected_at == Some(at) {
            return Ok(());
        }
        record.last_connected_at = Some(at);
        self.vehicles.update_vehicle(&record).await?;
        Ok(())
    }
}
