use crate::clock::Clock;
use crate::device::{DeviceRecord, DeviceSecret, SECRET_BYTES};
use crate::errors::ProvisionError;
use crate::storage::{DeviceStore, StoreError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub device_id: String,
    /// Hex-encoded shared secret
    pub hmac_secret: String,
}

/// Registers devices and hands out their permanent HMAC secret.
#[derive(Clone)]
pub struct CredentialIssuer {
    store: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
}

impl CredentialIssuer {
    pub fn new(store: Arc<dyn DeviceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Load-or-create. Repeated registration of the same device returns the stored secret.
    #[tracing::instrument(name = "register", skip(self))]
    pub async fn register(&self, device_id: &str) -> Result<Registration, ProvisionError> {
        let device_id = require_device_id(device_id)?;

        if let Some(existing) = self.store.get(device_id).await? {
            if let Some(secret) = &existing.secret {
                tracing::warn!(
                    device_id,
                    "re-registration returned the existing secret"
                );
                return Ok(Registration {
                    device_id: device_id.to_string(),
                    hmac_secret: secret.to_hex(),
                });
            }
            return self.assign_secret(existing).await;
        }

        let record = DeviceRecord::register(device_id, generate_secret()?, self.clock.now());
        match self.store.upsert(&record, None).await {
            Ok(stored) => {
                tracing::info!(device_id, "device registered");
                Ok(registration_of(&stored))
            }
            Err(StoreError::VersionConflict(_)) => {
                // A concurrent registration won; its secret is the device's secret.
                let winner = self
                    .store
                    .get(device_id)
                    .await?
                    .ok_or_else(|| ProvisionError::ConcurrentModification(device_id.to_string()))?;
                match &winner.secret {
                    Some(_) => Ok(registration_of(&winner)),
                    None => Err(ProvisionError::ConcurrentModification(device_id.to_string())),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    // Records without a secret only exist if they were written by something other
    // than this service; give them one instead of failing forever.
    async fn assign_secret(&self, mut record: DeviceRecord) -> Result<Registration, ProvisionError> {
        let expected = record.version;
        record.secret = Some(generate_secret()?);
        let stored = self
            .store
            .upsert(&record, Some(expected))
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict(id) => ProvisionError::ConcurrentModification(id),
                other => other.into(),
            })?;
        tracing::info!(
            device_id = %stored.device_id,
            "secret assigned to existing device record"
        );
        Ok(registration_of(&stored))
    }
}

fn registration_of(record: &DeviceRecord) -> Registration {
    Registration {
        device_id: record.device_id.clone(),
        hmac_secret: record
            .secret
            .as_ref()
            .map(DeviceSecret::to_hex)
            .unwrap_or_default(),
    }
}

pub(crate) fn require_device_id(device_id: &str) -> Result<&str, ProvisionError> {
    let trimmed = device_id.trim();
    if trimmed.is_empty() {
        return Err(ProvisionError::Validation("missing device id".to_string()));
    }
    Ok(trimmed)
}

/// 256 bits from the operating system RNG.
pub fn generate_secret() -> Result<DeviceSecret, ProvisionError> {
    let mut bytes = vec![0u8; SECRET_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(DeviceSecret::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryDeviceStore;

    fn issuer() -> (CredentialIssuer, Arc<MemoryDeviceStore>) {
        let store = Arc::new(MemoryDeviceStore::new());
        let issuer = CredentialIssuer::new(
            store.clone(),
            Arc::new(ManualClock::new(1_000)),
        );
        (issuer, store)
    }

    #[tokio::test]
    async fn test_register_creates_record_with_secret() {
        let (issuer, store) = issuer();

        let reg = issuer.register("dev-1").await.expect("Failed to register");
        assert_eq!(reg.device_id, "dev-1");
        assert_eq!(reg.hmac_secret.len(), SECRET_BYTES * 2);

        let record = store.get("dev-1").await.unwrap().expect("Record not stored");
        assert_eq!(record.created_at, 1_000);
        assert_eq!(record.version, 1);
        assert_eq!(record.secret.map(|s| s.to_hex()), Some(reg.hmac_secret));
    }

    #[tokio::test]
    async fn test_register_twice_returns_same_secret() {
        let (issuer, store) = issuer();

        let first = issuer.register("dev-1").await.unwrap();
        let second = issuer.register("dev-1").await.unwrap();
        assert_eq!(first, second);

        // No second write happened
        assert_eq!(store.get("dev-1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_distinct_devices_get_distinct_secrets() {
        let (issuer, _) = issuer();
        let a = issuer.register("dev-a").await.unwrap();
        let b = issuer.register("dev-b").await.unwrap();
        assert_ne!(a.hmac_secret, b.hmac_secret);
    }

    #[tokio::test]
    async fn test_register_fills_in_missing_secret() {
        let (issuer, store) = issuer();
        let mut bare = DeviceRecord::register("dev-1", generate_secret().unwrap(), 0);
        bare.secret = None;
        store.upsert(&bare, None).await.unwrap();

        let reg = issuer.register("dev-1").await.unwrap();
        assert_eq!(reg.hmac_secret.len(), SECRET_BYTES * 2);
        assert_eq!(store.get("dev-1").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_register_rejects_blank_device_id() {
        let (issuer, _) = issuer();
        let err = issuer.register("   ").await.expect_err("Blank id must fail");
        assert!(matches!(err, ProvisionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_concurrent_registration_agrees_on_one_secret() {
        let (issuer, _) = issuer();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let issuer = issuer.clone();
                tokio::spawn(async move { issuer.register("dev-race").await })
            })
            .collect();

        let mut secrets = Vec::new();
        for handle in handles {
            secrets.push(handle.await.unwrap().unwrap().hmac_secret);
        }
        secrets.dedup();
        assert_eq!(secrets.len(), 1);
    }
}
