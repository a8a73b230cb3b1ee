use crate::device::{ActivationCode, Claim, DeviceRecord, DeviceSecret};
use crate::entities;
use crate::settings::Database as DbCfg;
use async_trait::async_trait;
use migration::MigratorTrait;
use miette::Diagnostic;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, SqlErr,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("Version conflict on device `{0}`")]
    #[diagnostic(code(provisioner::store::version_conflict))]
    VersionConflict(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(provisioner::store::db))]
    Db(#[from] DbErr),

    #[error("Store operation timed out after {0:?}")]
    #[diagnostic(code(provisioner::store::timeout))]
    Timeout(Duration),

    #[error("Corrupt device record `{device_id}`: {reason}")]
    #[diagnostic(code(provisioner::store::corrupt))]
    Corrupt { device_id: String, reason: String },
}

/// Persistence contract for device records.
///
/// Writes are whole-record overwrites guarded by the record version:
/// `expected_version = None` creates the record and fails if it already exists,
/// `Some(v)` replaces it only while the stored version is still `v`. Both cases
/// report a lost race as [`StoreError::VersionConflict`] and return the stored
/// record with its new version on success.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn upsert(
        &self,
        record: &DeviceRecord,
        expected_version: Option<i64>,
    ) -> Result<DeviceRecord, StoreError>;

    /// Finds the device whose current activation code equals `code` and expires after `now`.
    async fn find_by_active_code(
        &self,
        code: &str,
        now: i64,
    ) -> Result<Option<DeviceRecord>, StoreError>;
}

/// Opens the configured store. `memory://` selects the in-process store; anything
/// else is a SeaORM connection string, pinged and migrated before use.
pub async fn init(cfg: &DbCfg) -> Result<Arc<dyn DeviceStore>, StoreError> {
    if cfg.url.starts_with("memory://") {
        tracing::warn!("Using in-memory device store; records are lost on restart");
        return Ok(Arc::new(MemoryDeviceStore::new()));
    }

    let timeout = cfg.operation_timeout();
    let db = deadline(timeout, Database::connect(&cfg.url)).await?;
    deadline(timeout, db.ping()).await?;
    deadline(timeout, migration::Migrator::up(&db, None)).await?;
    Ok(Arc::new(SeaOrmDeviceStore::new(db, timeout)))
}

async fn deadline<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, DbErr>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

#[derive(Clone)]
pub struct SeaOrmDeviceStore {
    db: DatabaseConnection,
    timeout: Duration,
}

impl SeaOrmDeviceStore {
    pub fn new(db: DatabaseConnection, timeout: Duration) -> Self {
        Self { db, timeout }
    }
}

#[async_trait]
impl DeviceStore for SeaOrmDeviceStore {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        use entities::device::Entity;

        deadline(self.timeout, Entity::find_by_id(device_id.to_string()).one(&self.db))
            .await?
            .map(record_from_model)
            .transpose()
    }

    async fn upsert(
        &self,
        record: &DeviceRecord,
        expected_version: Option<i64>,
    ) -> Result<DeviceRecord, StoreError> {
        use entities::device::{Column, Entity};

        let new_version = expected_version.map_or(1, |v| v + 1);
        let mut active = to_active_model(record, new_version);

        match expected_version {
            None => {
                let result =
                    deadline(self.timeout, Entity::insert(active).exec_without_returning(&self.db))
                        .await;
                match result {
                    Ok(_) => {}
                    Err(StoreError::Db(err))
                        if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
                    {
                        return Err(StoreError::VersionConflict(record.device_id.clone()));
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(expected) => {
                // The key stays out of the SET clause; it only selects the row.
                active.device_id = NotSet;
                let result = deadline(
                    self.timeout,
                    Entity::update_many()
                        .set(active)
                        .filter(Column::DeviceId.eq(record.device_id.as_str()))
                        .filter(Column::Version.eq(expected))
                        .exec(&self.db),
                )
                .await?;
                if result.rows_affected == 0 {
                    return Err(StoreError::VersionConflict(record.device_id.clone()));
                }
            }
        }

        let mut stored = record.clone();
        stored.version = new_version;
        Ok(stored)
    }

    async fn find_by_active_code(
        &self,
        code: &str,
        now: i64,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        use entities::device::{Column, Entity};

        deadline(
            self.timeout,
            Entity::find()
                .filter(Column::ActivationCode.eq(code))
                .filter(Column::ActivationCodeExpiresAt.gt(now))
                .one(&self.db),
        )
        .await?
        .map(record_from_model)
        .transpose()
    }
}

fn to_active_model(record: &DeviceRecord, version: i64) -> entities::device::ActiveModel {
    entities::device::ActiveModel {
        device_id: Set(record.device_id.clone()),
        secret: Set(record.secret.as_ref().map(DeviceSecret::to_hex)),
        claim_owner: Set(record.claim.as_ref().map(|c| c.owner.clone())),
        claimed_at: Set(record.claim.as_ref().map(|c| c.claimed_at)),
        activation_code: Set(record.activation.as_ref().map(|a| a.code.clone())),
        activation_code_expires_at: Set(record.activation.as_ref().map(|a| a.expires_at)),
        failed_attempts: Set(i32::try_from(record.failed_attempts).unwrap_or(i32::MAX)),
        locked_until: Set(record.locked_until),
        created_at: Set(record.created_at),
        version: Set(version),
    }
}

fn record_from_model(model: entities::device::Model) -> Result<DeviceRecord, StoreError> {
    let secret = model
        .secret
        .as_deref()
        .map(DeviceSecret::from_hex)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            device_id: model.device_id.clone(),
            reason: format!("secret is not hex: {e}"),
        })?;

    let corrupt = |reason: &str| StoreError::Corrupt {
        device_id: model.device_id.clone(),
        reason: reason.to_string(),
    };

    let claim = match (model.claim_owner, model.claimed_at) {
        (Some(owner), Some(claimed_at)) => Some(Claim { owner, claimed_at }),
        (Some(_), None) => return Err(corrupt("claim owner without claimed_at")),
        (None, _) => None,
    };

    let failed_attempts = u32::try_from(model.failed_attempts)
        .map_err(|_| corrupt("failed_attempts is negative"))?;

    let activation = match (model.activation_code, model.activation_code_expires_at) {
        (Some(code), Some(expires_at)) => Some(ActivationCode { code, expires_at }),
        _ => None,
    };

    Ok(DeviceRecord {
        device_id: model.device_id,
        secret,
        claim,
        activation,
        failed_attempts,
        locked_until: model.locked_until,
        created_at: model.created_at,
        version: model.version,
    })
}

/// In-process store with the same conditional-write semantics as the database store.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.lock().await.get(device_id).cloned())
    }

    async fn upsert(
        &self,
        record: &DeviceRecord,
        expected_version: Option<i64>,
    ) -> Result<DeviceRecord, StoreError> {
        let mut devices = self.devices.lock().await;
        let current = devices.get(&record.device_id).map(|d| d.version);

        let new_version = match (expected_version, current) {
            (None, None) => 1,
            (Some(expected), Some(current)) if expected == current => current + 1,
            _ => return Err(StoreError::VersionConflict(record.device_id.clone())),
        };

        let mut stored = record.clone();
        stored.version = new_version;
        devices.insert(stored.device_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn find_by_active_code(
        &self,
        code: &str,
        now: i64,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self
            .devices
            .lock()
            .await
            .values()
            .find(|d| d.has_active_code(code, now))
            .cloned())
    }
}
