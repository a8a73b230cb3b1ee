//! Ownership transfer through activation codes.
//!
//! A claim resolves the device by its active code, then walks the lockout and
//! ownership checks in a fixed order. Failed attempts against a device owned by
//! someone else are counted and eventually lock the device, which caps how many
//! guesses a caller gets per code.

use crate::activation::normalize_code;
use crate::clock::Clock;
use crate::device::{DeviceRecord, DeviceState};
use crate::errors::ProvisionError;
use crate::settings::Provisioning;
use crate::storage::{DeviceStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub device_id: String,
    pub already_claimed_by_same_user: bool,
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    max_failed_attempts: u32,
    lock_duration_secs: i64,
}

impl ClaimCoordinator {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
        cfg: &Provisioning,
    ) -> Self {
        Self {
            store,
            clock,
            max_failed_attempts: cfg.max_failed_attempts,
            lock_duration_secs: cfg.lock_duration_secs,
        }
    }

    #[tracing::instrument(name = "claim", skip_all, fields(user_id = %user_id.trim()))]
    pub async fn claim(&self, code: &str, user_id: &str) -> Result<ClaimOutcome, ProvisionError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(ProvisionError::Validation(
                "missing activation code".to_string(),
            ));
        }
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(ProvisionError::Validation("missing user id".to_string()));
        }

        let now = self.clock.now();
        let Some(device) = self.store.find_by_active_code(&code, now).await? else {
            tracing::info!(
                user_id,
                code = %mask_code(&code),
                "claim with unknown or expired activation code"
            );
            return Err(ProvisionError::InvalidCode);
        };
        let device_id = device.device_id.clone();

        match self.attempt(device, user_id, now, false).await {
            Err(ProvisionError::ConcurrentModification(_)) => {}
            other => return other,
        }

        tracing::debug!(
            device_id = %device_id,
            user_id,
            "claim lost a write race, re-evaluating"
        );

        // The winner of the race may have consumed the code, so the device is
        // re-read by id rather than looked up by code again.
        let now = self.clock.now();
        let device = match self.store.get(&device_id).await? {
            Some(device) if device.claim.is_some() || device.has_active_code(&code, now) => device,
            _ => return Err(ProvisionError::InvalidCode),
        };
        self.attempt(device, user_id, now, true).await
    }

    async fn attempt(
        &self,
        mut device: DeviceRecord,
        user_id: &str,
        now: i64,
        last: bool,
    ) -> Result<ClaimOutcome, ProvisionError> {
        if let DeviceState::Locked { until } = device.state(now) {
            tracing::warn!(
                device_id = %device.device_id,
                user_id,
                failed_attempts = device.failed_attempts,
                locked_until = until,
                "claim blocked: device locked"
            );
            return Err(ProvisionError::DeviceLocked {
                locked_until: until,
            });
        }

        let expected = device.version;
        let healed = device.heal_expired_lock(now);

        if device.is_claimed_by(user_id) {
            if healed {
                if let Err(err) = self.store.upsert(&device, Some(expected)).await {
                    tracing::warn!(
                        device_id = %device.device_id,
                        error = %err,
                        "failed to persist expired lock removal"
                    );
                }
            }
            return Ok(ClaimOutcome {
                device_id: device.device_id,
                already_claimed_by_same_user: true,
            });
        }

        if let Some(claim) = &device.claim {
            tracing::warn!(
                device_id = %device.device_id,
                user_id,
                current_owner = %claim.owner,
                "claim blocked: owned by another user"
            );

            let locked =
                device.record_failed_attempt(self.max_failed_attempts, self.lock_duration_secs, now);

            match self.store.upsert(&device, Some(expected)).await {
                Ok(_) => {}
                Err(StoreError::VersionConflict(id)) if !last => {
                    return Err(ProvisionError::ConcurrentModification(id));
                }
                Err(err) => {
                    tracing::error!(
                        device_id = %device.device_id,
                        error = %err,
                        "failed to save device after failed claim"
                    );
                }
            }

            if locked {
                tracing::warn!(
                    device_id = %device.device_id,
                    failed_attempts = device.failed_attempts,
                    "device locked: max attempts reached"
                );
            }
            return Err(ProvisionError::AlreadyClaimed);
        }

        device.claim(user_id, now);
        let stored = self
            .store
            .upsert(&device, Some(expected))
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict(id) => ProvisionError::ConcurrentModification(id),
                other => other.into(),
            })?;

        tracing::info!(
            device_id = %stored.device_id,
            user_id,
            "device claimed"
        );

        Ok(ClaimOutcome {
            device_id: stored.device_id,
            already_claimed_by_same_user: false,
        })
    }
}

/// Log-safe form of an activation code.
fn mask_code(code: &str) -> String {
    match code.get(..3) {
        Some(prefix) if code.len() > 3 => format!("{prefix}***"),
        _ => "***".to_string(),
    }
}
