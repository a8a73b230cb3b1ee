use crate::clock::Clock;
use crate::errors::ProvisionError;
use crate::registration::require_device_id;
use crate::settings::Provisioning;
use crate::storage::{DeviceStore, StoreError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CODE_LENGTH: usize = 9;

/// 32 symbols; `0`, `O`, `1` and `I` are left out so codes survive being read aloud or retyped.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationGrant {
    pub activation_code: String,
    pub validity_seconds: i64,
}

/// Mints time-boxed claim codes for registered devices.
#[derive(Clone)]
pub struct ActivationCodeIssuer {
    store: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    code_ttl_secs: i64,
}

impl ActivationCodeIssuer {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
        cfg: &Provisioning,
    ) -> Self {
        Self {
            store,
            clock,
            code_ttl_secs: cfg.activation_code_ttl_secs,
        }
    }

    #[tracing::instrument(name = "activate", skip(self))]
    pub async fn issue(&self, device_id: &str) -> Result<ActivationGrant, ProvisionError> {
        let device_id = require_device_id(device_id)?;

        let mut device = match self.store.get(device_id).await? {
            Some(device) if device.secret.is_some() => device,
            _ => {
                tracing::warn!(
                    device_id,
                    "activation code requested for unregistered device"
                );
                return Err(ProvisionError::DeviceNotRegistered(device_id.to_string()));
            }
        };

        let code = generate_activation_code(&mut OsRng)?;
        let expires_at = self.clock.now().saturating_add(self.code_ttl_secs);
        let expected = device.version;
        device.set_activation_code(code.clone(), expires_at);

        self.store
            .upsert(&device, Some(expected))
            .await
            .map_err(|err| match err {
                StoreError::VersionConflict(id) => ProvisionError::ConcurrentModification(id),
                other => other.into(),
            })?;

        tracing::info!(device_id, expires_at, "activation code issued");

        Ok(ActivationGrant {
            activation_code: code,
            validity_seconds: self.code_ttl_secs,
        })
    }
}

/// Draws `CODE_LENGTH` symbols uniformly from `CODE_ALPHABET`.
///
/// Bytes at or above the largest multiple of the alphabet size are rejected, so
/// every symbol is equally likely whatever the alphabet length.
pub fn generate_activation_code<R: RngCore + ?Sized>(rng: &mut R) -> Result<String, rand::Error> {
    let n = CODE_ALPHABET.len();
    let zone = 256 - (256 % n);
    let mut code = String::with_capacity(CODE_LENGTH);
    let mut buf = [0u8; 16];

    while code.len() < CODE_LENGTH {
        rng.try_fill_bytes(&mut buf)?;
        for &b in &buf {
            if (b as usize) < zone {
                code.push(CODE_ALPHABET[b as usize % n] as char);
                if code.len() == CODE_LENGTH {
                    break;
                }
            }
        }
    }

    Ok(code)
}

/// Canonical form of user-typed codes: surrounding whitespace dropped, upper case.
pub fn normalize_code(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}
