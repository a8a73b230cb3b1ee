//! Device record and the state transitions allowed on it.
//!
//! The record is a plain value: services load it from the store, apply one of
//! the transitions below, and write it back conditionally on `version`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a device's shared secret in bytes.
pub const SECRET_BYTES: usize = 32;

/// Permanent shared secret assigned at registration.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceSecret(Vec<u8>);

impl DeviceSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(s)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationCode {
    pub code: String,
    pub expires_at: i64,
}

impl ActivationCode {
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub claimed_at: i64,
}

/// Claim-relevant state derived from the record fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState<'a> {
    Unclaimed,
    Locked { until: i64 },
    Claimed { owner: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub secret: Option<DeviceSecret>,
    pub claim: Option<Claim>,
    pub activation: Option<ActivationCode>,
    pub failed_attempts: u32,
    pub locked_until: Option<i64>,
    pub created_at: i64,
    /// Store-managed write counter; 0 until the record has been persisted.
    pub version: i64,
}

impl DeviceRecord {
    pub fn register(device_id: impl Into<String>, secret: DeviceSecret, now: i64) -> Self {
        Self {
            device_id: device_id.into(),
            secret: Some(secret),
            claim: None,
            activation: None,
            failed_attempts: 0,
            locked_until: None,
            created_at: now,
            version: 0,
        }
    }

    /// A lock blocks claims while it lies in the future; an expired lock is inert.
    pub fn is_locked(&self, now: i64) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    /// Locked takes precedence over claimed: a locked device rejects every claim attempt.
    pub fn state(&self, now: i64) -> DeviceState<'_> {
        match (self.locked_until, &self.claim) {
            (Some(until), _) if until > now => DeviceState::Locked { until },
            (_, Some(claim)) => DeviceState::Claimed {
                owner: &claim.owner,
            },
            _ => DeviceState::Unclaimed,
        }
    }

    pub fn is_claimed_by(&self, user_id: &str) -> bool {
        matches!(&self.claim, Some(claim) if claim.owner == user_id)
    }

    pub fn has_active_code(&self, code: &str, now: i64) -> bool {
        matches!(&self.activation, Some(a) if a.code == code && a.is_active(now))
    }

    /// Clears a lock whose deadline has passed, together with the attempt counter.
    /// Returns true when the record changed.
    pub fn heal_expired_lock(&mut self, now: i64) -> bool {
        match self.locked_until {
            Some(until) if until <= now => {
                self.reset_failed_attempts();
                true
            }
            _ => false,
        }
    }

    /// Installs a fresh code. A new code opens a new trust window, so lockout state is reset.
    pub fn set_activation_code(&mut self, code: String, expires_at: i64) {
        self.activation = Some(ActivationCode { code, expires_at });
        self.reset_failed_attempts();
    }

    /// Counts a failed claim. Returns true if the device is locked afterwards.
    pub fn record_failed_attempt(&mut self, max_attempts: u32, lock_duration: i64, now: i64) -> bool {
        if self.is_locked(now) {
            return true;
        }

        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= max_attempts {
            self.locked_until = Some(now.saturating_add(lock_duration));
            return true;
        }
        false
    }

    /// Transfers ownership and consumes the activation code.
    pub fn claim(&mut self, user_id: impl Into<String>, now: i64) {
        self.claim = Some(Claim {
            owner: user_id.into(),
            claimed_at: now,
        });
        self.activation = None;
        self.reset_failed_attempts();
    }

    pub fn reset_failed_attempts(&mut self) {
        self.failed_attempts = 0;
        self.locked_until = None;
    }
}
