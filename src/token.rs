//! Device access tokens.
//!
//! A device proves it holds its secret by signing `"<device_id>:<timestamp>"`
//! with HMAC-SHA256 and sending the lowercase hex digest together with the
//! timestamp. A fresh, valid proof is exchanged for an RS256 JWT that the
//! telemetry API accepts as a bearer token.

use crate::clock::Clock;
use crate::device::DeviceSecret;
use crate::errors::ProvisionError;
use crate::jwks::JwksManager;
use crate::registration::require_device_id;
use crate::settings::Settings;
use crate::storage::DeviceStore;
use hmac::{Hmac, Mac};
use josekit::jwt::JwtPayload;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Wire names follow the device firmware: `token`, `expiresIn`, `tokenType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub expires_in: i64,
    pub token_type: String,
}

#[derive(Clone)]
pub struct AccessTokenIssuer {
    store: Arc<dyn DeviceStore>,
    clock: Arc<dyn Clock>,
    jwks: JwksManager,
    issuer: String,
    audience: String,
    roles: Vec<String>,
    ttl_secs: i64,
    max_skew_secs: i64,
}

impl AccessTokenIssuer {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        clock: Arc<dyn Clock>,
        jwks: JwksManager,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            clock,
            jwks,
            issuer: settings.issuer(),
            audience: settings.keys.audience.clone(),
            roles: settings.keys.roles.clone(),
            ttl_secs: settings.keys.token_ttl_secs,
            max_skew_secs: settings.keys.max_clock_skew_secs,
        }
    }

    #[tracing::instrument(name = "issue_token", skip(self, signature))]
    pub async fn issue(
        &self,
        device_id: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<AccessToken, ProvisionError> {
        let device_id = require_device_id(device_id)?;
        let now = self.clock.now();

        if now.abs_diff(timestamp) > self.max_skew_secs.unsigned_abs() {
            tracing::warn!(
                device_id,
                timestamp,
                now,
                "token request outside the accepted time window"
            );
            return Err(ProvisionError::InvalidTimestamp);
        }

        let secret = match self.store.get(device_id).await? {
            Some(device) => device.secret,
            None => None,
        };
        let Some(secret) = secret else {
            tracing::warn!(device_id, "token requested for unregistered device");
            return Err(ProvisionError::DeviceNotRegistered(device_id.to_string()));
        };

        let expected = compute_signature(&secret, device_id, timestamp)?;
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            tracing::warn!(device_id, "invalid HMAC signature");
            return Err(ProvisionError::InvalidSignature);
        }

        let token = self.mint(device_id, now)?;
        tracing::info!(device_id, "access token generated");

        Ok(AccessToken {
            token,
            expires_in: self.ttl_secs,
            token_type: "Bearer".to_string(),
        })
    }

    fn mint(&self, device_id: &str, now: i64) -> Result<String, ProvisionError> {
        let mut payload = JwtPayload::new();
        payload.set_issuer(&self.issuer);
        payload.set_subject(device_id);
        payload.set_audience(vec![self.audience.clone()]);
        // JwtPayload's own time setters emit floats; NumericDate is written as whole seconds
        payload.set_claim("iat", Some(json!(now)))?;
        payload.set_claim("nbf", Some(json!(now)))?;
        payload.set_claim("exp", Some(json!(now.saturating_add(self.ttl_secs))))?;
        payload.set_jwt_id(Uuid::new_v4().to_string());
        payload.set_claim("typ", Some(json!("device")))?;
        payload.set_claim("roles", Some(json!(self.roles)))?;

        self.jwks.sign_jwt_rs256(&payload)
    }
}

/// Lowercase hex HMAC-SHA256 over `"<device_id>:<timestamp>"`, keyed by the raw secret bytes.
pub fn compute_signature(
    secret: &DeviceSecret,
    device_id: &str,
    timestamp: i64,
) -> Result<String, ProvisionError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ProvisionError::Crypto(e.to_string()))?;
    mac.update(format!("{device_id}:{timestamp}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
