use crate::errors::ProvisionError;
use crate::settings::Keys;
use base64ct::{Base64, Encoding};
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, RS256};
use josekit::jwt;
use josekit::jwt::JwtPayload;
use serde_json::{json, Value};
use std::sync::Arc;

/// RS256 signing key for device tokens and its public JWKS.
#[derive(Clone)]
pub struct JwksManager {
    public_jwks_value: Arc<Value>,
    private_jwk: Arc<Jwk>,
}

impl JwksManager {
    /// Loads the key from `keys.private_key_b64`. A missing or unparsable key is fatal.
    pub fn new(cfg: &Keys) -> Result<Self, ProvisionError> {
        let pem = decode_pem(&cfg.private_key_b64)?;
        let key_pair = RS256.key_pair_from_pem(&pem)?;

        let mut private_jwk = key_pair.to_jwk_key_pair();
        private_jwk.set_key_id(&cfg.key_id);
        private_jwk.set_algorithm("RS256");
        private_jwk.set_key_use("sig");

        // Fail at startup, not on the first token request
        RS256.signer_from_jwk(&private_jwk)?;

        let public = public_half(&private_jwk)?;
        let jwk_val = serde_json::to_value(&public)
            .map_err(|e| ProvisionError::Jose(format!("serializing public key: {e}")))?;
        let public_jwks_value = json!({ "keys": [jwk_val] });

        Ok(Self {
            public_jwks_value: Arc::new(public_jwks_value),
            private_jwk: Arc::new(private_jwk),
        })
    }

    pub fn jwks_json(&self) -> Value {
        (*self.public_jwks_value).clone()
    }

    pub fn public_jwk(&self) -> Result<Jwk, ProvisionError> {
        public_half(&self.private_jwk)
    }

    pub fn key_id(&self) -> Option<&str> {
        self.private_jwk.key_id()
    }

    pub fn sign_jwt_rs256(&self, payload: &JwtPayload) -> Result<String, ProvisionError> {
        let signer = RS256.signer_from_jwk(&self.private_jwk)?;
        let mut header = JwsHeader::new();
        if let Some(kid) = self.private_jwk.key_id() {
            header.set_key_id(kid);
        }
        header.set_algorithm("RS256");
        header.set_token_type("JWT");
        let token = jwt::encode_with_signer(payload, &header, &signer)?;
        Ok(token)
    }
}

// `to_public_key` keeps only the key material, so identity fields are copied over.
fn public_half(private_jwk: &Jwk) -> Result<Jwk, ProvisionError> {
    let mut public = private_jwk.to_public_key()?;
    if let Some(kid) = private_jwk.key_id() {
        public.set_key_id(kid);
    }
    public.set_algorithm("RS256");
    public.set_key_use("sig");
    Ok(public)
}

// Accepts the base64-wrapped PEM from configuration, or a PEM pasted as-is.
fn decode_pem(value: &str) -> Result<Vec<u8>, ProvisionError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProvisionError::Config(
            "keys.private_key_b64 is not set".to_string(),
        ));
    }
    if value.starts_with("-----BEGIN") {
        return Ok(value.as_bytes().to_vec());
    }
    let compact: String = value.split_whitespace().collect();
    Base64::decode_vec(&compact)
        .map_err(|e| ProvisionError::Config(format!("keys.private_key_b64 is not base64: {e}")))
}
