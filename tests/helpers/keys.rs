use base64ct::{Base64, Encoding};
use josekit::jws::RS256;
use provisioner::jwks::JwksManager;
use provisioner::settings::Keys;

/// Signing key manager backed by a freshly generated 2048-bit RSA key
pub fn test_jwks() -> JwksManager {
    let key_pair = RS256
        .generate_key_pair(2048)
        .expect("Failed to generate RSA key");
    let keys = Keys {
        private_key_b64: Base64::encode_string(&key_pair.to_pem_private_key()),
        ..Keys::default()
    };
    JwksManager::new(&keys).expect("Failed to load test key")
}
