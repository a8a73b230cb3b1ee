use provisioner::device::{DeviceRecord, DeviceSecret, SECRET_BYTES};
use provisioner::storage::DeviceStore;

/// Builder for device records in arbitrary lifecycle states
pub struct DeviceBuilder {
    device_id: String,
    secret: DeviceSecret,
    created_at: i64,
    code: Option<(String, i64)>,
    owner: Option<String>,
    failed_attempts: u32,
    locked_until: Option<i64>,
}

impl DeviceBuilder {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            secret: DeviceSecret::from_bytes(vec![0x42; SECRET_BYTES]),
            created_at: 0,
            code: None,
            owner: None,
            failed_attempts: 0,
            locked_until: None,
        }
    }

    pub fn with_secret(mut self, secret: DeviceSecret) -> Self {
        self.secret = secret;
        self
    }

    pub fn created_at(mut self, at: i64) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_code(mut self, code: &str, expires_at: i64) -> Self {
        self.code = Some((code.to_string(), expires_at));
        self
    }

    pub fn claimed_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn failed_attempts(mut self, count: u32) -> Self {
        self.failed_attempts = count;
        self
    }

    pub fn locked_until(mut self, until: i64) -> Self {
        self.locked_until = Some(until);
        self
    }

    pub fn build(self) -> DeviceRecord {
        let mut device = DeviceRecord::register(self.device_id, self.secret, self.created_at);
        if let Some(owner) = self.owner {
            device.claim(owner, self.created_at);
        }
        if let Some((code, expires_at)) = self.code {
            device.set_activation_code(code, expires_at);
        }
        device.failed_attempts = self.failed_attempts;
        device.locked_until = self.locked_until;
        device
    }

    pub async fn create(self, store: &dyn DeviceStore) -> DeviceRecord {
        store
            .upsert(&self.build(), None)
            .await
            .expect("Failed to create test device")
    }
}
