//! Device identity: one ed25519 keypair per installation.
//!
//! The device id is the hex sha256 of the raw public key, so it can always be
//! re-derived. A stored id that does not match its key is recomputed rather
//! than trusted.

use crate::error::ClientError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tether_storage::{KeyStore, StoredIdentity};
use tracing::{info, warn};

#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
    created_at_ms: i64,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_KEY_LENGTH];
        rand::rng().fill_bytes(&mut secret);
        Self::from_signing_key(SigningKey::from_bytes(&secret), Utc::now().timestamp_millis())
    }

    fn from_signing_key(signing_key: SigningKey, created_at_ms: i64) -> Self {
        let device_id = derive_device_id(signing_key.verifying_key().as_bytes());
        Self {
            device_id,
            signing_key,
            created_at_ms,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as sent on the wire: base64url without padding.
    pub fn public_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key_bytes())
    }

    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            device_id: self.device_id.clone(),
            public_key: self.public_key_bytes().to_vec(),
            private_key: self.signing_key.to_bytes().to_vec(),
            created_at_ms: self.created_at_ms,
        }
    }
}

pub fn derive_device_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Loads the persisted identity, creating or repairing it as needed.
pub fn load_or_create_identity(store: &dyn KeyStore) -> Result<DeviceIdentity, ClientError> {
    let Some(stored) = store.load_identity()? else {
        let identity = DeviceIdentity::generate();
        store.save_identity(&identity.to_stored())?;
        info!(event = "device_identity_created", device_id = %identity.device_id);
        return Ok(identity);
    };

    let signing_key = match <[u8; SECRET_KEY_LENGTH]>::try_from(stored.private_key.as_slice()) {
        Ok(secret) => SigningKey::from_bytes(&secret),
        Err(_) => {
            warn!(
                event = "device_identity_regenerated",
                reason = "invalid_private_key",
                stored_device_id = %stored.device_id
            );
            return regenerate(store);
        }
    };

    if signing_key.verifying_key().as_bytes().as_slice() != stored.public_key.as_slice() {
        warn!(
            event = "device_identity_regenerated",
            reason = "key_mismatch",
            stored_device_id = %stored.device_id
        );
        return regenerate(store);
    }

    let identity = DeviceIdentity::from_signing_key(signing_key, stored.created_at_ms);
    if identity.device_id != stored.device_id {
        warn!(
            event = "device_identity_repaired",
            stored_device_id = %stored.device_id,
            device_id = %identity.device_id
        );
        store.save_identity(&identity.to_stored())?;
    }
    Ok(identity)
}

fn regenerate(store: &dyn KeyStore) -> Result<DeviceIdentity, ClientError> {
    let identity = DeviceIdentity::generate();
    store.save_identity(&identity.to_stored())?;
    Ok(identity)
}

/// Fields covered by the device signature on `connect`.
#[derive(Debug, Clone)]
pub struct SigningPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: &'a str,
    pub nonce: Option<&'a str>,
}

/// `v2|device|client|mode|role|scopes|signedAt|token|nonce`, or the `v1`
/// form without the nonce when the gateway never sent a challenge.
pub fn build_signing_payload(payload: &SigningPayload<'_>) -> String {
    let mut scopes = payload.scopes.to_vec();
    scopes.sort();
    let scopes = scopes.join(",");
    let signed_at = payload.signed_at_ms.to_string();
    let version = if payload.nonce.is_some() { "v2" } else { "v1" };
    let mut fields = vec![
        version,
        payload.device_id,
        payload.client_id,
        payload.client_mode,
        payload.role,
        scopes.as_str(),
        signed_at.as_str(),
        payload.token,
    ];
    if let Some(nonce) = payload.nonce {
        fields.push(nonce);
    }
    fields.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use tether_storage::{MemoryDeviceStore, SqliteDeviceStore};

    #[test]
    fn creates_once_and_reloads_same_identity() {
        let store = MemoryDeviceStore::new();
        let first = load_or_create_identity(&store).expect("create");
        let second = load_or_create_identity(&store).expect("reload");
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.device_id(), derive_device_id(&first.public_key_bytes()));
        assert_eq!(first.device_id().len(), 64);
    }

    #[test]
    fn identity_survives_reopening_the_sqlite_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("device.sqlite3");
        let created = {
            let store = SqliteDeviceStore::open(&path).expect("open");
            load_or_create_identity(&store).expect("create")
        };
        let store = SqliteDeviceStore::open(&path).expect("reopen");
        let reloaded = load_or_create_identity(&store).expect("reload");
        assert_eq!(reloaded.device_id(), created.device_id());
        assert_eq!(reloaded.created_at_ms(), created.created_at_ms());
    }

    #[test]
    fn tampered_device_id_is_recomputed_and_persisted() {
        let store = MemoryDeviceStore::new();
        let identity = load_or_create_identity(&store).expect("create");
        let mut stored = store.load_identity().expect("load").expect("present");
        stored.device_id = "forged".to_string();
        store.save_identity(&stored).expect("tamper");

        let repaired = load_or_create_identity(&store).expect("repair");
        assert_eq!(repaired.device_id(), identity.device_id());
        let persisted = store.load_identity().expect("load").expect("present");
        assert_eq!(persisted.device_id, identity.device_id());
    }

    #[test]
    fn mismatched_keypair_is_regenerated() {
        let store = MemoryDeviceStore::new();
        let identity = load_or_create_identity(&store).expect("create");
        let mut stored = store.load_identity().expect("load").expect("present");
        stored.public_key = vec![7; 32];
        store.save_identity(&stored).expect("corrupt");

        let fresh = load_or_create_identity(&store).expect("regenerate");
        assert_ne!(fresh.device_id(), identity.device_id());
        assert_eq!(fresh.device_id(), derive_device_id(&fresh.public_key_bytes()));
    }

    #[test]
    fn signing_payload_sorts_scopes_and_tags_version() {
        let scopes = vec!["operator.write".to_string(), "operator.read".to_string()];
        let mut payload = SigningPayload {
            device_id: "dev",
            client_id: "tether",
            client_mode: "cli",
            role: "operator",
            scopes: &scopes,
            signed_at_ms: 1_700_000_000_000,
            token: "tok",
            nonce: Some("n-1"),
        };
        assert_eq!(
            build_signing_payload(&payload),
            "v2|dev|tether|cli|operator|operator.read,operator.write|1700000000000|tok|n-1"
        );
        payload.nonce = None;
        payload.token = "";
        assert_eq!(
            build_signing_payload(&payload),
            "v1|dev|tether|cli|operator|operator.read,operator.write|1700000000000|"
        );
    }

    #[test]
    fn signature_verifies_against_published_key() {
        let identity = DeviceIdentity::generate();
        let signature = identity.sign("payload");
        let key_bytes = URL_SAFE_NO_PAD
            .decode(identity.public_key_base64())
            .expect("decode key");
        let sig_bytes = URL_SAFE_NO_PAD.decode(signature).expect("decode sig");
        let key = VerifyingKey::from_bytes(key_bytes.as_slice().try_into().expect("len"))
            .expect("key");
        let sig = Signature::from_bytes(sig_bytes.as_slice().try_into().expect("len"));
        key.verify(b"payload", &sig).expect("valid signature");
        assert!(!identity.public_key_base64().contains('='));
    }
}
