use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const DEVICE_STORE_SCHEMA_VERSION: i64 = 1;
pub const DEVICE_AUTH_RECORD_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}

/// Raw keypair material as persisted. Interpretation (key type, id
/// derivation) belongs to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub device_id: String,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenKey {
    pub device_id: String,
    pub scope: String,
    pub role: String,
}

impl TokenKey {
    pub fn new(
        device_id: impl Into<String>,
        scope: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            scope: scope.into(),
            role: role.into(),
        }
    }

    fn record_key(&self) -> String {
        format!("{}|{}", self.scope, self.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredAuthToken {
    pub token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub updated_at_ms: i64,
}

/// Everything issued to one device, keyed by `scope|role`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthRecord {
    pub version: u32,
    pub device_id: String,
    pub tokens: BTreeMap<String, StoredAuthToken>,
}

impl DeviceAuthRecord {
    fn empty(device_id: &str) -> Self {
        Self {
            version: DEVICE_AUTH_RECORD_VERSION,
            device_id: device_id.to_string(),
            tokens: BTreeMap::new(),
        }
    }
}

pub trait KeyStore: Send + Sync {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, StorageError>;
    fn save_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError>;
}

pub trait AuthTokenStore: Send + Sync {
    fn load_token(&self, key: &TokenKey) -> Result<Option<StoredAuthToken>, StorageError>;
    fn store_token(&self, key: &TokenKey, token: &StoredAuthToken) -> Result<(), StorageError>;
    /// Returns whether a token was present.
    fn clear_token(&self, key: &TokenKey) -> Result<bool, StorageError>;
    fn device_record(&self, device_id: &str) -> Result<DeviceAuthRecord, StorageError>;
}

pub struct SqliteDeviceStore {
    conn: Mutex<Connection>,
}

impl SqliteDeviceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > DEVICE_STORE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: DEVICE_STORE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock()?;
            conn.execute_batch(include_str!("../migrations/0001_device_store.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl KeyStore for SqliteDeviceStore {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, StorageError> {
        let conn = self.lock()?;
        let identity = conn
            .query_row(
                "SELECT device_id, public_key, private_key, created_at_ms
                 FROM device_identity WHERE slot = 1",
                [],
                |row| {
                    Ok(StoredIdentity {
                        device_id: row.get(0)?,
                        public_key: row.get(1)?,
                        private_key: row.get(2)?,
                        created_at_ms: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    fn save_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_identity (slot, device_id, public_key, private_key, created_at_ms)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(slot) DO UPDATE SET
                device_id = excluded.device_id,
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                created_at_ms = excluded.created_at_ms",
            params![
                identity.device_id,
                identity.public_key,
                identity.private_key,
                identity.created_at_ms
            ],
        )?;
        Ok(())
    }
}

impl AuthTokenStore for SqliteDeviceStore {
    fn load_token(&self, key: &TokenKey) -> Result<Option<StoredAuthToken>, StorageError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT token, scopes_json, updated_at_ms FROM device_auth_tokens
                 WHERE device_id = ?1 AND scope = ?2 AND role = ?3",
                params![key.device_id, key.scope, key.role],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(token, scopes_json, updated_at_ms)| {
            Ok(StoredAuthToken {
                token,
                scopes: decode_scopes(&scopes_json)?,
                updated_at_ms,
            })
        })
        .transpose()
    }

    fn store_token(&self, key: &TokenKey, token: &StoredAuthToken) -> Result<(), StorageError> {
        let scopes_json = serde_json::to_string(&token.scopes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_auth_tokens (device_id, scope, role, token, scopes_json, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id, scope, role) DO UPDATE SET
                token = excluded.token,
                scopes_json = excluded.scopes_json,
                updated_at_ms = excluded.updated_at_ms",
            params![
                key.device_id,
                key.scope,
                key.role,
                token.token,
                scopes_json,
                token.updated_at_ms
            ],
        )?;
        Ok(())
    }

    fn clear_token(&self, key: &TokenKey) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changes = conn.execute(
            "DELETE FROM device_auth_tokens WHERE device_id = ?1 AND scope = ?2 AND role = ?3",
            params![key.device_id, key.scope, key.role],
        )?;
        Ok(changes > 0)
    }

    fn device_record(&self, device_id: &str) -> Result<DeviceAuthRecord, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT scope, role, token, scopes_json, updated_at_ms FROM device_auth_tokens
             WHERE device_id = ?1 ORDER BY scope, role",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut record = DeviceAuthRecord::empty(device_id);
        for row in rows {
            let (scope, role, token, scopes_json, updated_at_ms) = row?;
            let key = TokenKey::new(device_id, scope, role);
            record.tokens.insert(
                key.record_key(),
                StoredAuthToken {
                    token,
                    scopes: decode_scopes(&scopes_json)?,
                    updated_at_ms,
                },
            );
        }
        Ok(record)
    }
}

/// Process-local store for tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryDeviceStore {
    identity: Mutex<Option<StoredIdentity>>,
    tokens: Mutex<HashMap<TokenKey, StoredAuthToken>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryDeviceStore {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, StorageError> {
        Ok(self
            .identity
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .clone())
    }

    fn save_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError> {
        *self.identity.lock().map_err(|_| StorageError::Poisoned)? = Some(identity.clone());
        Ok(())
    }
}

impl AuthTokenStore for MemoryDeviceStore {
    fn load_token(&self, key: &TokenKey) -> Result<Option<StoredAuthToken>, StorageError> {
        Ok(self
            .tokens
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .get(key)
            .cloned())
    }

    fn store_token(&self, key: &TokenKey, token: &StoredAuthToken) -> Result<(), StorageError> {
        self.tokens
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .insert(key.clone(), token.clone());
        Ok(())
    }

    fn clear_token(&self, key: &TokenKey) -> Result<bool, StorageError> {
        Ok(self
            .tokens
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .remove(key)
            .is_some())
    }

    fn device_record(&self, device_id: &str) -> Result<DeviceAuthRecord, StorageError> {
        let tokens = self.tokens.lock().map_err(|_| StorageError::Poisoned)?;
        let mut record = DeviceAuthRecord::empty(device_id);
        for (key, token) in tokens.iter().filter(|(key, _)| key.device_id == device_id) {
            record.tokens.insert(key.record_key(), token.clone());
        }
        Ok(record)
    }
}

fn decode_scopes(raw: &str) -> Result<Vec<String>, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Serialization(err.to_string()))
}
