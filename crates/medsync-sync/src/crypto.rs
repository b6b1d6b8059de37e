//! # Encryption Layer
//!
//! Field-level encryption for data at rest on the device.
//!
//! ## Key Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FieldCipher::initialize()                        │
//! │                                                                         │
//! │  SecureKeyStore.load("medsync.data_key")                               │
//! │       │                                                                 │
//! │       ├── found ──► validate 32 bytes ──► KeyMaterial                   │
//! │       │                                                                 │
//! │       └── missing ──► generate key + hash salt (OsRng)                  │
//! │                       store both ──► KeyMaterial                        │
//! │                                                                         │
//! │  encrypt(s)  = base64( nonce[12] || AES-256-GCM(key, nonce, s) )       │
//! │  hash(s)     = hex( SHA-256( salt || s ) )                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ciphertext is non-deterministic (fresh nonce per call), so equality
//! lookups on encrypted fields go through the `hash_<field>` index entries
//! written by [`encrypt_record`].

use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use medsync_core::{EntityKind, FieldMap};
use medsync_db::SecretRepository;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;
/// GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;
/// GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// Hash salt size in bytes.
pub const SALT_SIZE: usize = 32;

/// Secure key store entry holding the data key.
pub const DATA_KEY_NAME: &str = "medsync.data_key";
/// Secure key store entry holding the hash salt.
pub const HASH_SALT_NAME: &str = "medsync.hash_salt";

/// Substituted for a field that failed to decrypt.
pub const DECRYPTION_FAILED_PLACEHOLDER: &str = "[decryption failed]";
/// Set on a record when any of its fields failed to decrypt.
pub const DECRYPTION_FAILED_FLAG: &str = "_decryption_failed";
/// Prefix of searchable hash index entries.
pub const HASH_FIELD_PREFIX: &str = "hash_";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CryptoError {
    /// `initialize()` has not completed.
    #[error("Encryption not initialized")]
    NotInitialized,

    /// The secure key store failed.
    #[error("Secure key store error: {0}")]
    KeyStore(String),

    /// Stored key material has the wrong size.
    #[error("Invalid key material for {name}: {len} bytes")]
    InvalidKeyMaterial { name: String, len: usize },

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// A field value could not be encoded for encryption.
    #[error("Encoding failed: {0}")]
    Encoding(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

// =============================================================================
// Secure Key Store
// =============================================================================

/// Platform secure storage (keychain / keystore) for key material.
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    async fn load(&self, name: &str) -> CryptoResult<Option<Vec<u8>>>;
    async fn store(&self, name: &str, bytes: &[u8]) -> CryptoResult<()>;
}

/// Process-local key store. Keys are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureKeyStore for MemoryKeyStore {
    async fn load(&self, name: &str) -> CryptoResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(name).cloned())
    }

    async fn store(&self, name: &str, bytes: &[u8]) -> CryptoResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Key store backed by the local database's `secure_keys` table.
///
/// Development stand-in for platform secure storage.
#[derive(Debug, Clone)]
pub struct DbKeyStore {
    secrets: SecretRepository,
}

impl DbKeyStore {
    pub fn new(secrets: SecretRepository) -> Self {
        DbKeyStore { secrets }
    }
}

#[async_trait]
impl SecureKeyStore for DbKeyStore {
    async fn load(&self, name: &str) -> CryptoResult<Option<Vec<u8>>> {
        self.secrets
            .load(name)
            .await
            .map_err(|e| CryptoError::KeyStore(e.to_string()))
    }

    async fn store(&self, name: &str, bytes: &[u8]) -> CryptoResult<()> {
        self.secrets
            .store(name, bytes)
            .await
            .map_err(|e| CryptoError::KeyStore(e.to_string()))
    }
}

// =============================================================================
// Encryption Provider
// =============================================================================

/// Symmetric encryption plus a deterministic digest.
#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    /// Loads or creates key material. Idempotent.
    async fn initialize(&self) -> CryptoResult<()>;

    fn encrypt(&self, plaintext: &str) -> CryptoResult<String>;

    fn decrypt(&self, ciphertext: &str) -> CryptoResult<String>;

    /// One-way, deterministic digest for equality lookups.
    fn hash(&self, plaintext: &str) -> CryptoResult<String>;
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    key: [u8; KEY_SIZE],
    salt: [u8; SALT_SIZE],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM field cipher with a salted SHA-256 hash.
pub struct FieldCipher {
    store: Box<dyn SecureKeyStore>,
    keys: OnceCell<KeyMaterial>,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("initialized", &self.keys.initialized())
            .finish()
    }
}

impl FieldCipher {
    pub fn new(store: impl SecureKeyStore + 'static) -> Self {
        FieldCipher {
            store: Box::new(store),
            keys: OnceCell::new(),
        }
    }

    fn keys(&self) -> CryptoResult<&KeyMaterial> {
        self.keys.get().ok_or(CryptoError::NotInitialized)
    }

    async fn load_or_create<const N: usize>(&self, name: &str) -> CryptoResult<[u8; N]> {
        if let Some(mut bytes) = self.store.load(name).await? {
            if bytes.len() != N {
                let len = bytes.len();
                bytes.zeroize();
                return Err(CryptoError::InvalidKeyMaterial {
                    name: name.to_string(),
                    len,
                });
            }
            let mut out = [0u8; N];
            out.copy_from_slice(&bytes);
            bytes.zeroize();
            return Ok(out);
        }

        let mut out = [0u8; N];
        rand::thread_rng().fill_bytes(&mut out);
        self.store.store(name, &out).await?;
        info!(name = %name, "Generated new key material");
        Ok(out)
    }
}

#[async_trait]
impl EncryptionProvider for FieldCipher {
    async fn initialize(&self) -> CryptoResult<()> {
        self.keys
            .get_or_try_init(|| async {
                let key = self.load_or_create::<KEY_SIZE>(DATA_KEY_NAME).await?;
                let salt = self.load_or_create::<SALT_SIZE>(HASH_SALT_NAME).await?;
                Ok::<_, CryptoError>(KeyMaterial { key, salt })
            })
            .await?;
        Ok(())
    }

    fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let keys = self.keys()?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&keys.key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(ciphertext);

        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        let keys = self.keys()?;
        let sealed = BASE64
            .decode(ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&keys.key));
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        let plaintext = cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed("authentication failed".into()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    fn hash(&self, plaintext: &str) -> CryptoResult<String> {
        let keys = self.keys()?;
        let mut hasher = Sha256::new();
        hasher.update(keys.salt);
        hasher.update(plaintext.as_bytes());

        Ok(hex::encode(hasher.finalize()))
    }
}

// =============================================================================
// Record Helpers
// =============================================================================

/// Fields encrypted at rest for each entity kind.
pub fn sensitive_fields(kind: &EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Medication => &["name", "strength", "instructions", "prescriber", "notes"],
        EntityKind::Dose => &["notes"],
        EntityKind::Schedule => &["instructions", "notes"],
        EntityKind::Custom(_) => &[],
    }
}

/// Sensitive fields that also get a `hash_<field>` index entry.
pub fn searchable_fields(kind: &EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Medication => &["name"],
        _ => &[],
    }
}

/// Encrypts the listed fields in place of their values.
///
/// Each value is JSON-encoded before encryption so numbers and arrays
/// survive the round trip. Fields in `searchable` also get a
/// `hash_<field>` entry computed over the same encoding.
pub fn encrypt_record(
    provider: &dyn EncryptionProvider,
    fields: &FieldMap,
    sensitive: &[&str],
    searchable: &[&str],
) -> CryptoResult<FieldMap> {
    let mut out = fields.clone();

    for name in sensitive {
        let Some(value) = fields.get(*name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }

        let encoded =
            serde_json::to_string(value).map_err(|e| CryptoError::Encoding(e.to_string()))?;

        if searchable.contains(name) {
            out.insert(
                format!("{HASH_FIELD_PREFIX}{name}"),
                Value::String(provider.hash(&encoded)?),
            );
        }
        out.insert(name.to_string(), Value::String(provider.encrypt(&encoded)?));
    }

    Ok(out)
}

/// Decrypts the listed fields.
///
/// Never fails: a field that cannot be decrypted becomes
/// [`DECRYPTION_FAILED_PLACEHOLDER`] and the record gets
/// `_decryption_failed: true`. Hash index entries are dropped.
pub fn decrypt_record(
    provider: &dyn EncryptionProvider,
    fields: &FieldMap,
    sensitive: &[&str],
) -> FieldMap {
    let mut out: FieldMap = fields
        .iter()
        .filter(|(name, _)| !name.starts_with(HASH_FIELD_PREFIX))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut failed = false;

    for name in sensitive {
        let Some(Value::String(ciphertext)) = fields.get(*name) else {
            continue;
        };

        let decoded = provider
            .decrypt(ciphertext)
            .and_then(|plain| {
                serde_json::from_str::<Value>(&plain)
                    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
            });

        match decoded {
            Ok(value) => {
                out.insert(name.to_string(), value);
            }
            Err(e) => {
                warn!(field = %name, error = %e, "Field decryption failed");
                out.insert(
                    name.to_string(),
                    Value::String(DECRYPTION_FAILED_PLACEHOLDER.to_string()),
                );
                failed = true;
            }
        }
    }

    if failed {
        out.insert(DECRYPTION_FAILED_FLAG.to_string(), Value::Bool(true));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn cipher() -> FieldCipher {
        let cipher = FieldCipher::new(MemoryKeyStore::new());
        cipher.initialize().await.unwrap();
        cipher
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let cipher = cipher().await;
        let long = "x".repeat(4096);

        for s in ["a", "Lisinopril 10mg", "take with food; ünïcödé ✓", long.as_str()] {
            let sealed = cipher.encrypt(s).unwrap();
            assert_ne!(sealed, s);
            assert_eq!(cipher.decrypt(&sealed).unwrap(), s);
        }
    }

    #[tokio::test]
    async fn test_ciphertext_is_not_deterministic() {
        let cipher = cipher().await;

        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[tokio::test]
    async fn test_hash_is_deterministic() {
        let cipher = cipher().await;

        let a = cipher.hash("Metformin").unwrap();
        assert_eq!(a, cipher.hash("Metformin").unwrap());
        assert_ne!(a, cipher.hash("metformin").unwrap());
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let cipher = FieldCipher::new(MemoryKeyStore::new());

        assert!(matches!(cipher.encrypt("x"), Err(CryptoError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let cipher = cipher().await;
        let mut sealed = BASE64.decode(cipher.encrypt("secret").unwrap()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(matches!(
            cipher.decrypt(&BASE64.encode(sealed)),
            Err(CryptoError::DecryptionFailed(_))
        ));
        assert!(cipher.decrypt("not base64!").is_err());
    }

    #[tokio::test]
    async fn test_keys_persist_across_instances() {
        let db = medsync_db::Database::new(medsync_db::DbConfig::in_memory())
            .await
            .unwrap();

        let first = FieldCipher::new(DbKeyStore::new(db.secrets()));
        first.initialize().await.unwrap();
        first.initialize().await.unwrap();
        let sealed = first.encrypt("persisted").unwrap();

        let second = FieldCipher::new(DbKeyStore::new(db.secrets()));
        second.initialize().await.unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), "persisted");
        assert_eq!(first.hash("x").unwrap(), second.hash("x").unwrap());
    }

    #[tokio::test]
    async fn test_rejects_wrong_size_key() {
        let store = MemoryKeyStore::new();
        store.store(DATA_KEY_NAME, &[1, 2, 3]).await.unwrap();
        let cipher = FieldCipher::new(store);

        assert!(matches!(
            cipher.initialize().await,
            Err(CryptoError::InvalidKeyMaterial { len: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let cipher = cipher().await;
        let kind = EntityKind::Medication;
        let mut fields = FieldMap::new();
        fields.insert("name".into(), json!("Atorvastatin"));
        fields.insert("strength".into(), json!(20));
        fields.insert("form".into(), json!("tablet"));

        let sealed = encrypt_record(
            &cipher,
            &fields,
            sensitive_fields(&kind),
            searchable_fields(&kind),
        )
        .unwrap();

        assert_ne!(sealed.get("name"), fields.get("name"));
        assert_eq!(sealed.get("form"), Some(&json!("tablet")));
        assert_eq!(
            sealed.get("hash_name"),
            Some(&json!(cipher.hash("\"Atorvastatin\"").unwrap()))
        );

        let opened = decrypt_record(&cipher, &sealed, sensitive_fields(&kind));
        assert_eq!(opened, fields);
    }

    #[tokio::test]
    async fn test_bad_field_gets_placeholder() {
        let cipher = cipher().await;
        let mut sealed = FieldMap::new();
        sealed.insert("notes".into(), json!("garbage"));
        sealed.insert("status".into(), json!("taken"));

        let opened = decrypt_record(&cipher, &sealed, sensitive_fields(&EntityKind::Dose));

        assert_eq!(opened.get("notes"), Some(&json!(DECRYPTION_FAILED_PLACEHOLDER)));
        assert_eq!(opened.get("status"), Some(&json!("taken")));
        assert_eq!(opened.get(DECRYPTION_FAILED_FLAG), Some(&json!(true)));
    }
}
