//! IdentityStore: persists, under a password, the identity
//! signing private half, active `ExchangePair` privates, and cached
//! `SessionKey`s so a reload can resume encrypted conversations.
//!
//! Modeled as a `KeyVault` trait so [`crate::handshake`] can hold
//! a `&dyn KeyVault` without ever depending on handshake concerns: a
//! one-way dependency. Two implementations are provided:
//! [`InMemoryVault`] for tests, and [`FileVault`] which persists wrapped
//! blobs as one file per entry using an atomic write.

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, CoreResult};
use crate::identity::SigningAlgorithm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use async_trait::async_trait;
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use zeroize::Zeroize;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;

const EXCHANGE_TTL_MS: i64 = 10 * 60 * 1000;
const SESSION_KEY_TTL_MS: i64 = 60 * 60 * 1000;

/// Purpose tag folded into the wrapped plaintext so a correctly-decrypted
/// blob of the wrong kind surfaces `LegacyFormat`, not a false "success".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum KeyPurpose {
    IdentityPrivate = 1,
    ExchangePrivate = 2,
    SessionKey = 3,
}

impl KeyPurpose {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::IdentityPrivate),
            2 => Some(Self::ExchangePrivate),
            3 => Some(Self::SessionKey),
            _ => None,
        }
    }
}

/// On-disk/in-memory layout: `salt(16) || iv(12) || AEAD(wrapping_key, iv, purpose || payload)`.
#[derive(Debug, Clone)]
struct WrappedBlob {
    salt: [u8; SALT_LEN],
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
    created_at_ms: i64,
}

impl WrappedBlob {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    fn decode(bytes: &[u8], created_at_ms: i64) -> CoreResult<Self> {
        if bytes.len() < SALT_LEN + IV_LEN {
            return Err(CoreError::WrongPasswordOrCorrupt);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[..SALT_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + IV_LEN]);
        Ok(Self {
            salt,
            iv,
            ciphertext: bytes[SALT_LEN + IV_LEN..].to_vec(),
            created_at_ms,
        })
    }
}

fn derive_wrapping_key(password: &str, salt: &[u8; SALT_LEN]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn wrap(password: &str, purpose: KeyPurpose, payload: &[u8]) -> CoreResult<WrappedBlob> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut key = derive_wrapping_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CoreError::Internal(format!("aead key init: {e}")))?;
    key.zeroize();

    let mut plaintext = Vec::with_capacity(1 + payload.len());
    plaintext.push(purpose as u8);
    plaintext.extend_from_slice(payload);

    let nonce = GenericArray::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| CoreError::Internal(format!("aead wrap: {e}")))?;
    plaintext.zeroize();

    Ok(WrappedBlob {
        salt,
        iv,
        ciphertext,
        created_at_ms: 0,
    })
}

fn unwrap(password: &str, blob: &WrappedBlob, expected: KeyPurpose) -> CoreResult<Vec<u8>> {
    let mut key = derive_wrapping_key(password, &blob.salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CoreError::Internal(format!("aead key init: {e}")))?;
    key.zeroize();
    let nonce = GenericArray::from_slice(&blob.iv);
    let plaintext = cipher
        .decrypt(nonce, blob.ciphertext.as_slice())
        .map_err(|_| CoreError::WrongPasswordOrCorrupt)?;

    let (purpose_byte, payload) = plaintext
        .split_first()
        .ok_or(CoreError::WrongPasswordOrCorrupt)?;
    let purpose = KeyPurpose::from_byte(*purpose_byte).ok_or(CoreError::WrongPasswordOrCorrupt)?;
    if purpose != expected {
        return Err(CoreError::LegacyFormat);
    }
    Ok(payload.to_vec())
}

/// An exchange private key pair as persisted: algorithm-agnostic raw bytes
/// of the ephemeral EC private scalar.
#[derive(Debug, Clone)]
pub struct StoredExchangePrivate {
    pub exchange_id: String,
    pub private_scalar: Vec<u8>,
}

/// A stored identity private key: algorithm tag plus PKCS#8/SEC1 DER bytes.
#[derive(Debug, Clone)]
pub struct StoredIdentityPrivate {
    pub algorithm: SigningAlgorithm,
    pub der: Vec<u8>,
}

fn encode_identity_payload(identity: &StoredIdentityPrivate) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + identity.der.len());
    out.push(match identity.algorithm {
        SigningAlgorithm::Rsa2048Pss => 0u8,
        SigningAlgorithm::P256Ecdsa => 1u8,
    });
    out.extend_from_slice(&identity.der);
    out
}

fn decode_identity_payload(bytes: &[u8]) -> CoreResult<StoredIdentityPrivate> {
    let (tag, der) = bytes.split_first().ok_or(CoreError::WrongPasswordOrCorrupt)?;
    let algorithm = match tag {
        0 => SigningAlgorithm::Rsa2048Pss,
        1 => SigningAlgorithm::P256Ecdsa,
        _ => return Err(CoreError::WrongPasswordOrCorrupt),
    };
    Ok(StoredIdentityPrivate {
        algorithm,
        der: der.to_vec(),
    })
}

/// Persistence contract for IdentityStore. All operations may
/// suspend; implementations must serialize writes to the same
/// key internally so `store_*` is atomic with respect to concurrent calls.
#[async_trait(?Send)]
pub trait KeyVault {
    async fn store_identity_private(
        &self,
        user_id: &str,
        identity: &StoredIdentityPrivate,
        password: &str,
    ) -> CoreResult<()>;
    async fn load_identity_private(
        &self,
        user_id: &str,
        password: &str,
    ) -> CoreResult<StoredIdentityPrivate>;
    async fn delete_identity_private(&self, user_id: &str) -> CoreResult<()>;

    async fn store_exchange_private(
        &self,
        exchange_id: &str,
        private_scalar: &[u8],
        password: &str,
    ) -> CoreResult<()>;
    async fn load_exchange_private(
        &self,
        exchange_id: &str,
        password: &str,
    ) -> CoreResult<StoredExchangePrivate>;
    async fn delete_exchange_private(&self, exchange_id: &str) -> CoreResult<()>;

    async fn store_session_key(&self, peer_id: &str, key: &[u8; 32], password: &str) -> CoreResult<()>;
    async fn load_session_key(&self, peer_id: &str, password: &str) -> CoreResult<[u8; 32]>;
    async fn delete_session_key(&self, peer_id: &str) -> CoreResult<()>;
}

enum StoredKind {
    Identity,
    Exchange,
    Session,
}

fn entry_key(kind: StoredKind, id: &str) -> String {
    match kind {
        StoredKind::Identity => format!("identity:{id}"),
        StoredKind::Exchange => format!("exchange:{id}"),
        StoredKind::Session => format!("session:{id}"),
    }
}

/// In-memory `KeyVault`, used by tests and wherever persistence across
/// process restarts is not required.
pub struct InMemoryVault<C: Clock = SystemClock> {
    entries: Mutex<HashMap<String, WrappedBlob>>,
    clock: C,
}

impl InMemoryVault<SystemClock> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: SystemClock,
        }
    }
}

impl Default for InMemoryVault<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryVault<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn put(&self, key: String, mut blob: WrappedBlob) {
        blob.created_at_ms = self.clock.now_ms();
        self.entries.lock().unwrap().insert(key, blob);
    }

    fn get_fresh(&self, key: &str, ttl_ms: Option<i64>) -> CoreResult<WrappedBlob> {
        let mut guard = self.entries.lock().unwrap();
        let Some(blob) = guard.get(key) else {
            return Err(CoreError::NotFound);
        };
        if let Some(ttl) = ttl_ms {
            if self.clock.now_ms() - blob.created_at_ms > ttl {
                guard.remove(key);
                return Err(CoreError::NotFound);
            }
        }
        Ok(blob.clone())
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[async_trait(?Send)]
impl<C: Clock> KeyVault for InMemoryVault<C> {
    async fn store_identity_private(
        &self,
        user_id: &str,
        identity: &StoredIdentityPrivate,
        password: &str,
    ) -> CoreResult<()> {
        let payload = encode_identity_payload(identity);
        let blob = wrap(password, KeyPurpose::IdentityPrivate, &payload)?;
        self.put(entry_key(StoredKind::Identity, user_id), blob);
        Ok(())
    }

    async fn load_identity_private(
        &self,
        user_id: &str,
        password: &str,
    ) -> CoreResult<StoredIdentityPrivate> {
        let blob = self.get_fresh(&entry_key(StoredKind::Identity, user_id), None)?;
        let payload = unwrap(password, &blob, KeyPurpose::IdentityPrivate)?;
        decode_identity_payload(&payload)
    }

    async fn delete_identity_private(&self, user_id: &str) -> CoreResult<()> {
        self.remove(&entry_key(StoredKind::Identity, user_id));
        Ok(())
    }

    async fn store_exchange_private(
        &self,
        exchange_id: &str,
        private_scalar: &[u8],
        password: &str,
    ) -> CoreResult<()> {
        let blob = wrap(password, KeyPurpose::ExchangePrivate, private_scalar)?;
        self.put(entry_key(StoredKind::Exchange, exchange_id), blob);
        Ok(())
    }

    async fn load_exchange_private(
        &self,
        exchange_id: &str,
        password: &str,
    ) -> CoreResult<StoredExchangePrivate> {
        let blob = self.get_fresh(&entry_key(StoredKind::Exchange, exchange_id), Some(EXCHANGE_TTL_MS))?;
        let private_scalar = unwrap(password, &blob, KeyPurpose::ExchangePrivate)?;
        Ok(StoredExchangePrivate {
            exchange_id: exchange_id.to_string(),
            private_scalar,
        })
    }

    async fn delete_exchange_private(&self, exchange_id: &str) -> CoreResult<()> {
        self.remove(&entry_key(StoredKind::Exchange, exchange_id));
        Ok(())
    }

    async fn store_session_key(&self, peer_id: &str, key: &[u8; 32], password: &str) -> CoreResult<()> {
        let blob = wrap(password, KeyPurpose::SessionKey, key)?;
        self.put(entry_key(StoredKind::Session, peer_id), blob);
        Ok(())
    }

    async fn load_session_key(&self, peer_id: &str, password: &str) -> CoreResult<[u8; 32]> {
        let blob = self.get_fresh(&entry_key(StoredKind::Session, peer_id), Some(SESSION_KEY_TTL_MS))?;
        let bytes = unwrap(password, &blob, KeyPurpose::SessionKey)?;
        bytes
            .try_into()
            .map_err(|_| CoreError::WrongPasswordOrCorrupt)
    }

    async fn delete_session_key(&self, peer_id: &str) -> CoreResult<()> {
        self.remove(&entry_key(StoredKind::Session, peer_id));
        Ok(())
    }
}

/// File-backed `KeyVault`: one file per entry under `base_dir`, written
/// atomically (temp file + rename) so a crash mid-write never corrupts an
/// existing entry. Modification times double as the creation timestamp
/// used for the exchange/session expiry checks.
pub struct FileVault {
    base_dir: PathBuf,
}

impl FileVault {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.blob"))
    }

    async fn write_atomic(&self, key: &str, blob: &WrappedBlob) -> CoreResult<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| CoreError::Internal(format!("vault dir: {e}")))?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, blob.encode())
            .await
            .map_err(|e| CoreError::Internal(format!("vault write: {e}")))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| CoreError::Internal(format!("vault rename: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await;
        }
        Ok(())
    }

    async fn read_fresh(&self, key: &str, ttl_ms: Option<i64>) -> CoreResult<WrappedBlob> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| CoreError::NotFound)?;
        let created_at_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        if let Some(ttl) = ttl_ms {
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64;
            if now_ms - created_at_ms > ttl {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(CoreError::NotFound);
            }
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| CoreError::NotFound)?;
        WrappedBlob::decode(&bytes, created_at_ms)
    }

    async fn remove(&self, key: &str) -> CoreResult<()> {
        let _ = tokio::fs::remove_file(self.path_for(key)).await;
        Ok(())
    }
}

#[async_trait(?Send)]
impl KeyVault for FileVault {
    async fn store_identity_private(
        &self,
        user_id: &str,
        identity: &StoredIdentityPrivate,
        password: &str,
    ) -> CoreResult<()> {
        let payload = encode_identity_payload(identity);
        let blob = wrap(password, KeyPurpose::IdentityPrivate, &payload)?;
        self.write_atomic(&entry_key(StoredKind::Identity, user_id), &blob).await
    }

    async fn load_identity_private(
        &self,
        user_id: &str,
        password: &str,
    ) -> CoreResult<StoredIdentityPrivate> {
        let blob = self.read_fresh(&entry_key(StoredKind::Identity, user_id), None).await?;
        let payload = unwrap(password, &blob, KeyPurpose::IdentityPrivate)?;
        decode_identity_payload(&payload)
    }

    async fn delete_identity_private(&self, user_id: &str) -> CoreResult<()> {
        self.remove(&entry_key(StoredKind::Identity, user_id)).await
    }

    async fn store_exchange_private(
        &self,
        exchange_id: &str,
        private_scalar: &[u8],
        password: &str,
    ) -> CoreResult<()> {
        let blob = wrap(password, KeyPurpose::ExchangePrivate, private_scalar)?;
        self.write_atomic(&entry_key(StoredKind::Exchange, exchange_id), &blob).await
    }

    async fn load_exchange_private(
        &self,
        exchange_id: &str,
        password: &str,
    ) -> CoreResult<StoredExchangePrivate> {
        let blob = self
            .read_fresh(&entry_key(StoredKind::Exchange, exchange_id), Some(EXCHANGE_TTL_MS))
            .await?;
        let private_scalar = unwrap(password, &blob, KeyPurpose::ExchangePrivate)?;
        Ok(StoredExchangePrivate {
            exchange_id: exchange_id.to_string(),
            private_scalar,
        })
    }

    async fn delete_exchange_private(&self, exchange_id: &str) -> CoreResult<()> {
        self.remove(&entry_key(StoredKind::Exchange, exchange_id)).await
    }

    async fn store_session_key(&self, peer_id: &str, key: &[u8; 32], password: &str) -> CoreResult<()> {
        let blob = wrap(password, KeyPurpose::SessionKey, key)?;
        self.write_atomic(&entry_key(StoredKind::Session, peer_id), &blob).await
    }

    async fn load_session_key(&self, peer_id: &str, password: &str) -> CoreResult<[u8; 32]> {
        let blob = self
            .read_fresh(&entry_key(StoredKind::Session, peer_id), Some(SESSION_KEY_TTL_MS))
            .await?;
        let bytes = unwrap(password, &blob, KeyPurpose::SessionKey)?;
        bytes.try_into().map_err(|_| CoreError::WrongPasswordOrCorrupt)
    }

    async fn delete_session_key(&self, peer_id: &str) -> CoreResult<()> {
        self.remove(&entry_key(StoredKind::Session, peer_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{generate_identity, SigningAlgorithm};

    #[tokio::test]
    async fn identity_round_trips_with_correct_password() {
        let vault = InMemoryVault::new();
        let identity = generate_identity(SigningAlgorithm::Rsa2048Pss).unwrap();
        let stored = StoredIdentityPrivate {
            algorithm: identity.algorithm(),
            der: identity.to_private_der().unwrap(),
        };
        vault.store_identity_private("alice", &stored, "hunter2").await.unwrap();
        let loaded = vault.load_identity_private("alice", "hunter2").await.unwrap();
        assert_eq!(loaded.der, stored.der);
    }

    #[tokio::test]
    async fn wrong_password_is_indistinguishable_from_corruption() {
        let vault = InMemoryVault::new();
        let identity = generate_identity(SigningAlgorithm::Rsa2048Pss).unwrap();
        let stored = StoredIdentityPrivate {
            algorithm: identity.algorithm(),
            der: identity.to_private_der().unwrap(),
        };
        vault.store_identity_private("alice", &stored, "hunter2").await.unwrap();
        let err = vault
            .load_identity_private("alice", "not-the-password")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WrongPasswordOrCorrupt));
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let vault = InMemoryVault::new();
        let err = vault.load_identity_private("ghost", "pw").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[tokio::test]
    async fn exchange_private_expires_after_ttl() {
        let clock = crate::clock::FixedClock::new(0);
        let vault = InMemoryVault::with_clock(clock);
        vault
            .store_exchange_private("ex-1", &[1, 2, 3, 4], "pw")
            .await
            .unwrap();
        assert!(vault.load_exchange_private("ex-1", "pw").await.is_ok());

        vault.clock.advance_ms(EXCHANGE_TTL_MS + 1);
        let err = vault.load_exchange_private("ex-1", "pw").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[tokio::test]
    async fn session_key_expires_after_ttl() {
        let clock = crate::clock::FixedClock::new(0);
        let vault = InMemoryVault::with_clock(clock);
        let key = [7u8; 32];
        vault.store_session_key("bob", &key, "pw").await.unwrap();
        assert_eq!(vault.load_session_key("bob", "pw").await.unwrap(), key);

        vault.clock.advance_ms(SESSION_KEY_TTL_MS + 1);
        let err = vault.load_session_key("bob", "pw").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[tokio::test]
    async fn mismatched_purpose_surfaces_legacy_format() {
        let vault = InMemoryVault::new();
        vault.store_exchange_private("shared-id", &[9, 9], "pw").await.unwrap();
        // Re-key the same slot under the identity namespace by constructing
        // the lookup key directly to simulate a legacy blob with a
        // different purpose tag landing under this id.
        let blob = wrap("pw", KeyPurpose::ExchangePrivate, &[9, 9]).unwrap();
        vault.put(entry_key(StoredKind::Identity, "shared-id"), blob);
        let err = vault
            .load_identity_private("shared-id", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::LegacyFormat));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let vault = InMemoryVault::new();
        vault.delete_session_key("nobody").await.unwrap();
        vault.delete_session_key("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn file_vault_round_trips_across_instances() {
        let dir = std::env::temp_dir().join(format!("cipherlink-vault-test-{}", std::process::id()));
        let vault = FileVault::new(&dir);
        let key = [3u8; 32];
        vault.store_session_key("carol", &key, "pw").await.unwrap();

        let reopened = FileVault::new(&dir);
        assert_eq!(reopened.load_session_key("carol", "pw").await.unwrap(), key);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
