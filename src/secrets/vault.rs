//! Secret vault
//!
//! Detected credentials are replaced by opaque placeholders on the
//! client→server path and restored immediately before the message
//! leaves for the downstream server. Originals are held under AEAD
//! (AES-256-GCM, 128-bit nonce) with a key derived once per process.
//!
//! Scoping rules:
//! - A placeholder belongs to exactly one connection. Retrieval under
//!   any other connection id fails and is reported.
//! - The same plaintext offered twice within a connection returns the
//!   same placeholder, so clients observing their own traffic see
//!   stable substitutions.
//! - Records die on explicit removal, TTL expiry, connection teardown,
//!   or process shutdown. Dead records are zeroized.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// AES-256-GCM with a 128-bit nonce. The nonce width matches the
/// stored-record format and must not change.
type VaultCipher = AesGcm<Aes256, U16>;

/// Frozen wire shape: prefix + 32 uppercase hex from 16 random bytes.
pub const PLACEHOLDER_PREFIX: &str = "MCPROXY_KEY_";

/// Hex digits following the prefix.
pub const PLACEHOLDER_HEX_LEN: usize = 32;

/// Regex source for in-string placeholder matching. Part of the wire
/// contract with anything observing proxy output.
pub const PLACEHOLDER_PATTERN: &str = "MCPROXY_KEY_[A-F0-9]{32}";

/// Interval for the background expiry sweep.
pub const SWEEP_INTERVAL_SECS: u64 = 60;

const KDF_SALT: &[u8] = b"mcproxy-vault-v1";

/// Environment variable holding the process secret for key derivation.
pub const VAULT_SECRET_ENV: &str = "MCPROXY_VAULT_SECRET";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VaultError {
    #[error("connection {connection_id} already holds {max} stored secrets")]
    CapacityExceeded { connection_id: String, max: usize },
    #[error("vault key derivation failed")]
    KeyDerivation,
    #[error("vault encryption failed")]
    Encryption,
}

/// Process-wide AEAD key. Derived once at startup, zeroized on drop.
pub struct VaultKey {
    bytes: [u8; 32],
}

impl VaultKey {
    /// scrypt(secret, fixed-salt, 32).
    pub fn derive(secret: &[u8]) -> Result<Self, VaultError> {
        let params =
            scrypt::Params::new(15, 8, 1, 32).map_err(|_| VaultError::KeyDerivation)?;
        let mut bytes = [0u8; 32];
        scrypt::scrypt(secret, KDF_SALT, &params, &mut bytes)
            .map_err(|_| VaultError::KeyDerivation)?;
        Ok(Self { bytes })
    }

    /// Read the process secret from the environment, or generate one
    /// for this process only.
    pub fn from_env_or_random() -> Result<Self, VaultError> {
        match std::env::var(VAULT_SECRET_ENV) {
            Ok(secret) => {
                let key = Self::derive(secret.as_bytes());
                debug!("vault key derived from {VAULT_SECRET_ENV}");
                key
            }
            Err(_) => {
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                let key = Self::derive(&secret);
                secret.zeroize();
                debug!("vault key derived from per-process random secret");
                key
            }
        }
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// One vaulted secret. `ciphertext` carries the AEAD tag; when
/// encryption is disabled it holds the plaintext bytes directly.
struct StoredSecret {
    placeholder: String,
    ciphertext: Vec<u8>,
    nonce: [u8; 16],
    connection_id: String,
    secret_type: Option<String>,
    fingerprint: String,
    created_at: Instant,
    last_accessed: Instant,
}

impl Drop for StoredSecret {
    fn drop(&mut self) {
        self.ciphertext.zeroize();
        self.nonce.zeroize();
    }
}

/// Outcome of a checked retrieval. The caller maps the failure arms to
/// security events; `retrieve` collapses them to None.
#[derive(Debug, PartialEq, Eq)]
pub enum RetrieveOutcome {
    Found(String),
    Unknown,
    Expired,
    WrongConnection,
    DecryptFailed,
}

pub struct SecretVault {
    records: HashMap<String, StoredSecret>,
    by_fingerprint: HashMap<String, String>,
    by_connection: HashMap<String, HashSet<String>>,
    key: std::sync::Arc<VaultKey>,
    encryption: bool,
    ttl: Duration,
    max_keys_per_connection: usize,
}

impl SecretVault {
    pub fn new(
        key: std::sync::Arc<VaultKey>,
        encryption: bool,
        ttl: Duration,
        max_keys_per_connection: usize,
    ) -> Self {
        Self {
            records: HashMap::new(),
            by_fingerprint: HashMap::new(),
            by_connection: HashMap::new(),
            key,
            encryption,
            ttl,
            max_keys_per_connection,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Structural test against the placeholder format.
    pub fn is_placeholder(s: &str) -> bool {
        s.len() == PLACEHOLDER_PREFIX.len() + PLACEHOLDER_HEX_LEN
            && s.starts_with(PLACEHOLDER_PREFIX)
            && s[PLACEHOLDER_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
    }

    /// Store a secret for a connection, minting a placeholder. Re-offering
    /// the same plaintext under the same connection returns the existing
    /// placeholder.
    pub fn store(
        &mut self,
        secret: &str,
        connection_id: &str,
        secret_type: Option<&str>,
    ) -> Result<String, VaultError> {
        let fingerprint = fingerprint(connection_id, secret);
        if let Some(placeholder) = self.by_fingerprint.get(&fingerprint) {
            let placeholder = placeholder.clone();
            if let Some(record) = self.records.get_mut(&placeholder) {
                record.last_accessed = Instant::now();
                return Ok(placeholder);
            }
        }

        let owned = self
            .by_connection
            .get(connection_id)
            .map(|set| set.len())
            .unwrap_or(0);
        if owned >= self.max_keys_per_connection {
            return Err(VaultError::CapacityExceeded {
                connection_id: connection_id.to_string(),
                max: self.max_keys_per_connection,
            });
        }

        let placeholder = mint_placeholder();
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = if self.encryption {
            let cipher = VaultCipher::new(GenericArray::from_slice(&self.key.bytes));
            cipher
                .encrypt(GenericArray::from_slice(&nonce), secret.as_bytes())
                .map_err(|_| VaultError::Encryption)?
        } else {
            secret.as_bytes().to_vec()
        };

        let now = Instant::now();
        let record = StoredSecret {
            placeholder: placeholder.clone(),
            ciphertext,
            nonce,
            connection_id: connection_id.to_string(),
            secret_type: secret_type.map(|s| s.to_string()),
            fingerprint: fingerprint.clone(),
            created_at: now,
            last_accessed: now,
        };
        self.records.insert(placeholder.clone(), record);
        self.by_fingerprint.insert(fingerprint, placeholder.clone());
        self.by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(placeholder.clone());
        debug!(
            connection_id,
            placeholder = %placeholder,
            secret_type = secret_type.unwrap_or("unknown"),
            "secret vaulted"
        );
        Ok(placeholder)
    }

    /// Checked retrieval with full outcome. Expired records are deleted
    /// on the way out (lazy expiry).
    pub fn retrieve_checked(&mut self, placeholder: &str, connection_id: &str) -> RetrieveOutcome {
        let (expired, wrong_connection) = match self.records.get(placeholder) {
            None => return RetrieveOutcome::Unknown,
            Some(record) => (
                record.created_at.elapsed() > self.ttl,
                record.connection_id != connection_id,
            ),
        };
        if expired {
            self.remove(placeholder);
            return RetrieveOutcome::Expired;
        }
        if wrong_connection {
            warn!(
                placeholder,
                connection_id, "placeholder retrieval denied: wrong connection"
            );
            return RetrieveOutcome::WrongConnection;
        }

        let Some(record) = self.records.get_mut(placeholder) else {
            return RetrieveOutcome::Unknown;
        };
        record.last_accessed = Instant::now();
        if !self.encryption {
            return match String::from_utf8(record.ciphertext.clone()) {
                Ok(secret) => RetrieveOutcome::Found(secret),
                Err(_) => RetrieveOutcome::DecryptFailed,
            };
        }
        let cipher = VaultCipher::new(GenericArray::from_slice(&self.key.bytes));
        match cipher.decrypt(
            GenericArray::from_slice(&record.nonce),
            record.ciphertext.as_ref(),
        ) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(secret) => RetrieveOutcome::Found(secret),
                Err(_) => RetrieveOutcome::DecryptFailed,
            },
            Err(_) => {
                // Tag mismatch: fail closed, never fall back to the
                // placeholder text as a secret.
                warn!(placeholder, "vault decrypt failed");
                RetrieveOutcome::DecryptFailed
            }
        }
    }

    /// Contractual form: secret or None.
    pub fn retrieve(&mut self, placeholder: &str, connection_id: &str) -> Option<String> {
        match self.retrieve_checked(placeholder, connection_id) {
            RetrieveOutcome::Found(secret) => Some(secret),
            _ => None,
        }
    }

    /// The classifier tag recorded at store time, if the placeholder is
    /// live.
    pub fn secret_type(&self, placeholder: &str) -> Option<&str> {
        self.records
            .get(placeholder)
            .and_then(|r| r.secret_type.as_deref())
    }

    pub fn remove(&mut self, placeholder: &str) {
        if let Some(record) = self.records.remove(placeholder) {
            self.by_fingerprint.remove(&record.fingerprint);
            if let Some(set) = self.by_connection.get_mut(&record.connection_id) {
                set.remove(placeholder);
                if set.is_empty() {
                    self.by_connection.remove(&record.connection_id);
                }
            }
        }
    }

    /// Connection teardown: drop every record the connection owns.
    pub fn remove_all(&mut self, connection_id: &str) {
        if let Some(placeholders) = self.by_connection.remove(connection_id) {
            for placeholder in placeholders {
                if let Some(record) = self.records.remove(&placeholder) {
                    self.by_fingerprint.remove(&record.fingerprint);
                }
            }
            debug!(connection_id, "vault records removed for connection");
        }
    }

    /// Periodic sweep: delete records older than the TTL.
    pub fn sweep(&mut self) -> usize {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|r| r.created_at.elapsed() > self.ttl)
            .map(|r| r.placeholder.clone())
            .collect();
        let count = expired.len();
        for placeholder in expired {
            self.remove(&placeholder);
        }
        if count > 0 {
            debug!(count, "vault sweep expired records");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys_for_connection(&self, connection_id: &str) -> usize {
        self.by_connection
            .get(connection_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

fn mint_placeholder() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", PLACEHOLDER_PREFIX, hex::encode_upper(bytes))
}

/// Fingerprint binds the plaintext to its owning connection, so the
/// same secret on two connections yields two placeholders.
fn fingerprint(connection_id: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(connection_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
