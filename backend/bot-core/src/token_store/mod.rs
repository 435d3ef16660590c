//! Encrypted-at-rest storage for the upstream credential.
//!
//! The credential is sealed with ChaCha20-Poly1305 under a key derived from
//! the operator passphrase (PBKDF2-HMAC-SHA256) and persisted as a JSON
//! record in a [`KeyValueStore`]. Plaintext only ever leaves this module
//! inside a [`RedactedToken`], which zeroizes itself on drop.

pub mod validation;

pub use validation::validate_token_format;

use crate::config::KeyValueStore;
use crate::error::token_store::TokenStoreError;

use common::RedactedToken;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use log::{debug, info};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Key under which the sealed credential is stored.
pub const CREDENTIAL_KEY: &str = "credential";

pub const DEFAULT_ITERATIONS: u32 = 100_000;
const RECORD_VERSION: u32 = 1;
const KDF_NAME: &str = "pbkdf2-hmac-sha256";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const ASSOCIATED_DATA: &[u8] = b"bot-credential-v1";

/// Source of the decrypted upstream credential.
///
/// The connection manager asks for it once per handshake and drops it right
/// after.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Result<RedactedToken, TokenStoreError>;
}

/// On-disk form of a sealed credential.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialRecord {
    version: u32,
    kdf: String,
    iterations: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
    tag: String,
}

pub struct SecureTokenStore {
    store: Arc<dyn KeyValueStore>,
    passphrase: RedactedToken,
    iterations: u32,
}

impl SecureTokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>, passphrase: RedactedToken) -> Self {
        Self {
            store,
            passphrase,
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Override the PBKDF2 work factor for new records.
    ///
    /// Existing records keep the count they were sealed with.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    /// Decrypt the stored credential.
    ///
    /// # Errors
    ///
    /// - [`TokenStoreError::NotConfigured`] if nothing is stored
    /// - [`TokenStoreError::Integrity`] on a wrong passphrase or tampered record
    /// - [`TokenStoreError::Record`] if the record cannot be parsed
    pub fn get(&self) -> Result<RedactedToken, TokenStoreError> {
        let Some(json) = self.store.get(CREDENTIAL_KEY)? else {
            return Err(TokenStoreError::not_configured());
        };

        let record: CredentialRecord = serde_json::from_str(&json)
            .map_err(|e| TokenStoreError::record(format!("unreadable credential record: {e}")))?;

        if record.version != RECORD_VERSION || record.kdf != KDF_NAME {
            return Err(TokenStoreError::record(format!(
                "unsupported credential record (version {}, kdf '{}')",
                record.version, record.kdf
            )));
        }

        let salt = decode_field("salt", &record.salt, Some(SALT_LEN))?;
        let nonce = decode_field("nonce", &record.nonce, Some(NONCE_LEN))?;
        let tag = decode_field("tag", &record.tag, Some(TAG_LEN))?;
        let mut plaintext = decode_field("ciphertext", &record.ciphertext, None)?;

        let key = self.derive_key(&salt, record.iterations);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                ASSOCIATED_DATA,
                &mut plaintext,
                Tag::from_slice(&tag),
            )
            .map_err(|_| {
                TokenStoreError::integrity("credential failed authentication (wrong passphrase?)")
            })?;

        debug!("Decrypted stored credential");

        RedactedToken::from_utf8(plaintext)
            .ok_or_else(|| TokenStoreError::record("credential is not valid UTF-8"))
    }

    /// Validate, encrypt and store `token`, replacing any previous one.
    pub fn set(&self, token: &str) -> Result<(), TokenStoreError> {
        validate_token_format(token)?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt, self.iterations);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

        let mut buffer = Zeroizing::new(token.as_bytes().to_vec());
        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                ASSOCIATED_DATA,
                buffer.as_mut_slice(),
            )
            .map_err(|e| TokenStoreError::crypto(format!("encryption failed: {e}")))?;

        let record = CredentialRecord {
            version: RECORD_VERSION,
            kdf: KDF_NAME.to_string(),
            iterations: self.iterations,
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(buffer.as_slice()),
            tag: BASE64.encode(tag),
        };

        let json = serde_json::to_string(&record)
            .map_err(|e| TokenStoreError::record(format!("cannot encode record: {e}")))?;

        self.store.set(CREDENTIAL_KEY, &json)?;
        info!("Stored encrypted credential");
        Ok(())
    }

    /// Remove the stored credential. Clearing an empty store is not an error.
    pub fn clear(&self) -> Result<(), TokenStoreError> {
        self.store.remove(CREDENTIAL_KEY)?;
        info!("Cleared stored credential");
        Ok(())
    }

    pub fn is_configured(&self) -> Result<bool, TokenStoreError> {
        Ok(self.store.get(CREDENTIAL_KEY)?.is_some())
    }

    fn derive_key(&self, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.passphrase.as_str().as_bytes(),
            salt,
            iterations,
            key.as_mut_slice(),
        );
        key
    }
}

impl CredentialProvider for SecureTokenStore {
    fn credential(&self) -> Result<RedactedToken, TokenStoreError> {
        self.get()
    }
}

fn decode_field(
    name: &str,
    value: &str,
    expected_len: Option<usize>,
) -> Result<Vec<u8>, TokenStoreError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| TokenStoreError::record(format!("field '{name}' is not base64: {e}")))?;

    match expected_len {
        Some(len) if bytes.len() != len => Err(TokenStoreError::record(format!(
            "field '{name}' has {} bytes, expected {len}",
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}
