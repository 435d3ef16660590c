use crate::helpers::scripted_upstream::TEST_CREDENTIAL;

use bot_core::config::{JsonFileStore, KeyValueStore, MemoryStore};
use bot_core::error::token_store::{TokenFormatFailure, TokenStoreError};
use bot_core::token_store::{CREDENTIAL_KEY, CredentialProvider, SecureTokenStore};

use common::RedactedToken;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

const PASSPHRASE: &str = "correct horse battery staple";
const TEST_ITERATIONS: u32 = 1_000;

fn token_store(store: Arc<dyn KeyValueStore>, passphrase: &str) -> SecureTokenStore {
    SecureTokenStore::new(store, RedactedToken::new(passphrase.to_string()))
        .with_iterations(TEST_ITERATIONS)
}

fn stored_record(store: &MemoryStore) -> Value {
    let json = store.get(CREDENTIAL_KEY).unwrap().expect("record stored");
    serde_json::from_str(&json).unwrap()
}

/// **VALUE**: A stored credential decrypts back to the original.
#[test]
fn given_valid_token_when_stored_then_get_returns_it() {
    // GIVEN
    let backing = Arc::new(MemoryStore::new());
    let tokens = token_store(backing.clone(), PASSPHRASE);
    assert!(!tokens.is_configured().unwrap());

    // WHEN
    tokens.set(TEST_CREDENTIAL).unwrap();

    // THEN
    assert!(tokens.is_configured().unwrap());
    assert_eq!(tokens.get().unwrap().as_str(), TEST_CREDENTIAL);
    assert_eq!(tokens.credential().unwrap().as_str(), TEST_CREDENTIAL);

    let record = stored_record(&backing);
    assert_eq!(record["kdf"], "pbkdf2-hmac-sha256");
    assert_eq!(record["iterations"], TEST_ITERATIONS);
}

/// **VALUE**: The backing store never holds the plaintext credential.
///
/// **WHY THIS MATTERS**: The config directory gets synced, backed up and attached to
/// bug reports. A plaintext token there is a leaked account.
#[test]
fn given_file_store_when_token_stored_then_file_has_no_plaintext() {
    // GIVEN
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("secrets.json");
    let tokens = token_store(Arc::new(JsonFileStore::new(&path)), PASSPHRASE);

    // WHEN
    tokens.set(TEST_CREDENTIAL).unwrap();

    // THEN
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(!on_disk.contains(TEST_CREDENTIAL));
    assert!(!on_disk.contains("MTA4NzY1NDMyMTA5ODc2NTQz"));

    let reopened = token_store(Arc::new(JsonFileStore::new(&path)), PASSPHRASE);
    assert_eq!(reopened.get().unwrap().as_str(), TEST_CREDENTIAL);
}

/// **VALUE**: Each write uses a fresh salt and nonce.
///
/// **BUG THIS CATCHES**: A fixed nonce, which breaks ChaCha20-Poly1305 outright.
#[test]
fn given_same_token_when_stored_twice_then_records_differ() {
    let backing = Arc::new(MemoryStore::new());
    let tokens = token_store(backing.clone(), PASSPHRASE);

    tokens.set(TEST_CREDENTIAL).unwrap();
    let first = stored_record(&backing);
    tokens.set(TEST_CREDENTIAL).unwrap();
    let second = stored_record(&backing);

    assert_ne!(first["nonce"], second["nonce"]);
    assert_ne!(first["salt"], second["salt"]);
    assert_ne!(first["ciphertext"], second["ciphertext"]);
}

/// **VALUE**: A wrong passphrase fails with Integrity, not garbage plaintext.
#[test]
fn given_wrong_passphrase_when_reading_then_integrity_error() {
    let backing = Arc::new(MemoryStore::new());
    token_store(backing.clone(), PASSPHRASE)
        .set(TEST_CREDENTIAL)
        .unwrap();

    let result = token_store(backing, "wrong passphrase").get();

    assert!(matches!(result, Err(TokenStoreError::Integrity { .. })));
}

/// **VALUE**: A modified record is detected.
///
/// **BUG THIS CATCHES**: Decrypting without checking the tag, which would hand a
/// corrupted credential to the upstream handshake.
#[test]
fn given_tampered_ciphertext_when_reading_then_integrity_error() {
    // GIVEN
    let backing = Arc::new(MemoryStore::new());
    let tokens = token_store(backing.clone(), PASSPHRASE);
    tokens.set(TEST_CREDENTIAL).unwrap();

    // WHEN: Flip one bit of the ciphertext
    let mut record = stored_record(&backing);
    let mut ciphertext = BASE64
        .decode(record["ciphertext"].as_str().unwrap())
        .unwrap();
    ciphertext[0] ^= 0x01;
    record["ciphertext"] = Value::String(BASE64.encode(&ciphertext));
    backing
        .set(CREDENTIAL_KEY, &record.to_string())
        .unwrap();

    // THEN
    assert!(matches!(
        tokens.get(),
        Err(TokenStoreError::Integrity { .. })
    ));
}

/// **VALUE**: A record that is not JSON is reported as a record error.
#[test]
fn given_corrupt_record_when_reading_then_record_error() {
    let backing = Arc::new(MemoryStore::new());
    backing.set(CREDENTIAL_KEY, "not json").unwrap();

    let result = token_store(backing, PASSPHRASE).get();

    assert!(matches!(result, Err(TokenStoreError::Record { .. })));
}

/// **VALUE**: Clearing removes the credential; clearing again is fine.
#[test]
fn given_stored_token_when_cleared_then_not_configured() {
    let backing = Arc::new(MemoryStore::new());
    let tokens = token_store(backing, PASSPHRASE);
    tokens.set(TEST_CREDENTIAL).unwrap();

    tokens.clear().unwrap();
    tokens.clear().unwrap();

    assert!(!tokens.is_configured().unwrap());
    assert!(matches!(
        tokens.get(),
        Err(TokenStoreError::NotConfigured { .. })
    ));
}

/// **VALUE**: Invalid tokens are refused before anything is written.
///
/// **BUG THIS CATCHES**: A placeholder from a sample config replacing a working
/// credential.
#[test]
fn given_invalid_token_when_storing_then_validation_error_and_previous_kept() {
    // GIVEN
    let backing = Arc::new(MemoryStore::new());
    let tokens = token_store(backing, PASSPHRASE);
    tokens.set(TEST_CREDENTIAL).unwrap();

    // WHEN
    let result = tokens.set("short");

    // THEN
    assert!(matches!(
        result,
        Err(TokenStoreError::Validation {
            reason: TokenFormatFailure::TooShort { .. },
            ..
        })
    ));
    assert_eq!(tokens.get().unwrap().as_str(), TEST_CREDENTIAL);
}

/// **VALUE**: Records keep the work factor they were sealed with.
#[test]
fn given_record_sealed_with_other_iterations_when_reading_then_decrypts() {
    let backing = Arc::new(MemoryStore::new());
    SecureTokenStore::new(backing.clone(), RedactedToken::new(PASSPHRASE.to_string()))
        .with_iterations(2_000)
        .set(TEST_CREDENTIAL)
        .unwrap();

    let reader = token_store(backing, PASSPHRASE);

    assert_eq!(reader.get().unwrap().as_str(), TEST_CREDENTIAL);
}
