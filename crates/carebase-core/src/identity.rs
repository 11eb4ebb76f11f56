//! Identity derivation: turning a raw national identity number into a
//! one-way lookup key and a separately sealed recovery backup.
//!
//! The raw number only ever exists in-process during [`IdentityService::derive`]
//! and [`IdentityService::recover`]. Everything persisted is either the keyed
//! hash ([`IdentityKey`]) or the AES-256-GCM ciphertext ([`EncryptedBackup`]).

use std::{collections::BTreeMap, fmt};

use aes_gcm::{
  Aes256Gcm, Nonce,
  aead::{Aead, AeadCore, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{Error, Result, store::HealthStore};

type HmacSha256 = Hmac<Sha256>;

/// Digits in a normalised identity number.
pub const IDENTITY_NUMBER_LEN: usize = 12;

/// Minimum accepted length of the HMAC lookup key, in bytes.
pub const MIN_LOOKUP_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

// ─── Identity key ────────────────────────────────────────────────────────────

/// The irreversible identifier that replaces the raw identity number for all
/// internal joins: 64 lowercase hex characters of HMAC-SHA256 output.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityKey(String);

impl IdentityKey {
  /// Parse a previously issued key. Accepts upper-case hex and normalises it.
  pub fn parse(s: &str) -> Result<Self> {
    let lower = s.trim().to_ascii_lowercase();
    if lower.len() != 64 || !lower.bytes().all(|b| b.is_ascii_hexdigit()) {
      return Err(Error::Validation(
        "identity key must be 64 hexadecimal characters".into(),
      ));
    }
    Ok(Self(lower))
  }

  pub fn as_str(&self) -> &str { &self.0 }

  /// Short prefix that is safe to put in logs.
  pub fn prefix(&self) -> &str { &self.0[..8] }
}

impl fmt::Display for IdentityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Debug for IdentityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "IdentityKey({}…)", self.prefix())
  }
}

impl TryFrom<String> for IdentityKey {
  type Error = Error;

  fn try_from(s: String) -> Result<Self> { Self::parse(&s) }
}

impl From<IdentityKey> for String {
  fn from(k: IdentityKey) -> Self { k.0 }
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// The raw number sealed under a backup key. `sealed` is base64 of
/// `nonce || ciphertext || tag`; the identity key is bound as associated
/// data, so a backup cannot be replayed against another identity row.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBackup {
  pub key_id: String,
  pub sealed: String,
}

impl fmt::Debug for EncryptedBackup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EncryptedBackup")
      .field("key_id", &self.key_id)
      .finish_non_exhaustive()
  }
}

/// Output of [`IdentityService::derive`]. The caller persists the two halves
/// in separate tables.
#[derive(Debug, Clone)]
pub struct DerivedIdentity {
  pub identity_key: IdentityKey,
  pub backup:       EncryptedBackup,
}

/// A registered subject. Only the key is ever exposed; the backup lives in
/// its own table and is read back only for recovery and rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectIdentity {
  pub identity_key:  IdentityKey,
  pub registered_at: DateTime<Utc>,
}

// ─── Key material ────────────────────────────────────────────────────────────

/// Secret key material, loaded once at process start and passed explicitly
/// into [`IdentityService`]. Never logged.
#[derive(Clone)]
pub struct KeyMaterial {
  lookup_key:        Vec<u8>,
  backup_keys:       BTreeMap<String, [u8; 32]>,
  active_backup_key: String,
}

impl KeyMaterial {
  pub fn new(
    lookup_key: Vec<u8>,
    backup_keys: BTreeMap<String, [u8; 32]>,
    active_backup_key: impl Into<String>,
  ) -> Result<Self> {
    let active_backup_key = active_backup_key.into();
    if lookup_key.len() < MIN_LOOKUP_KEY_LEN {
      return Err(Error::KeyUnavailable(format!(
        "lookup key must be at least {MIN_LOOKUP_KEY_LEN} bytes"
      )));
    }
    if !backup_keys.contains_key(&active_backup_key) {
      return Err(Error::KeyUnavailable(format!(
        "active backup key {active_backup_key:?} is not in the keyring"
      )));
    }
    Ok(Self { lookup_key, backup_keys, active_backup_key })
  }

  /// Build from hex-encoded strings as they appear in configuration.
  pub fn from_hex(
    lookup_key: &str,
    backup_keys: &BTreeMap<String, String>,
    active_backup_key: &str,
  ) -> Result<Self> {
    let lookup = hex::decode(lookup_key.trim())
      .map_err(|e| Error::KeyUnavailable(format!("lookup key: {e}")))?;

    let mut ring = BTreeMap::new();
    for (id, encoded) in backup_keys {
      let bytes = hex::decode(encoded.trim())
        .map_err(|e| Error::KeyUnavailable(format!("backup key {id:?}: {e}")))?;
      let key: [u8; 32] = bytes.try_into().map_err(|_| {
        Error::KeyUnavailable(format!("backup key {id:?} must be 32 bytes"))
      })?;
      ring.insert(id.clone(), key);
    }

    Self::new(lookup, ring, active_backup_key)
  }

  pub fn active_backup_key(&self) -> &str { &self.active_backup_key }

  fn backup_key(&self, id: &str) -> Result<&[u8; 32]> {
    self
      .backup_keys
      .get(id)
      .ok_or_else(|| Error::KeyUnavailable(format!("backup key {id:?} is not loaded")))
  }
}

impl fmt::Debug for KeyMaterial {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyMaterial")
      .field("lookup_key", &"<redacted>")
      .field("backup_keys", &self.backup_keys.keys().collect::<Vec<_>>())
      .field("active_backup_key", &self.active_backup_key)
      .finish()
  }
}

// ─── Normalisation and validation ────────────────────────────────────────────

/// Strip whitespace and dash grouping from a raw number.
pub fn normalize(raw: &str) -> String {
  raw
    .chars()
    .filter(|c| !c.is_whitespace() && *c != '-')
    .collect()
}

/// Normalise and validate a raw identity number. Returns the normalised
/// digits. No cryptographic work happens before this succeeds.
pub fn validate(raw: &str) -> Result<String> {
  let digits = normalize(raw);
  if digits.len() != IDENTITY_NUMBER_LEN || !digits.bytes().all(|b| b.is_ascii_digit()) {
    return Err(Error::Validation(format!(
      "identity number must be exactly {IDENTITY_NUMBER_LEN} digits"
    )));
  }
  if digits.starts_with('0') || digits.starts_with('1') {
    return Err(Error::Validation(
      "identity number cannot start with 0 or 1".into(),
    ));
  }
  if !verhoeff_valid(&digits) {
    return Err(Error::Validation("identity number checksum mismatch".into()));
  }
  Ok(digits)
}

const VERHOEFF_D: [[u8; 10]; 10] = [
  [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
  [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
  [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
  [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
  [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
  [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
  [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
  [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
  [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
  [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];

const VERHOEFF_P: [[u8; 10]; 8] = [
  [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
  [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
  [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
  [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
  [9, 4, 5, 3, 1, 2, 6, 8, 7, 0],
  [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
  [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
  [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];

const VERHOEFF_INV: [u8; 10] = [0, 4, 3, 2, 1, 5, 6, 7, 8, 9];

fn verhoeff_fold(digits: &str, offset: usize) -> Option<u8> {
  let mut c = 0u8;
  for (i, ch) in digits.chars().rev().enumerate() {
    let d = ch.to_digit(10)? as usize;
    c = VERHOEFF_D[c as usize][VERHOEFF_P[(i + offset) % 8][d] as usize];
  }
  Some(c)
}

/// `true` if the last digit of `digits` is a valid Verhoeff check digit.
pub fn verhoeff_valid(digits: &str) -> bool {
  !digits.is_empty() && verhoeff_fold(digits, 0) == Some(0)
}

/// The Verhoeff check digit to append to `payload`. `None` if `payload`
/// contains a non-digit.
pub fn verhoeff_check_digit(payload: &str) -> Option<u8> {
  verhoeff_fold(payload, 1).map(|c| VERHOEFF_INV[c as usize])
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Derives identity keys and seals recovery backups with injected key
/// material. Holds no other state; cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct IdentityService {
  keys: KeyMaterial,
}

impl IdentityService {
  pub fn new(keys: KeyMaterial) -> Self { Self { keys } }

  pub fn active_backup_key(&self) -> &str { self.keys.active_backup_key() }

  /// `derive(raw) -> (identity_key, encrypted_backup)`.
  pub fn derive(&self, raw: &str) -> Result<DerivedIdentity> {
    let digits = validate(raw)?;
    let identity_key = self.key_for(&digits)?;
    let backup = self.seal(&identity_key, &digits, self.keys.active_backup_key())?;
    Ok(DerivedIdentity { identity_key, backup })
  }

  /// The identity key alone, for lookups by a caller that holds the raw
  /// number.
  pub fn identity_key(&self, raw: &str) -> Result<IdentityKey> {
    let digits = validate(raw)?;
    self.key_for(&digits)
  }

  /// Constant-time check that `raw` derives to `key`.
  pub fn verify(&self, raw: &str, key: &IdentityKey) -> bool {
    let (Ok(digits), Ok(expected)) = (validate(raw), hex::decode(key.as_str())) else {
      return false;
    };
    match self.mac() {
      Ok(mut mac) => {
        mac.update(digits.as_bytes());
        mac.verify_slice(&expected).is_ok()
      }
      Err(_) => false,
    }
  }

  /// Regulator-mandated recovery: decrypt a backup back to the raw digits.
  /// Fails unless the plaintext re-derives to `key`.
  pub fn recover(&self, key: &IdentityKey, backup: &EncryptedBackup) -> Result<String> {
    let digits = self.open(key, backup)?;
    if self.key_for(&digits)? != *key {
      return Err(Error::Crypto("recovered number does not match identity key".into()));
    }
    Ok(digits)
  }

  /// Re-seal a backup under the active backup key. A backup already sealed
  /// under the active key is returned unchanged.
  pub fn rotate(&self, key: &IdentityKey, backup: &EncryptedBackup) -> Result<EncryptedBackup> {
    if backup.key_id == self.keys.active_backup_key() {
      return Ok(backup.clone());
    }
    let digits = self.recover(key, backup)?;
    self.seal(key, &digits, self.keys.active_backup_key())
  }

  /// Derive and persist a new subject. Fails with `DuplicateIdentity` when
  /// the same person registers twice.
  pub async fn register<S: HealthStore>(
    &self,
    store: &S,
    raw: &str,
    now: DateTime<Utc>,
  ) -> Result<SubjectIdentity, S::Error> {
    let derived = self.derive(raw)?;
    let subject = store
      .register_identity(derived.identity_key, derived.backup, now)
      .await?;
    tracing::info!(identity = subject.identity_key.prefix(), "registered subject identity");
    Ok(subject)
  }

  fn mac(&self) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(&self.keys.lookup_key)
      .map_err(|e| Error::KeyUnavailable(format!("lookup key: {e}")))
  }

  fn key_for(&self, digits: &str) -> Result<IdentityKey> {
    let mut mac = self.mac()?;
    mac.update(digits.as_bytes());
    Ok(IdentityKey(hex::encode(mac.finalize().into_bytes())))
  }

  fn cipher(&self, key_id: &str) -> Result<Aes256Gcm> {
    let key = self.keys.backup_key(key_id)?;
    Aes256Gcm::new_from_slice(key)
      .map_err(|e| Error::KeyUnavailable(format!("backup key {key_id:?}: {e}")))
  }

  fn seal(&self, key: &IdentityKey, digits: &str, key_id: &str) -> Result<EncryptedBackup> {
    let cipher = self.cipher(key_id)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
      .encrypt(&nonce, Payload { msg: digits.as_bytes(), aad: key.as_str().as_bytes() })
      .map_err(|e| Error::Crypto(format!("seal failed: {e}")))?;

    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(EncryptedBackup { key_id: key_id.to_owned(), sealed: B64.encode(sealed) })
  }

  fn open(&self, key: &IdentityKey, backup: &EncryptedBackup) -> Result<String> {
    let cipher = self.cipher(&backup.key_id)?;
    let data = B64
      .decode(&backup.sealed)
      .map_err(|e| Error::Crypto(format!("backup is not base64: {e}")))?;
    if data.len() <= NONCE_LEN {
      return Err(Error::Crypto("backup is truncated".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let plaintext = cipher
      .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: key.as_str().as_bytes() })
      .map_err(|e| Error::Crypto(format!("open failed: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| Error::Crypto(e.to_string()))
  }
}
