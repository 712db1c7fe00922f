//! Key handling and authenticated encryption.
//!
//! - A [`MasterKey`] is supplied by the key-management collaborator through [`KeyProvider`].
//! - Data keys are derived from it with Argon2id. Document keys are salted with the owning
//!   patient's id; the audit key uses a fixed domain-separation salt.
//! - Payloads are sealed with AES-256-GCM using a fresh random 96-bit nonce per operation. The
//!   nonce and tag are returned separately from the ciphertext so they can be stored apart.
//!
//! Key types zeroize on drop and never print their bytes.

use crate::config::KdfSettings;
use crate::{CoreError, CoreResult};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Root key from which every data key is derived.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a standard-alphabet base64 key of exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> CoreResult<Self> {
        let mut decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CoreError::Crypto(format!("master key is not valid base64: {e}")))?;
        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CoreError::Crypto(format!(
                "master key must be {KEY_LEN} bytes, got {len}"
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(key))
    }

    /// A fresh random key, base64 encoded. Used by operators to provision a deployment.
    pub fn generate_base64() -> String {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let encoded = general_purpose::STANDARD.encode(bytes);
        bytes.zeroize();
        encoded
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("size_bytes", &KEY_LEN)
            .finish_non_exhaustive()
    }
}

/// Supplies the master key. Backed by a KMS in production.
pub trait KeyProvider: Send + Sync + std::fmt::Debug {
    fn master_key(&self) -> CoreResult<MasterKey>;
}

/// Holds a key resolved at startup.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: MasterKey,
}

impl StaticKeyProvider {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn master_key(&self) -> CoreResult<MasterKey> {
        Ok(self.key.clone())
    }
}

/// Symmetric key derived for one patient (or for the audit trail).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// Derives data keys from the master key with Argon2id.
#[derive(Debug, Clone, Copy)]
pub struct KeyDeriver {
    settings: KdfSettings,
}

impl KeyDeriver {
    pub fn new(settings: KdfSettings) -> Self {
        Self { settings }
    }

    /// Derive the 256-bit key for `salt`. Argon2 requires salts of at least 8 bytes.
    pub fn derive(&self, master: &MasterKey, salt: &[u8]) -> CoreResult<DataKey> {
        let params = Params::new(
            self.settings.memory_kib,
            self.settings.iterations,
            self.settings.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CoreError::Crypto(format!("invalid Argon2 params: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; KEY_LEN];
        argon2
            .hash_password_into(master.as_bytes(), salt, &mut out)
            .map_err(|e| CoreError::Crypto(format!("key derivation failed: {e}")))?;
        Ok(DataKey(out))
    }
}

/// Output of [`seal`]: ciphertext with its nonce and tag kept apart.
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` with AES-256-GCM, binding `aad` into the tag.
pub fn seal(key: &DataKey, plaintext: &[u8], aad: &[u8]) -> CoreResult<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CoreError::Crypto(format!("invalid key: {e}")))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| CoreError::Crypto("encryption failed".into()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate. Any tampering with ciphertext, nonce, tag or `aad` fails.
pub fn open(
    key: &DataKey,
    ciphertext: &[u8],
    nonce: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> CoreResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(CoreError::Crypto("malformed nonce or tag".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CoreError::Crypto(format!("invalid key: {e}")))?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CoreError::Crypto("decryption failed: authentication tag mismatch".into()))?;
    Ok(buffer)
}

/// Base64 form of a sealed payload, for embedding in YAML/JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub nonce: String,
    pub tag: String,
    pub ciphertext: String,
}

impl SealedEnvelope {
    pub fn from_sealed(sealed: &Sealed) -> Self {
        Self {
            nonce: general_purpose::STANDARD.encode(sealed.nonce),
            tag: general_purpose::STANDARD.encode(sealed.tag),
            ciphertext: general_purpose::STANDARD.encode(&sealed.ciphertext),
        }
    }

    pub fn open(&self, key: &DataKey, aad: &[u8]) -> CoreResult<Vec<u8>> {
        let nonce = decode_b64("nonce", &self.nonce)?;
        let tag = decode_b64("tag", &self.tag)?;
        let ciphertext = decode_b64("ciphertext", &self.ciphertext)?;
        open(key, &ciphertext, &nonce, &tag, aad)
    }
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode_b64(what: &str, value: &str) -> CoreResult<Vec<u8>> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|e| CoreError::Crypto(format!("{what} is not valid base64: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Cheap Argon2 parameters so tests do not spend seconds deriving keys.
    pub(crate) fn fast_kdf() -> KdfSettings {
        KdfSettings {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    pub(crate) fn test_master_key() -> MasterKey {
        MasterKey::from_bytes([7u8; KEY_LEN])
    }

    #[test]
    fn test_seal_open_with_aad() {
        let key = KeyDeriver::new(fast_kdf())
            .derive(&test_master_key(), b"550e8400e29b41d4a716446655440000")
            .unwrap();
        let sealed = seal(&key, b"clinical note", b"doc:v1").unwrap();

        assert_ne!(sealed.ciphertext, b"clinical note");
        let plain = open(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag, b"doc:v1").unwrap();
        assert_eq!(plain, b"clinical note");
    }

    #[test]
    fn test_open_rejects_wrong_aad_and_tampering() {
        let key = KeyDeriver::new(fast_kdf())
            .derive(&test_master_key(), b"some-patient-salt")
            .unwrap();
        let sealed = seal(&key, b"payload", b"a").unwrap();

        assert!(open(&key, &sealed.ciphertext, &sealed.nonce, &sealed.tag, b"b").is_err());

        let mut tampered = sealed.ciphertext.clone();
        tampered[0] ^= 0x01;
        assert!(open(&key, &tampered, &sealed.nonce, &sealed.tag, b"a").is_err());
    }

    #[test]
    fn test_distinct_salts_give_distinct_keys() {
        let deriver = KeyDeriver::new(fast_kdf());
        let a = deriver.derive(&test_master_key(), b"patient-aaaaaaaa").unwrap();
        let b = deriver.derive(&test_master_key(), b"patient-bbbbbbbb").unwrap();

        let sealed = seal(&a, b"x", b"").unwrap();
        assert!(open(&b, &sealed.ciphertext, &sealed.nonce, &sealed.tag, b"").is_err());
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = KeyDeriver::new(fast_kdf())
            .derive(&test_master_key(), b"patient-aaaaaaaa")
            .unwrap();
        let first = seal(&key, b"same", b"").unwrap();
        let second = seal(&key, b"same", b"").unwrap();
        assert_ne!(first.nonce, second.nonce);
    }

    #[test]
    fn test_master_key_base64_and_debug() {
        let encoded = MasterKey::generate_base64();
        let key = MasterKey::from_base64(&encoded).unwrap();
        assert!(!format!("{key:?}").contains(&encoded));

        assert!(MasterKey::from_base64("c2hvcnQ=").is_err());
        assert!(MasterKey::from_base64("***").is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let key = KeyDeriver::new(fast_kdf())
            .derive(&test_master_key(), b"medvault/audit-log/v1")
            .unwrap();
        let sealed = seal(&key, br#"{"before":null}"#, b"entry").unwrap();
        let envelope = SealedEnvelope::from_sealed(&sealed);

        assert_eq!(envelope.open(&key, b"entry").unwrap(), br#"{"before":null}"#);
    }
}
