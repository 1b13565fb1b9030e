//! Authenticated encryption and content checksums for vault records.
//!
//! Two AEAD ciphers are supported and selected by the active profile's
//! encryption strength:
//!
//! - `xchacha20-poly1305`: 24-byte IV, the `maximum` tier.
//! - `aes-256-gcm`: 12-byte IV, the `standard` tier.
//!
//! Both use a 32-byte key and a 16-byte tag. The tag is detached from the
//! ciphertext and stored next to it, so a record carries
//! `{ciphertext, iv, authTag, algorithm}`. Decryption dispatches on the
//! stored algorithm id, so switching tiers never strands older records.

use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use argon2::{Argon2, Params};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 32;

const KEY_CHECK_PLAINTEXT: &[u8] = b"vault-sync key check v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::XChaCha20Poly1305 => "xchacha20-poly1305",
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlgorithm::XChaCha20Poly1305 => 24,
            CipherAlgorithm::Aes256Gcm => 12,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xchacha20-poly1305" => Ok(CipherAlgorithm::XChaCha20Poly1305),
            "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            other => Err(VaultError::EncryptionFailure(format!(
                "unsupported algorithm {other}"
            ))),
        }
    }
}

/// Ciphertext plus everything needed to authenticate and decrypt it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    pub algorithm: CipherAlgorithm,
}

/// 32 bytes of key material, wiped on drop.
#[derive(Clone)]
pub struct VaultKey(Zeroizing<[u8; KEY_LEN]>);

impl VaultKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        VaultKey(Zeroizing::new(bytes))
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let raw = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| VaultError::KeyLoss(format!("key is not valid hex: {e}")))?,
        );
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            VaultError::KeyLoss(format!("key must be {KEY_LEN} bytes, got {}", raw.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Argon2id over `password` with the vault's stored salt.
    pub fn derive(password: &str, salt: &[u8]) -> Result<Self> {
        let params = Params::new(KDF_MEMORY_COST, KDF_TIME_COST, KDF_PARALLELISM, Some(KEY_LEN))
            .map_err(|e| VaultError::KeyLoss(format!("argon2 params: {e}")))?;
        let argon = Argon2::from(params);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon
            .hash_password_into(password.as_bytes(), salt, &mut key[..])
            .map_err(|e| VaultError::KeyLoss(format!("argon2 derive: {e}")))?;
        Ok(VaultKey(key))
    }

    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        VaultKey(key)
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.0[..]))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

pub fn generate_iv(algorithm: CipherAlgorithm) -> Vec<u8> {
    let mut iv = vec![0u8; algorithm.iv_len()];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn encrypt(
    key: &VaultKey,
    algorithm: CipherAlgorithm,
    plaintext: &[u8],
) -> Result<EncryptedPayload> {
    let iv = generate_iv(algorithm);
    let mut sealed = match algorithm {
        CipherAlgorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| VaultError::EncryptionFailure(e.to_string()))?;
            cipher.encrypt(chacha20poly1305::XNonce::from_slice(&iv), plaintext)
        }
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| VaultError::EncryptionFailure(e.to_string()))?;
            cipher.encrypt(aes_gcm::Nonce::from_slice(&iv), plaintext)
        }
    }
    .map_err(|e| VaultError::EncryptionFailure(e.to_string()))?;

    if sealed.len() < TAG_LEN {
        return Err(VaultError::EncryptionFailure("sealed output too short".into()));
    }
    let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok(EncryptedPayload {
        ciphertext: sealed,
        iv,
        auth_tag,
        algorithm,
    })
}

/// Fails closed: any malformed field or tag mismatch is `DecryptionFailure`.
pub fn decrypt(key: &VaultKey, payload: &EncryptedPayload) -> Result<Zeroizing<Vec<u8>>> {
    if payload.iv.len() != payload.algorithm.iv_len() || payload.auth_tag.len() != TAG_LEN {
        return Err(VaultError::DecryptionFailure);
    }
    let mut sealed = Vec::with_capacity(payload.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&payload.ciphertext);
    sealed.extend_from_slice(&payload.auth_tag);

    let plaintext = match payload.algorithm {
        CipherAlgorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|_| VaultError::DecryptionFailure)?;
            cipher.decrypt(chacha20poly1305::XNonce::from_slice(&payload.iv), sealed.as_slice())
        }
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|_| VaultError::DecryptionFailure)?;
            cipher.decrypt(aes_gcm::Nonce::from_slice(&payload.iv), sealed.as_slice())
        }
    }
    .map_err(|_| VaultError::DecryptionFailure)?;
    Ok(Zeroizing::new(plaintext))
}

/// Rebuild `value` with every object's keys in sorted order.
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

pub fn canonical_bytes(value: &serde_json::Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

/// Hex SHA-256 of the canonical serialization of `value`.
pub fn checksum(value: &serde_json::Value) -> Result<String> {
    let bytes = canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Key holder shared by the store and the bundle service.
#[derive(Debug)]
pub struct CryptoCodec {
    key: VaultKey,
    algorithm: RwLock<CipherAlgorithm>,
}

impl CryptoCodec {
    pub fn new(key: VaultKey, algorithm: CipherAlgorithm) -> Self {
        Self {
            key,
            algorithm: RwLock::new(algorithm),
        }
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        *self.algorithm.read()
    }

    pub fn set_algorithm(&self, algorithm: CipherAlgorithm) {
        *self.algorithm.write() = algorithm;
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        encrypt(&self.key, self.algorithm(), plaintext)
    }

    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Zeroizing<Vec<u8>>> {
        decrypt(&self.key, payload)
    }

    pub fn encrypt_value(&self, value: &serde_json::Value) -> Result<EncryptedPayload> {
        let plaintext = Zeroizing::new(canonical_bytes(value)?);
        self.encrypt(&plaintext)
    }

    pub fn decrypt_value(&self, payload: &EncryptedPayload) -> Result<serde_json::Value> {
        let plaintext = self.decrypt(payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub fn checksum(&self, value: &serde_json::Value) -> Result<String> {
        checksum(value)
    }

    pub fn seal_key_check(&self) -> Result<EncryptedPayload> {
        self.encrypt(KEY_CHECK_PLAINTEXT)
    }

    pub fn verify_key_check(&self, sealed: &EncryptedPayload) -> Result<()> {
        match self.decrypt(sealed) {
            Ok(plain) if plain.as_slice() == KEY_CHECK_PLAINTEXT => Ok(()),
            _ => Err(VaultError::KeyLoss(
                "supplied key cannot open this vault".into(),
            )),
        }
    }
}

mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec(algorithm: CipherAlgorithm) -> CryptoCodec {
        CryptoCodec::new(VaultKey::generate(), algorithm)
    }

    #[test]
    fn roundtrip_both_algorithms() {
        for alg in [CipherAlgorithm::XChaCha20Poly1305, CipherAlgorithm::Aes256Gcm] {
            let codec = codec(alg);
            let value = json!({"health": 100, "inventory": ["sword", "map"], "pos": {"x": 1.5}});
            let sealed = codec.encrypt_value(&value).unwrap();
            assert_eq!(sealed.algorithm, alg);
            assert_eq!(sealed.iv.len(), alg.iv_len());
            assert_eq!(sealed.auth_tag.len(), TAG_LEN);
            assert_eq!(codec.decrypt_value(&sealed).unwrap(), value);
        }
    }

    #[test]
    fn fresh_iv_per_call() {
        let codec = codec(CipherAlgorithm::XChaCha20Poly1305);
        let a = codec.encrypt(b"same").unwrap();
        let b = codec.encrypt(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_tag_fails_closed() {
        let codec = codec(CipherAlgorithm::Aes256Gcm);
        let mut sealed = codec.encrypt(b"secret state").unwrap();
        sealed.auth_tag[0] ^= 0xff;
        assert!(matches!(codec.decrypt(&sealed), Err(VaultError::DecryptionFailure)));
    }

    #[test]
    fn truncated_ciphertext_and_bad_iv_fail_closed() {
        let codec = codec(CipherAlgorithm::XChaCha20Poly1305);
        let sealed = codec.encrypt(b"secret state").unwrap();

        let mut truncated = sealed.clone();
        truncated.ciphertext.pop();
        assert!(matches!(codec.decrypt(&truncated), Err(VaultError::DecryptionFailure)));

        let mut short_iv = sealed;
        short_iv.iv.truncate(12);
        assert!(matches!(codec.decrypt(&short_iv), Err(VaultError::DecryptionFailure)));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = codec(CipherAlgorithm::XChaCha20Poly1305)
            .encrypt(b"secret")
            .unwrap();
        let other = codec(CipherAlgorithm::XChaCha20Poly1305);
        assert!(matches!(other.decrypt(&sealed), Err(VaultError::DecryptionFailure)));
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 2, "a": {"z": [1, 2], "y": null}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"y": null, "z": [1, 2]}, "b": 2}"#).unwrap();
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
        assert_ne!(checksum(&a).unwrap(), checksum(&json!({"b": 3})).unwrap());
    }

    #[test]
    fn checksum_is_stable_across_runs() {
        // Pinned digest so a change in canonical form shows up as a failure.
        let digest = checksum(&json!({"health": 100})).unwrap();
        assert_eq!(
            digest,
            hex::encode(Sha256::digest(br#"{"health":100}"#))
        );
    }

    #[test]
    fn key_check_rejects_foreign_key() {
        let owner = codec(CipherAlgorithm::XChaCha20Poly1305);
        let sealed = owner.seal_key_check().unwrap();
        owner.verify_key_check(&sealed).unwrap();
        let stranger = codec(CipherAlgorithm::XChaCha20Poly1305);
        assert!(matches!(
            stranger.verify_key_check(&sealed),
            Err(VaultError::KeyLoss(_))
        ));
    }

    #[test]
    fn hex_key_parsing() {
        let key = VaultKey::generate();
        let parsed = VaultKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
        assert!(matches!(VaultKey::from_hex("abcd"), Err(VaultError::KeyLoss(_))));
        assert!(matches!(VaultKey::from_hex("zz"), Err(VaultError::KeyLoss(_))));
    }

    #[test]
    fn encrypted_payload_json_shape() {
        let sealed = codec(CipherAlgorithm::Aes256Gcm).encrypt(b"x").unwrap();
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["algorithm"], "aes-256-gcm");
        assert!(json["authTag"].is_string());
        let back: EncryptedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }
}
