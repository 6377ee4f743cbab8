//! AES-256-GCM encryption with Argon2id key derivation.
//!
//! Key derivation: Argon2id(password, salt) → 32-byte key, with the memory,
//! iteration and lane costs supplied by the caller.  The reader must use the
//! same [`CostParams`] as the writer; they are not carried on the wire.
//!
//! Encrypted layout: [ salt (16 B) | nonce (12 B) | ciphertext | GCM tag (16 B) ]

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte length of the random salt prepended to every encrypted payload.
pub const SALT_LEN: usize = 16;
/// Byte length of the AES-GCM nonce following the salt.
pub const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostParams {
    /// Memory in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for CostParams {
    fn default() -> Self {
        Self { m_cost: 64 * 1024, t_cost: 3, p_cost: 1 }
    }
}

impl CostParams {
    /// Cheap parameters for tests and benchmarks.
    pub fn insecure_fast() -> Self {
        Self { m_cost: 8, t_cost: 1, p_cost: 1 }
    }
}

/// Password plus the cost parameters it is stretched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
    pub cost:     CostParams,
}

impl Credentials {
    pub fn new(password: impl Into<String>, cost: CostParams) -> Self {
        Self { password: password.into(), cost }
    }
}

/// Derive a 256-bit key from a password and salt using Argon2id.
pub fn derive_key(password: &str, salt: &[u8], cost: &CostParams) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(cost.m_cost, cost.t_cost, cost.p_cost, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under a key stretched from `password`.
///
/// Returns `salt (16 B) || nonce (12 B) || ciphertext || GCM-tag (16 B)`.
pub fn encrypt(plaintext: &[u8], password: &str, cost: &CostParams) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt, cost)?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`].
///
/// Returns `None` for a wrong password, corrupted data, or bad parameters;
/// decryption never raises.
pub fn decrypt(data: &[u8], password: &str, cost: &CostParams) -> Option<Vec<u8>> {
    if data.len() < SALT_LEN + NONCE_LEN {
        return None;
    }
    let key = derive_key(password, &data[..SALT_LEN], cost).ok()?;
    let cipher = Aes256Gcm::new_from_slice(&key).ok()?;
    let nonce = aes_gcm::Nonce::from_slice(&data[SALT_LEN..SALT_LEN + NONCE_LEN]);
    cipher.decrypt(nonce, &data[SALT_LEN + NONCE_LEN..]).ok()
}
