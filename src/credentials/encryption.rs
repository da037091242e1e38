//! AES-256-GCM sealing of vault records.
//!
//! A sealed record is `base64(nonce || ciphertext)`, so the nonce always
//! travels with the data it protects.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Decodes a base64 vault key and checks it is 256 bits.
pub fn parse_key(key_base64: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 vault key")?;

    bytes.as_slice().try_into().map_err(|_| {
        anyhow!(
            "Vault key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            bytes.len()
        )
    })
}

/// Encrypts `plaintext` under a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

/// Reverses [`seal`]. Fails on a wrong key or any tampering.
pub fn open(sealed: &str, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
    let bytes = BASE64.decode(sealed).context("Failed to decode sealed record")?;
    if bytes.len() <= NONCE_SIZE {
        return Err(anyhow!("Sealed record is too short"));
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert!(parse_key(&BASE64.encode([7u8; 32])).is_ok());
        assert!(parse_key(&BASE64.encode([7u8; 16])).is_err());
        assert!(parse_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_seal_and_open() {
        let key = [3u8; 32];
        let sealed = seal(b"refresh-token", &key).unwrap();

        assert!(!sealed.contains("refresh-token"));
        assert_eq!(open(&sealed, &key).unwrap(), b"refresh-token");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let key = [3u8; 32];
        assert_ne!(seal(b"same", &key).unwrap(), seal(b"same", &key).unwrap());
    }

    #[test]
    fn test_wrong_key_and_tampering_fail() {
        let sealed = seal(b"secret", &[1u8; 32]).unwrap();
        assert!(open(&sealed, &[2u8; 32]).is_err());

        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(open(&BASE64.encode(bytes), &[1u8; 32]).is_err());

        assert!(open(&BASE64.encode([0u8; 4]), &[1u8; 32]).is_err());
    }
}
