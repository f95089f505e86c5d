use std::fmt;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("master key must be 32 bytes, hex or base64 encoded")]
    BadMasterKey,
    #[error("ciphertext is not valid base64")]
    BadEncoding,
    #[error("ciphertext too short")]
    TooShort,
    #[error("decryption failed")]
    Decrypt,
    #[error("decrypted secret is not utf-8")]
    NotUtf8,
}

/// Mask a secret for logs: keep only the last 4 characters.
pub fn mask_secret(cleartext: &str) -> String {
    let tail: String = cleartext
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

/// A decrypted credential, alive for exactly one upstream call. Debug and
/// Display only ever show the masked form.
pub struct UnsealedKey {
    cleartext: String,
    masked: String,
}

impl UnsealedKey {
    pub fn expose(&self) -> &str {
        &self.cleartext
    }

    pub fn masked(&self) -> &str {
        &self.masked
    }

    /// Replace any occurrence of the cleartext in `text` with the masked
    /// form. Applied to upstream error bodies before they are surfaced.
    pub fn sanitize(&self, text: &str) -> String {
        if self.cleartext.is_empty() {
            return text.to_string();
        }
        text.replace(&self.cleartext, &self.masked)
    }
}

impl fmt::Debug for UnsealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealedKey")
            .field("masked", &self.masked)
            .finish()
    }
}

impl fmt::Display for UnsealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked)
    }
}

/// AES-256-GCM unsealing of stored key ciphertexts. The master key lives in
/// process memory for the lifetime of the vault; ciphertexts are
/// base64(nonce || ct).
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    pub fn from_master_key(encoded: &str) -> Result<Self, VaultError> {
        let bytes = decode_master_key(encoded.trim())?;
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn unseal(&self, ciphertext_b64: &str) -> Result<UnsealedKey, VaultError> {
        let raw = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| VaultError::BadEncoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(VaultError::TooShort);
        }
        let (nonce, ct) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| VaultError::Decrypt)?;
        let cleartext = String::from_utf8(plain).map_err(|_| VaultError::NotUtf8)?;
        let masked = mask_secret(&cleartext);
        Ok(UnsealedKey { cleartext, masked })
    }

    /// Used by key-loading tooling and tests; dispatch never seals.
    pub fn seal(&self, cleartext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, cleartext.as_bytes())
            .map_err(|_| VaultError::Decrypt)?;
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ct);
        Ok(BASE64.encode(raw))
    }
}

fn decode_master_key(encoded: &str) -> Result<[u8; 32], VaultError> {
    if encoded.len() == 64
        && let Some(bytes) = decode_hex(encoded)
    {
        return Ok(bytes);
    }
    if let Ok(raw) = BASE64.decode(encoded)
        && raw.len() == 32
    {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        return Ok(bytes);
    }
    Err(VaultError::BadMasterKey)
}

fn decode_hex(encoded: &str) -> Option<[u8; 32]> {
    let mut bytes = [0u8; 32];
    for (i, chunk) in encoded.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        bytes[i] = ((high << 4) | low) as u8;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::from_master_key(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn seal_then_unseal_round_trips() {
        let vault = vault();
        let sealed = vault.seal("sk-test-1234").unwrap();
        let unsealed = vault.unseal(&sealed).unwrap();
        assert_eq!(unsealed.expose(), "sk-test-1234");
        assert_eq!(unsealed.masked(), "...1234");
    }

    #[test]
    fn debug_never_shows_cleartext() {
        let vault = vault();
        let sealed = vault.seal("sk-secret-abcd").unwrap();
        let unsealed = vault.unseal(&sealed).unwrap();
        let debug = format!("{unsealed:?}");
        assert!(!debug.contains("sk-secret-abcd"));
        assert!(debug.contains("...abcd"));
    }

    #[test]
    fn sanitize_strips_secret_from_error_bodies() {
        let vault = vault();
        let sealed = vault.seal("sk-leak-zzz9").unwrap();
        let unsealed = vault.unseal(&sealed).unwrap();
        let body = "invalid api key sk-leak-zzz9 for org";
        assert_eq!(
            unsealed.sanitize(body),
            "invalid api key ...zzz9 for org"
        );
    }

    #[test]
    fn master_key_accepts_hex_and_base64() {
        assert!(KeyVault::from_master_key(&"0f".repeat(32)).is_ok());
        let b64 = BASE64.encode([7u8; 32]);
        assert!(KeyVault::from_master_key(&b64).is_ok());
        assert!(KeyVault::from_master_key("short").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let vault = vault();
        let sealed = vault.seal("sk-x").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = BASE64.encode(raw);
        assert!(matches!(vault.unseal(&tampered), Err(VaultError::Decrypt)));
    }
}
