//! Authenticated-encryption wrapper over secret values and API tokens at rest (S2).
//!
//! Secrets are encrypted with AES-256-GCM under a single 32-byte key supplied
//! via configuration (base64-encoded). Format on disk/in the DB is
//! `base64(nonce(12) || ciphertext || tag)`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

const NONCE_SIZE: usize = 12;

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// `key_b64` must decode to exactly 32 bytes.
    pub fn new(key_b64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_b64)
            .context("vault key is not valid base64")?;
        if key.len() != 32 {
            bail!("vault key must decode to 32 bytes, got {}", key.len());
        }
        let cipher = Aes256Gcm::new_from_slice(&key).context("failed to initialize AES-256-GCM")?;
        Ok(Self { cipher })
    }

    /// Generate a fresh random 32-byte key, base64-encoded (for `ANDO_VAULT_KEY`).
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("secret encryption failed: {e:?}"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let data = BASE64.decode(encoded).context("invalid base64 ciphertext")?;
        if data.len() < NONCE_SIZE {
            bail!("ciphertext too short");
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("secret decryption failed: {e:?}"))?;
        String::from_utf8(plaintext).context("decrypted secret is not valid UTF-8")
    }
}

// ── API token hashing (HMAC-SHA256, constant-time compare) ────────────────

type HmacSha256 = Hmac<Sha256>;

/// A freshly generated bearer token and the metadata stored alongside it.
pub struct GeneratedToken {
    /// The full token, returned to the caller exactly once.
    pub token: String,
    pub prefix: String,
    pub token_hash: String,
}

/// Generate a new API token: `ando_<32 random hex chars>`.
pub fn generate_token(process_secret: &str) -> GeneratedToken {
    let mut raw = [0u8; 24];
    OsRng.fill_bytes(&mut raw);
    let token = format!("ando_{}", hex::encode(raw));
    let prefix = token.chars().take(12).collect::<String>();
    let token_hash = hash_token(&token, process_secret);
    GeneratedToken { token, prefix, token_hash }
}

pub fn hash_token(token: &str, process_secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(process_secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a presented token against a stored hash in constant time.
pub fn verify_token(presented: &str, process_secret: &str, stored_hash: &str) -> bool {
    let computed = hash_token(presented, process_secret);
    constant_time_eq(computed.as_bytes(), stored_hash.as_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = Vault::generate_key();
        let vault = Vault::new(&key).expect("vault init");
        let ciphertext = vault.encrypt("super-secret-value").expect("encrypt");
        assert_ne!(ciphertext, "super-secret-value");
        let plaintext = vault.decrypt(&ciphertext).expect("decrypt");
        assert_eq!(plaintext, "super-secret-value");
    }

    #[test]
    fn encrypt_is_nondeterministic() {
        let key = Vault::generate_key();
        let vault = Vault::new(&key).expect("vault init");
        let a = vault.encrypt("same plaintext").expect("encrypt a");
        let b = vault.encrypt("same plaintext").expect("encrypt b");
        assert_ne!(a, b, "nonce must be fresh per encryption");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let vault_a = Vault::new(&Vault::generate_key()).expect("vault a");
        let vault_b = Vault::new(&Vault::generate_key()).expect("vault b");
        let ciphertext = vault_a.encrypt("value").expect("encrypt");
        assert!(vault_b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn rejects_key_of_wrong_length() {
        let short_key = BASE64.encode([0u8; 16]);
        assert!(Vault::new(&short_key).is_err());
    }

    #[test]
    fn token_roundtrip_verifies() {
        let secret = "process-secret";
        let generated = generate_token(secret);
        assert!(generated.token.starts_with("ando_"));
        assert!(verify_token(&generated.token, secret, &generated.token_hash));
    }

    #[test]
    fn token_verification_rejects_tampered_token() {
        let secret = "process-secret";
        let generated = generate_token(secret);
        assert!(!verify_token("ando_deadbeef", secret, &generated.token_hash));
    }
}
