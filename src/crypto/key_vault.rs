// Symmetric encryption of stored WireGuard private keys.
//
// The original service derived a Fernet key via HKDF from an operator-supplied
// secret. Fernet itself is out of reach of this crate's stack; ChaCha20-Poly1305
// (already used elsewhere in this codebase for AEAD) plays the same role, keyed
// by the same HKDF-SHA-256 derivation the spec calls for.

use crate::error::{BrokerError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

const SALT: &[u8] = b"sbs-vpn-key-v1";
const INFO: &[u8] = b"vpn-private-key";
const NONCE_LEN: usize = 12;

pub struct KeyVault {
    cipher: ChaCha20Poly1305,
}

impl KeyVault {
    pub fn new(secret: &str) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(SALT), secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(INFO, &mut key)
            .map_err(|_| BrokerError::InvalidConfig("vpn key secret too short".into()))?;
        let cipher = ChaCha20Poly1305::new((&key).into());
        key.zeroize();
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext`, returning a base64 blob of `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| BrokerError::InvalidConfig("key vault encryption failed".into()))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ct);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let raw = STANDARD
            .decode(blob)
            .map_err(|e| BrokerError::InvalidConfig(format!("malformed key vault blob: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(BrokerError::InvalidConfig("key vault blob too short".into()));
        }
        let (nonce_bytes, ct) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let pt = self
            .cipher
            .decrypt(nonce, ct)
            .map_err(|_| BrokerError::InvalidConfig("key vault decryption failed".into()))?;
        String::from_utf8(pt)
            .map_err(|e| BrokerError::InvalidConfig(format!("key vault blob not utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let vault = KeyVault::new("test-secret").unwrap();
        let enc = vault.encrypt("super-secret-private-key").unwrap();
        assert_ne!(enc, "super-secret-private-key");
        assert_eq!(vault.decrypt(&enc).unwrap(), "super-secret-private-key");
    }

    #[test]
    fn different_secrets_cannot_decrypt_each_other() {
        let a = KeyVault::new("secret-a").unwrap();
        let b = KeyVault::new("secret-b").unwrap();
        let enc = a.encrypt("payload").unwrap();
        assert!(b.decrypt(&enc).is_err());
    }
}
