// X25519 keypair generation for WireGuard peers.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

pub struct WgKeypair {
    pub private_key_b64: String,
    pub public_key_b64: String,
}

pub fn generate() -> WgKeypair {
    let private = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&private);
    WgKeypair {
        private_key_b64: STANDARD.encode(private.to_bytes()),
        public_key_b64: STANDARD.encode(public.to_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_keys() {
        let a = generate();
        let b = generate();
        assert_ne!(a.private_key_b64, b.private_key_b64);
        assert_ne!(a.public_key_b64, b.public_key_b64);
        assert_eq!(STANDARD.decode(&a.public_key_b64).unwrap().len(), 32);
    }
}
