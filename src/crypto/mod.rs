/// Envelope encryption of stored WireGuard private keys.
pub mod key_vault;

/// X25519 keypair generation for WireGuard peers.
pub mod wg_keys;
