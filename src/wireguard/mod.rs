// WireGuard peer adapter: remote `wg set` plumbing, deterministic address
// allocation, and client config rendering.
//
// Peer lifecycle decisions (whether a given user already has an active peer on a
// given server, whether a request is a rotation or a fresh provision) live in
// `entitlement::wireguard_service`, which composes this adapter with the store.
// This module only knows how to talk to one WireGuard box and how to turn a
// user id into the address it gets.

use crate::crypto::{key_vault::KeyVault, wg_keys};
use crate::error::{BrokerError, Result};
use crate::ssh::{SshAuth, SshClient, SshTarget};
use std::net::Ipv4Addr;

pub struct WireGuardAdapter {
    ssh: SshClient,
    vault: KeyVault,
    interface: String,
    network_cidr: String,
    server_public_key: String,
    endpoint: String,
    dns: String,
}

pub struct ProvisionedPeer {
    pub public_key: String,
    pub private_key_encrypted: String,
    pub address: Ipv4Addr,
}

impl WireGuardAdapter {
    pub fn new(cfg: &crate::config::WireGuardConfig) -> Result<Self> {
        let auth = match (&cfg.ssh_password, &cfg.ssh_private_key) {
            (_, Some(key)) => SshAuth::PrivateKeyBase64(key.clone()),
            (Some(password), None) => SshAuth::Password(password.clone()),
            (None, None) => {
                return Err(BrokerError::InvalidConfig(
                    "wireguard ssh auth: neither password nor private key configured".into(),
                ))
            }
        };
        let target = SshTarget {
            host: cfg.ssh_host.clone(),
            port: cfg.ssh_port,
            user: cfg.ssh_user.clone(),
            auth,
        };
        Ok(Self {
            ssh: SshClient::new(target),
            vault: KeyVault::new(&cfg.key_enc_secret)?,
            interface: cfg.interface.clone(),
            network_cidr: cfg.network_cidr.clone(),
            server_public_key: cfg.server_public_key.clone(),
            endpoint: cfg.endpoint.clone(),
            dns: cfg.dns.clone(),
        })
    }

    /// Starts from the deterministic host offset `(user_id % 60000) + 2` within
    /// the configured subnet (`.0`/`.1` reserved for the network and gateway)
    /// and scans forward for the next address `is_taken` reports free,
    /// wrapping within the subnet's host range. Collisions arise whenever two
    /// user ids land on the same offset modulo 60000.
    pub fn allocate_ip(&self, user_id: i64, is_taken: impl Fn(Ipv4Addr) -> Result<bool>) -> Result<Ipv4Addr> {
        let (network, prefix) = parse_cidr(&self.network_cidr)?;
        let base = u32::from(network);
        let capacity = host_capacity(prefix);
        let hash_span = capacity.min(60_000);
        let start = (user_id.rem_euclid(hash_span as i64)) as u32;

        for attempt in 0..capacity {
            let offset = 2 + (start + attempt) % capacity;
            let candidate = Ipv4Addr::from(base.wrapping_add(offset));
            if !is_taken(candidate)? {
                return Ok(candidate);
            }
        }
        Err(BrokerError::business("wireguard address space exhausted"))
    }

    /// Generates a fresh keypair for `user_id`, encrypting the private half at rest.
    pub fn provision_keys(&self, user_id: i64, is_taken: impl Fn(Ipv4Addr) -> Result<bool>) -> Result<ProvisionedPeer> {
        let keypair = wg_keys::generate();
        let address = self.allocate_ip(user_id, is_taken)?;
        let private_key_encrypted = self.vault.encrypt(&keypair.private_key_b64)?;
        Ok(ProvisionedPeer {
            public_key: keypair.public_key_b64,
            private_key_encrypted,
            address,
        })
    }

    pub async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let cmd = format!(
            "wg set {} peer {} allowed-ips {}/32",
            self.interface, public_key, address
        );
        self.ssh.run(&cmd).await?;
        Ok(())
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let cmd = format!("wg set {} peer {} remove", self.interface, public_key);
        self.ssh.run(&cmd).await?;
        Ok(())
    }

    /// Renders a client-side `wg-quick` config for a previously provisioned peer.
    /// `private_key_encrypted` is decrypted here, never logged or returned elsewhere.
    pub fn build_client_config(
        &self,
        private_key_encrypted: &str,
        address: Ipv4Addr,
    ) -> Result<String> {
        let private_key = self.vault.decrypt(private_key_encrypted)?;
        Ok(format!(
            "[Interface]\nPrivateKey = {private_key}\nAddress = {address}/32\nDNS = {dns}\n\n[Peer]\nPublicKey = {server_pub}\nEndpoint = {endpoint}\nAllowedIPs = 0.0.0.0/0, ::/0\nPersistentKeepalive = 25\n",
            dns = self.dns,
            server_pub = self.server_public_key,
            endpoint = self.endpoint,
        ))
    }
}

/// Usable host addresses in a subnet of the given prefix length, excluding
/// the network and broadcast addresses.
fn host_capacity(prefix: u8) -> u32 {
    let host_bits = 32u32.saturating_sub(prefix as u32);
    if host_bits >= 32 {
        u32::MAX - 1
    } else {
        (1u32 << host_bits).saturating_sub(2)
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| BrokerError::InvalidConfig(format!("invalid CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| BrokerError::InvalidConfig(format!("invalid CIDR address: {cidr}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| BrokerError::InvalidConfig(format!("invalid CIDR prefix: {cidr}")))?;
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireGuardConfig;

    fn cfg() -> WireGuardConfig {
        WireGuardConfig {
            ssh_host: "10.0.0.1".into(),
            ssh_port: 22,
            ssh_user: "root".into(),
            ssh_password: Some("pw".into()),
            ssh_private_key: None,
            interface: "wg0".into(),
            server_public_key: "serverpub".into(),
            endpoint: "10.0.0.1:51820".into(),
            network_cidr: "10.66.0.0/16".into(),
            dns: "1.1.1.1".into(),
            key_enc_secret: "test-secret".into(),
        }
    }

    #[test]
    fn allocates_deterministic_ip_for_known_user() {
        let adapter = WireGuardAdapter::new(&cfg()).unwrap();
        assert_eq!(
            adapter.allocate_ip(42, |_| Ok(false)).unwrap(),
            Ipv4Addr::new(10, 66, 0, 44)
        );
    }

    #[test]
    fn allocation_stays_within_slash_sixteen() {
        let adapter = WireGuardAdapter::new(&cfg()).unwrap();
        let ip = adapter.allocate_ip(59_999, |_| Ok(false)).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 66, 234, 97));
    }

    #[test]
    fn allocation_scans_past_a_collision() {
        let adapter = WireGuardAdapter::new(&cfg()).unwrap();
        let taken = Ipv4Addr::new(10, 66, 0, 44);
        let ip = adapter.allocate_ip(42, |candidate| Ok(candidate == taken)).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 66, 0, 45));
    }

    #[test]
    fn two_colliding_user_ids_resolve_to_distinct_ips() {
        let adapter = WireGuardAdapter::new(&cfg()).unwrap();
        let assigned = std::cell::RefCell::new(Vec::<Ipv4Addr>::new());
        let first = adapter
            .allocate_ip(42, |ip| Ok(assigned.borrow().contains(&ip)))
            .unwrap();
        assigned.borrow_mut().push(first);
        let second = adapter
            .allocate_ip(42 + 60_000, |ip| Ok(assigned.borrow().contains(&ip)))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn client_config_embeds_decrypted_key_and_address() {
        let adapter = WireGuardAdapter::new(&cfg()).unwrap();
        let peer = adapter.provision_keys(42, |_| Ok(false)).unwrap();
        let rendered = adapter
            .build_client_config(&peer.private_key_encrypted, peer.address)
            .unwrap();
        assert!(rendered.contains("Address = 10.66.0.44/32"));
        assert!(rendered.contains("PublicKey = serverpub"));
        assert!(!rendered.contains(&peer.private_key_encrypted));
    }
}
