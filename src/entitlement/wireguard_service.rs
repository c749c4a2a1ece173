// `ensure_peer` / `rotate_peer` / `revoke_peers` / `build_client_config`.
//
// Unlike the original's MVP shortcut (always mint a fresh peer), `ensure_peer`
// here is idempotent: it looks for an existing active row before generating
// new key material, so retried calls never orphan peers on the remote
// interface.

use crate::clock::utcnow;
use crate::error::Result;
use crate::store::models::VpnPeer;
use crate::store::Store;
use crate::wireguard::WireGuardAdapter;

pub struct WireGuardEntitlementService {
    store: Store,
    adapter: WireGuardAdapter,
}

impl WireGuardEntitlementService {
    pub fn new(store: Store, adapter: WireGuardAdapter) -> Self {
        Self { store, adapter }
    }

    /// Returns the user's current active peer, provisioning one on first call.
    pub async fn ensure_peer(&self, tg_id: i64) -> Result<VpnPeer> {
        if let Some(existing) = self.store.get_active_peer(tg_id, None)? {
            return Ok(existing);
        }
        self.provision(tg_id).await
    }

    /// Always provisions a new peer and revokes every previous one for this
    /// user in the same transaction, so no reader ever observes two active
    /// peers at once.
    pub async fn rotate_peer(&self, tg_id: i64, reason: &str) -> Result<VpnPeer> {
        let peer = self.provision(tg_id).await?;
        let now = utcnow();
        let stale: Vec<_> = self
            .store
            .deactivate_peers(tg_id, None, reason, now)?
            .into_iter()
            .filter(|p| p.id != peer.id)
            .collect();
        for p in stale {
            if let Err(e) = self.adapter.remove_peer(&p.client_public_key).await {
                tracing::warn!(tg_id, public_key = %p.client_public_key, error = %e, "best-effort remote peer removal failed");
            }
        }
        Ok(peer)
    }

    async fn provision(&self, tg_id: i64) -> Result<VpnPeer> {
        let provisioned = self
            .adapter
            .provision_keys(tg_id, |ip| self.store.is_ip_active(&ip.to_string(), None))?;
        self.adapter
            .add_peer(&provisioned.public_key, provisioned.address)
            .await?;
        self.store.insert_peer(
            tg_id,
            &provisioned.public_key,
            &provisioned.private_key_encrypted,
            &provisioned.address.to_string(),
            None,
            utcnow(),
        )
    }

    /// Marks active peers revoked in the store; remote removal is best-effort
    /// and never fails the operation — the row is the source of truth and the
    /// remote list converges on the next `ensure_peer` or reconciliation pass.
    pub async fn revoke_peers(&self, tg_id: i64, reason: &str) -> Result<()> {
        let revoked = self.store.deactivate_peers(tg_id, None, reason, utcnow())?;
        for peer in revoked {
            if let Err(e) = self.adapter.remove_peer(&peer.client_public_key).await {
                tracing::warn!(tg_id, public_key = %peer.client_public_key, error = %e, "best-effort remote peer removal failed");
            }
        }
        Ok(())
    }

    pub fn build_client_config(&self, peer: &VpnPeer) -> Result<String> {
        let address = peer
            .client_ip
            .parse()
            .map_err(|_| crate::error::BrokerError::business("peer has an invalid stored IP"))?;
        self.adapter.build_client_config(&peer.client_private_key_enc, address)
    }
}
