// `ensure_client` / `revoke_client` for the region-VPN (VLESS+Reality) side.
// Device-exclusivity enforcement (`apply_enabled_map` / `apply_active_ip_map`)
// is driven by the session arbiter, not here — this module only owns
// provisioning, matching the original's split between `RegionVpnService`
// (CRUD) and `guard.py` (enforcement loop).

use crate::error::Result;
use crate::xray::XrayAdapter;

pub struct RegionEntitlementService {
    adapter: XrayAdapter,
}

pub struct ClientHandle {
    pub share_url: String,
}

impl RegionEntitlementService {
    pub fn new(adapter: XrayAdapter) -> Self {
        Self { adapter }
    }

    pub async fn ensure_client(&self, tg_id: i64) -> Result<ClientHandle> {
        let provisioned = self.adapter.ensure_client(tg_id).await?;
        Ok(ClientHandle { share_url: provisioned.share_url })
    }

    pub async fn revoke_client(&self, tg_id: i64) -> Result<()> {
        self.adapter.revoke_client(tg_id).await
    }

    pub async fn list_clients(&self) -> Result<Vec<String>> {
        self.adapter.list_clients().await
    }
}
