// Cooperative single-leader scheduler core.
//
// Mirrors the teacher's `SessionArbiter::run` shutdown-signal shape: a plain
// `tokio::select!` loop that sleeps for a fixed period, wakes, tries the
// advisory lock, and either skips the tick (lock held elsewhere) or runs the
// full job set in order. A job that returns an error is logged and never
// aborts the loop or blocks later jobs in the same tick.

use crate::clock::utcnow;
use crate::entitlement::{RegionEntitlementService, WireGuardEntitlementService};
use crate::error::Result;
use crate::notifications::NotificationDispatcher;
use crate::referrals::ReferralLedger;
use crate::store::Store;
use chrono::Duration;
use std::time::Duration as StdDuration;
use tokio::sync::watch;

pub const SCHEDULER_LOCK_KEY: i64 = 947_382_611;
const LEASE_SECONDS: i64 = 60;
const REGION_PRUNE_GRACE_HOURS: i64 = 24;

/// Yandex family-membership rotation sits outside this crate's ownership
/// (§3: the core only reads `coverage_end_at`/`removed_at`/dedup flags). The
/// scheduler still calls a collaborator at the right point in the job order
/// so wiring a real implementation later is a one-line swap.
#[async_trait::async_trait]
pub trait YandexMembershipRotator: Send + Sync {
    async fn rotate_due_memberships(&self, now: chrono::DateTime<chrono::Utc>) -> Result<u64>;
}

pub struct NoopYandexMembershipRotator;

#[async_trait::async_trait]
impl YandexMembershipRotator for NoopYandexMembershipRotator {
    async fn rotate_due_memberships(&self, _now: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        tracing::debug!("yandex membership rotation is not owned by this crate; skipping");
        Ok(0)
    }
}

pub struct Scheduler {
    store: Store,
    wireguard: WireGuardEntitlementService,
    region: RegionEntitlementService,
    referrals: ReferralLedger,
    notifications: NotificationDispatcher,
    yandex: Box<dyn YandexMembershipRotator>,
    holder_id: String,
}

impl Scheduler {
    pub fn new(
        store: Store,
        wireguard: WireGuardEntitlementService,
        region: RegionEntitlementService,
        referrals: ReferralLedger,
        notifications: NotificationDispatcher,
        yandex: impl YandexMembershipRotator + 'static,
        holder_id: String,
    ) -> Self {
        Self {
            store,
            wireguard,
            region,
            referrals,
            notifications,
            yandex: Box::new(yandex),
            holder_id,
        }
    }

    pub async fn run(self, period: StdDuration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    }

    pub async fn tick(&self) -> Result<()> {
        let now = utcnow();
        if !self.store.try_acquire_lock(SCHEDULER_LOCK_KEY, &self.holder_id, LEASE_SECONDS, now)? {
            return Ok(());
        }

        if let Err(e) = self.expire_subscriptions(now).await {
            tracing::error!(error = %e, "expire-subscriptions job failed");
        }
        if let Err(e) = self.prune_region_clients(now).await {
            tracing::error!(error = %e, "prune-region-clients job failed");
        }
        if let Err(e) = self.yandex.rotate_due_memberships(now).await {
            tracing::error!(error = %e, "yandex membership rotation failed");
        }
        if let Err(e) = self.notifications.run_coverage_reminders(now).await {
            tracing::error!(error = %e, "coverage-reminders job failed");
        }
        if let Err(e) = self.referrals.release_due_earnings(now) {
            tracing::error!(error = %e, "release-due-earnings job failed");
        }
        if let Err(e) = self.notifications.run_daily_kick_report(now, false).await {
            tracing::error!(error = %e, "daily-kick-report job failed");
        }

        self.store.release_lock(SCHEDULER_LOCK_KEY, &self.holder_id)?;
        Ok(())
    }

    /// Job 1: flips expired subscriptions inactive, best-effort revokes
    /// WireGuard peers and the region-VPN client, and fires a notice. A
    /// failure revoking one user's resources never stops the sweep.
    async fn expire_subscriptions(&self, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let expired = self.store.list_expired_subscriptions(now)?;
        for sub in expired {
            self.store.set_subscription_expired(sub.tg_id)?;

            if let Err(e) = self.wireguard.revoke_peers(sub.tg_id, "subscription expired").await {
                tracing::warn!(tg_id = sub.tg_id, error = %e, "failed to revoke wireguard peers on expiry");
            }
            if let Err(e) = self.region.revoke_client(sub.tg_id).await {
                tracing::warn!(tg_id = sub.tg_id, error = %e, "failed to revoke region-vpn client on expiry");
            }
            self.notifications.notify_expired(sub.tg_id).await;
        }
        Ok(())
    }

    /// Job 2: users who have been inactive for more than the grace period
    /// still carrying a region session row get their client revoked again
    /// (idempotent against job 1 having already done it) and the row cleared.
    async fn prune_region_clients(&self, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let stale = self
            .store
            .list_stale_region_sessions(now, Duration::hours(REGION_PRUNE_GRACE_HOURS))?;
        for tg_id in stale {
            if let Err(e) = self.region.revoke_client(tg_id).await {
                tracing::warn!(tg_id, error = %e, "failed to revoke stale region-vpn client");
                continue;
            }
            self.store.clear_region_session(tg_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_and_arbiter_lock_keys_are_distinct() {
        assert_ne!(SCHEDULER_LOCK_KEY, crate::arbiter::ARBITER_LOCK_KEY);
    }
}
