// Session arbiter: the "one active device per region-VPN user" loop.
//
// Independent of the scheduler core loop, leader-protected by a distinct
// advisory-lock key, grounded on the original's `region_session_guard_loop`:
// fetch the log tail, parse, group by user keeping the latest event,
// partition by current subscription activity, persist IP switches, then
// apply one routing rewrite per tick (never per user).

use crate::clock::utcnow;
use crate::error::Result;
use crate::notifications::{NotificationSender, ReminderKind};
use crate::store::Store;
use crate::xray::access_log::{latest_per_user, parse_since, parse_timestamp, AccessEvent};
use crate::xray::XrayAdapter;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::watch;

pub const ARBITER_LOCK_KEY: i64 = 947_382_612;
const TAIL_LINES: u32 = 500;
const LEASE_SECONDS: i64 = 30;

pub struct DeviceChangedNotice {
    pub tg_id: i64,
    pub old_ip: Option<Ipv4Addr>,
    pub new_ip: Ipv4Addr,
}

pub struct SessionArbiter {
    store: Store,
    xray: XrayAdapter,
    sender: Box<dyn NotificationSender>,
    holder_id: String,
    high_water_mark: String,
}

impl SessionArbiter {
    pub fn new(store: Store, xray: XrayAdapter, sender: impl NotificationSender + 'static, holder_id: String) -> Self {
        Self { store, xray, sender: Box::new(sender), holder_id, high_water_mark: String::new() }
    }

    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
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
                tracing::error!(error = %e, "session arbiter tick failed");
            }
        }
    }

    pub async fn tick(&mut self) -> Result<()> {
        let now = utcnow();
        if !self.store.try_acquire_lock(ARBITER_LOCK_KEY, &self.holder_id, LEASE_SECONDS, now)? {
            return Ok(());
        }

        let raw = self.xray.tail_access_log(TAIL_LINES).await?;
        let events = parse_since(&raw, &self.high_water_mark);
        if let Some(max_ts) = events.iter().map(|e| e.timestamp.clone()).max() {
            self.high_water_mark = max_ts;
        }
        let latest = latest_per_user(events);
        if latest.is_empty() {
            return Ok(());
        }

        let mut notices = Vec::new();
        let mut disabled_ids = Vec::new();
        let mut stale_ips = Vec::new();

        for event in latest {
            let subscription = self.store.get_subscription(event.tg_id)?;
            let is_active = subscription.map(|s| s.is_active).unwrap_or(false);

            if !is_active {
                disabled_ids.push(event.tg_id);
                continue;
            }

            self.record_switch(&event, now, &mut notices, &mut stale_ips)?;
        }

        self.xray.apply_enabled_map(&disabled_ids).await?;
        self.xray.apply_active_ip_map(&stale_ips).await?;

        for notice in notices {
            let kind = ReminderKind::DeviceChanged { old: notice.old_ip, new: notice.new_ip };
            if let Err(e) = self.sender.send(notice.tg_id, &kind).await {
                tracing::warn!(tg_id = notice.tg_id, error = %e, "failed to send device-changed notice");
            }
        }

        Ok(())
    }

    fn record_switch(
        &self,
        event: &AccessEvent,
        now: chrono::DateTime<chrono::Utc>,
        notices: &mut Vec<DeviceChangedNotice>,
        stale_ips: &mut Vec<Ipv4Addr>,
    ) -> Result<()> {
        let switched_at = parse_timestamp(&event.timestamp).unwrap_or(now);
        let previous = self.store.record_active_ip(event.tg_id, &event.ip.to_string(), switched_at)?;
        if let Some(prev) = previous {
            if let Ok(prev_ip) = prev.parse::<Ipv4Addr>() {
                stale_ips.push(prev_ip);
            }
            notices.push(DeviceChangedNotice {
                tg_id: event.tg_id,
                old_ip: prev.parse().ok(),
                new_ip: event.ip,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbiter_lock_key_is_distinct_from_scheduler_lock() {
        assert_ne!(ARBITER_LOCK_KEY, crate::scheduler::SCHEDULER_LOCK_KEY);
    }
}
