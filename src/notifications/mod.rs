// At-most-once coverage reminders (7/3/1-day boundaries) and the daily admin
// kick report.
//
// Dedup is structural: each reminder flag, once set, is never cleared by this
// module, and is only set in the same call that successfully sent the
// message — a send failure leaves the flag untouched so the next boundary
// check retries at most once more.

use crate::clock::{days_until, is_past_amsterdam_noon, utcnow};
use crate::error::Result;
use crate::store::models::YandexCoverageRow;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;

const KICK_REPORT_DATE_KEY: &str = "daily_kick_report_last_date";
const KICK_REPORT_LIMIT: i64 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderKind {
    ExpiryWarning7d,
    ExpiryWarning3d,
    ExpiryWarning1d,
    RenewedNoticeTomorrow,
    SubscriptionExpired,
    DeviceChanged { old: Option<Ipv4Addr>, new: Ipv4Addr },
}

pub struct Reminder {
    pub tg_id: i64,
    pub kind: ReminderKind,
}

/// A sender abstraction so the dispatcher never depends on the chat-bot
/// command surface directly; production wires this to whatever the
/// out-of-scope front-end exposes.
#[async_trait::async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, tg_id: i64, kind: &ReminderKind) -> Result<()>;
}

pub struct NotificationDispatcher {
    store: Store,
    sender: Box<dyn NotificationSender>,
}

impl NotificationDispatcher {
    pub fn new(store: Store, sender: impl NotificationSender + 'static) -> Self {
        Self { store, sender: Box::new(sender) }
    }

    /// Computes and sends every due 7/3/1-day reminder, setting the
    /// corresponding dedup flag only on successful send.
    pub async fn run_coverage_reminders(&self, now: DateTime<Utc>) -> Result<u64> {
        let candidates = self.store.list_coverage_reminder_candidates(now)?;
        let mut sent = 0u64;

        for (coverage, subscription) in candidates {
            let Some(coverage_end) = coverage.coverage_end_at else { continue };
            let days = days_until(coverage_end, now);
            let renewed = subscription.end_at > coverage_end;

            let Some((kind, flag)) = classify(days, renewed) else { continue };
            if already_notified(&coverage, flag) {
                continue;
            }

            if self.sender.send(coverage.tg_id, &kind).await.is_ok() {
                self.store.mark_notified(coverage.tg_id, flag, now)?;
                sent += 1;
            }
        }

        Ok(sent)
    }

    /// At the first tick after 12:00 Amsterdam local on a given calendar date,
    /// sends the admin kick report and records the date so later ticks the
    /// same day are a no-op. `force` bypasses both the time gate and the
    /// persisted-date check.
    pub async fn run_daily_kick_report(&self, now: DateTime<Utc>, force: bool) -> Result<Option<Vec<(i64, DateTime<Utc>)>>> {
        let today = crate::clock::amsterdam_today(now);

        if !force {
            if !is_past_amsterdam_noon(now) {
                return Ok(None);
            }
            if self.store.get_job_state(KICK_REPORT_DATE_KEY)?.as_deref() == Some(today.as_str()) {
                return Ok(None);
            }
        }

        let rows = self.store.list_kick_report_rows(now, KICK_REPORT_LIMIT)?;

        if !force {
            self.store.set_job_state(KICK_REPORT_DATE_KEY, &today, now)?;
        }

        Ok(Some(rows))
    }

    /// Fire-and-forget notice for the expiry sweep. No dedup flag applies
    /// here: the sweep itself only visits a subscription once (it flips
    /// `is_active` to false in the same pass), so a lost send is lost for
    /// good rather than retried.
    pub async fn notify_expired(&self, tg_id: i64) {
        if let Err(e) = self.sender.send(tg_id, &ReminderKind::SubscriptionExpired).await {
            tracing::warn!(tg_id, error = %e, "failed to send subscription-expired notice");
        }
    }
}

fn classify(days: i64, renewed: bool) -> Option<(ReminderKind, &'static str)> {
    match (days, renewed) {
        (7, false) => Some((ReminderKind::ExpiryWarning7d, "7d")),
        (3, false) => Some((ReminderKind::ExpiryWarning3d, "3d")),
        (1, false) => Some((ReminderKind::ExpiryWarning1d, "1d")),
        (1, true) => Some((ReminderKind::RenewedNoticeTomorrow, "1d")),
        _ => None,
    }
}

fn already_notified(coverage: &YandexCoverageRow, flag: &str) -> bool {
    match flag {
        "7d" => coverage.notified_7d_at.is_some(),
        "3d" => coverage.notified_3d_at.is_some(),
        "1d" => coverage.notified_1d_at.is_some(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSender {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl NotificationSender for CountingSender {
        async fn send(&self, _tg_id: i64, _kind: &ReminderKind) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::BrokerError::transient("send failed"))
            } else {
                Ok(())
            }
        }
    }

    fn seed(store: &Store, tg_id: i64, coverage_end: DateTime<Utc>, sub_end: DateTime<Utc>) {
        store.ensure_user(tg_id).unwrap();
        store.set_coverage_end(tg_id, coverage_end).unwrap();
        store.set_subscription_window(tg_id, utcnow(), sub_end, true).unwrap();
    }

    #[tokio::test]
    async fn sends_seven_day_warning_and_sets_dedup_flag_once() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        let coverage_end = now + chrono::Duration::days(7);
        let sub_end = now + chrono::Duration::days(30);
        seed(&store, 1, coverage_end, sub_end);

        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = NotificationDispatcher::new(store.clone(), CountingSender { calls: calls.clone(), fail: false });

        let sent = dispatcher.run_coverage_reminders(now).await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let sent_again = dispatcher.run_coverage_reminders(now).await.unwrap();
        assert_eq!(sent_again, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_send_does_not_set_dedup_flag() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        seed(&store, 1, now + chrono::Duration::days(1), now + chrono::Duration::days(30));

        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = NotificationDispatcher::new(store.clone(), CountingSender { calls: calls.clone(), fail: true });
        let sent = dispatcher.run_coverage_reminders(now).await.unwrap();
        assert_eq!(sent, 0);

        let dispatcher_ok = NotificationDispatcher::new(store, CountingSender { calls, fail: false });
        let retried = dispatcher_ok.run_coverage_reminders(now).await.unwrap();
        assert_eq!(retried, 1);
    }

    #[tokio::test]
    async fn kick_report_sends_once_per_amsterdam_day() {
        let store = Store::open_in_memory().unwrap();
        let noon_utc_winter = chrono::DateTime::parse_from_rfc3339("2026-01-15T11:05:00Z").unwrap().with_timezone(&Utc);
        store.ensure_user(1).unwrap();
        store.set_coverage_end(1, noon_utc_winter).unwrap();
        store.set_subscription_window(1, noon_utc_winter, noon_utc_winter, true).unwrap();

        let dispatcher = NotificationDispatcher::new(store, CountingSender { calls: Arc::new(AtomicUsize::new(0)), fail: false });
        let first = dispatcher.run_daily_kick_report(noon_utc_winter, false).await.unwrap();
        assert!(first.is_some());

        let second = dispatcher
            .run_daily_kick_report(noon_utc_winter + chrono::Duration::hours(1), false)
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
