// Composes the store and the referral ledger around a single payment-success
// event: record the ledger row, extend the subscription window, and credit
// the referrer. This is a pure data operation the chat-bot command surface
// calls into after it observes a provider status transition to paid — the
// polling and the user-facing confirmation message are that surface's job,
// not this crate's.

use crate::error::Result;
use crate::referrals::ReferralLedger;
use crate::store::models::Subscription;
use crate::store::Store;
use chrono::{DateTime, Utc};

pub struct BillingService {
    store: Store,
    referrals: ReferralLedger,
    period_months: u32,
}

impl BillingService {
    pub fn new(store: Store, referrals: ReferralLedger, period_months: u32) -> Self {
        Self { store, referrals, period_months }
    }

    /// Idempotent by `provider_payment_id`: a replayed webhook/poll for a
    /// transaction already recorded returns a business-rule error rather than
    /// extending the subscription a second time.
    pub fn complete_payment(
        &self,
        tg_id: i64,
        amount_rub: i64,
        currency: &str,
        provider: &str,
        provider_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        self.store.ensure_user(tg_id)?;

        let payment_id = self.store.record_payment(
            tg_id,
            amount_rub,
            currency,
            provider,
            "paid",
            Some(provider_payment_id),
            Some(self.period_months as i64),
            now,
        )?;

        let subscription = self.store.extend_subscription(tg_id, self.period_months, now)?;

        self.referrals
            .on_payment_success(tg_id, payment_id, amount_rub, now)?;

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::utcnow;

    fn service() -> BillingService {
        let store = Store::open_in_memory().unwrap();
        let referrals = ReferralLedger::new(store.clone(), 3, 100);
        BillingService::new(store, referrals, 1)
    }

    #[test]
    fn complete_payment_extends_subscription_and_credits_referrer() {
        let billing = service();
        billing.store.ensure_user(10).unwrap();
        billing.store.ensure_user(20).unwrap();
        billing.referrals.ensure_ref_code(10).unwrap();
        let code = billing.store.get_user(10).unwrap().unwrap().ref_code.unwrap();
        billing.referrals.attach_pending_referrer(20, &code).unwrap();

        let now = utcnow();
        let sub = billing.complete_payment(20, 500, "RUB", "platega", "tx-1", now).unwrap();
        assert!(sub.is_active);
        assert!(sub.end_at > now);

        let balance = billing.referrals.available_balance(10).unwrap();
        assert_eq!(balance, 0);
    }

    #[test]
    fn complete_payment_rejects_duplicate_provider_payment_id() {
        let billing = service();
        billing.store.ensure_user(1).unwrap();
        let now = utcnow();
        billing.complete_payment(1, 500, "RUB", "platega", "tx-dup", now).unwrap();
        let second = billing.complete_payment(1, 500, "RUB", "platega", "tx-dup", now);
        assert!(second.is_err());
    }
}
