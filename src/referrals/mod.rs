// Referral commission ledger: percent tiering, idempotent earning creation on
// payment success, hold-period release, and payout reservation.
//
// The store (`crate::store::referrals`) owns the row-level mechanics; this
// module owns the business rules the original's `ReferralService` encodes.

use crate::clock::utcnow;
use crate::error::Result;
use crate::store::models::PayoutRequest;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

pub struct ReferralLedger {
    store: Store,
    hold_days: i64,
    min_payout_rub: i64,
}

/// Commission percent by count of the referrer's currently-active referrals.
fn level_percent(active_referrals: i64) -> i64 {
    match active_referrals {
        0..=3 => 5,
        4..=9 => 11,
        _ => 17,
    }
}

fn random_ref_code() -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl ReferralLedger {
    pub fn new(store: Store, hold_days: i64, min_payout_rub: i64) -> Self {
        Self { store, hold_days, min_payout_rub }
    }

    pub fn ensure_ref_code(&self, tg_id: i64) -> Result<String> {
        self.store.ensure_ref_code(tg_id, random_ref_code)
    }

    pub fn attach_pending_referrer(&self, referred_tg_id: i64, ref_code: &str) -> Result<bool> {
        self.store.attach_pending_referrer(referred_tg_id, ref_code, utcnow())
    }

    pub fn current_percent(&self, referrer_tg_id: i64) -> Result<i64> {
        Ok(level_percent(self.store.count_active_referrals(referrer_tg_id)?))
    }

    /// Called once per successful payment. No-op if the payer has no inviter,
    /// or if this `(payment_id, referrer)` pair was already recorded.
    pub fn on_payment_success(
        &self,
        payer_tg_id: i64,
        payment_id: i64,
        amount_rub: i64,
        paid_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(referrer_tg_id) = self.store.get_inviter(payer_tg_id)? else {
            return Ok(());
        };

        if !self.store.has_referral(payer_tg_id)? {
            self.store.insert_referral(referrer_tg_id, payer_tg_id, payment_id, paid_at)?;
        }

        let percent = self.current_percent(referrer_tg_id)?;
        let earned_rub = (amount_rub * percent + 50) / 100;
        let available_at = paid_at + Duration::days(self.hold_days);

        self.store.insert_earning_if_absent(
            referrer_tg_id,
            payer_tg_id,
            payment_id,
            amount_rub,
            percent,
            earned_rub,
            available_at,
            paid_at,
        )?;
        Ok(())
    }

    pub fn release_due_earnings(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.release_pending_earnings(now)
    }

    pub fn available_balance(&self, tg_id: i64) -> Result<i64> {
        self.store.available_balance(tg_id)
    }

    pub fn request_payout(&self, tg_id: i64, amount_rub: i64) -> Result<PayoutRequest> {
        if amount_rub < self.min_payout_rub {
            return Err(crate::error::BrokerError::business(format!(
                "payout amount below minimum of {} rub",
                self.min_payout_rub
            )));
        }
        self.store.create_payout_request(tg_id, amount_rub, utcnow())
    }

    pub fn mark_payout_paid(&self, payout_id: i64) -> Result<()> {
        self.store.mark_payout_paid(payout_id, utcnow())
    }

    pub fn reject_payout(&self, payout_id: i64) -> Result<()> {
        self.store.reject_payout(payout_id, utcnow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ReferralLedger {
        ReferralLedger::new(Store::open_in_memory().unwrap(), 7, 50)
    }

    #[test]
    fn level_percent_matches_tier_table() {
        assert_eq!(level_percent(0), 5);
        assert_eq!(level_percent(3), 5);
        assert_eq!(level_percent(4), 11);
        assert_eq!(level_percent(9), 11);
        assert_eq!(level_percent(10), 17);
        assert_eq!(level_percent(100), 17);
    }

    #[test]
    fn on_payment_success_computes_earning_at_current_tier() {
        let ledger = ledger();
        ledger.store.ensure_user(1).unwrap();
        ledger.store.ensure_user(2).unwrap();
        ledger.store.ensure_ref_code(1, || "inv1".into()).unwrap();
        ledger.store.attach_pending_referrer(2, "inv1", utcnow()).unwrap();

        ledger.on_payment_success(2, 100, 500, utcnow()).unwrap();

        let balance_pending = ledger.store.balance_by_status(1, crate::store::models::EarningStatus::Pending).unwrap();
        assert_eq!(balance_pending, 25);
    }

    #[test]
    fn on_payment_success_is_idempotent_for_replayed_events() {
        let ledger = ledger();
        ledger.store.ensure_user(1).unwrap();
        ledger.store.ensure_user(2).unwrap();
        ledger.store.ensure_ref_code(1, || "inv1".into()).unwrap();
        ledger.store.attach_pending_referrer(2, "inv1", utcnow()).unwrap();

        ledger.on_payment_success(2, 100, 500, utcnow()).unwrap();
        ledger.on_payment_success(2, 100, 500, utcnow()).unwrap();

        let balance_pending = ledger.store.balance_by_status(1, crate::store::models::EarningStatus::Pending).unwrap();
        assert_eq!(balance_pending, 25);
    }

    #[test]
    fn on_payment_success_is_a_no_op_without_an_inviter() {
        let ledger = ledger();
        ledger.store.ensure_user(2).unwrap();
        ledger.on_payment_success(2, 100, 500, utcnow()).unwrap();
    }

    #[test]
    fn request_payout_rejects_amounts_below_minimum() {
        let ledger = ledger();
        ledger.store.ensure_user(1).unwrap();
        assert!(ledger.request_payout(1, 10).is_err());
    }
}
