// Referral ledger persistence: the tables backing the commission ledger.
// Business rules (percent tiers, idempotency, payout reservation math) live in
// `crate::referrals`; this module is pure row access.

use super::models::{EarningStatus, PayoutRequest, ReferralEarning};
use super::{parse_dt_opt, Store};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl Store {
    pub fn get_inviter(&self, tg_id: i64) -> Result<Option<i64>> {
        self.lock()
            .query_row(
                "SELECT referred_by_tg_id FROM users WHERE tg_id = ?1",
                params![tg_id],
                |r| r.get(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(Into::into)
    }

    /// Records `ref_code` as `referred`'s inviter unless one is already set
    /// (first-contact attribution only, never overwritten).
    pub fn attach_pending_referrer(&self, referred_tg_id: i64, ref_code: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let inviter: Option<i64> = conn
            .query_row("SELECT tg_id FROM users WHERE ref_code = ?1", params![ref_code], |r| r.get(0))
            .optional()?;
        let Some(inviter_tg_id) = inviter else { return Ok(false) };
        if inviter_tg_id == referred_tg_id {
            return Ok(false);
        }
        let updated = conn.execute(
            "UPDATE users SET referred_by_tg_id = ?1, referred_at = ?2
             WHERE tg_id = ?3 AND referred_by_tg_id IS NULL",
            params![inviter_tg_id, now.to_rfc3339(), referred_tg_id],
        )?;
        Ok(updated > 0)
    }

    /// Generates and persists a unique url-safe referral code for a user who
    /// does not already have one. No-op (returns the existing code) otherwise.
    pub fn ensure_ref_code<F: Fn() -> String>(&self, tg_id: i64, generate: F) -> Result<String> {
        let conn = self.lock();
        if let Some(existing) = conn
            .query_row("SELECT ref_code FROM users WHERE tg_id = ?1", params![tg_id], |r| r.get::<_, Option<String>>(0))
            .optional()?
            .flatten()
        {
            return Ok(existing);
        }

        for _ in 0..10 {
            let candidate = generate();
            let updated = conn.execute(
                "UPDATE users SET ref_code = ?1 WHERE tg_id = ?2 AND ref_code IS NULL",
                params![candidate, tg_id],
            );
            match updated {
                Ok(n) if n > 0 => return Ok(candidate),
                Ok(_) => return Err(BrokerError::NotFound(format!("user {tg_id} not found"))),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(format!("u{tg_id}"))
    }

    pub fn count_active_referrals(&self, referrer_tg_id: i64) -> Result<i64> {
        self.lock()
            .query_row(
                "SELECT COUNT(*) FROM referrals WHERE referrer_tg_id = ?1 AND status = 'active'",
                params![referrer_tg_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    pub fn has_referral(&self, referred_tg_id: i64) -> Result<bool> {
        self.lock()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM referrals WHERE referred_tg_id = ?1)",
                params![referred_tg_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    pub fn insert_referral(&self, referrer_tg_id: i64, referred_tg_id: i64, first_payment_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            "INSERT INTO referrals (referrer_tg_id, referred_tg_id, status, first_payment_id, activated_at, created_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?4)",
            params![referrer_tg_id, referred_tg_id, first_payment_id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Inserts an earning row for `(payment_id, referrer_tg_id)`. Returns
    /// `Ok(false)` without inserting if that pair already has a row (the
    /// idempotency guarantee for replayed payment-success events).
    #[allow(clippy::too_many_arguments)]
    pub fn insert_earning_if_absent(
        &self,
        referrer_tg_id: i64,
        referred_tg_id: i64,
        payment_id: i64,
        payment_amount_rub: i64,
        percent: i64,
        earned_rub: i64,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO referral_earnings
                (referrer_tg_id, referred_tg_id, payment_id, payment_amount_rub, percent, earned_rub, status, available_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
            params![
                referrer_tg_id,
                referred_tg_id,
                payment_id,
                payment_amount_rub,
                percent,
                earned_rub,
                available_at.to_rfc3339(),
                now.to_rfc3339()
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Flips every `pending` earning whose `available_at` has passed to
    /// `available`, returning how many rows were released.
    pub fn release_pending_earnings(&self, now: DateTime<Utc>) -> Result<u64> {
        let n = self.lock().execute(
            "UPDATE referral_earnings SET status = 'available' WHERE status = 'pending' AND available_at <= ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(n as u64)
    }

    fn row_to_earning(row: &rusqlite::Row) -> rusqlite::Result<ReferralEarning> {
        Ok(ReferralEarning {
            id: row.get(0)?,
            referrer_tg_id: row.get(1)?,
            referred_tg_id: row.get(2)?,
            payment_id: row.get(3)?,
            payment_amount_rub: row.get(4)?,
            percent: row.get(5)?,
            earned_rub: row.get(6)?,
            status: EarningStatus::parse(&row.get::<_, String>(7)?),
            available_at: parse_dt_opt(row.get(8)?),
            payout_request_id: row.get(9)?,
        })
    }

    pub fn available_balance(&self, tg_id: i64) -> Result<i64> {
        self.lock()
            .query_row(
                "SELECT COALESCE(SUM(earned_rub), 0) FROM referral_earnings WHERE referrer_tg_id = ?1 AND status = 'available'",
                params![tg_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    pub fn balance_by_status(&self, tg_id: i64, status: EarningStatus) -> Result<i64> {
        self.lock()
            .query_row(
                "SELECT COALESCE(SUM(earned_rub), 0) FROM referral_earnings WHERE referrer_tg_id = ?1 AND status = ?2",
                params![tg_id, status.as_str()],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    /// Greedily reserves `available` earnings in id-ascending order until
    /// `amount_rub` is covered, splitting the last consumed row into a
    /// `reserved` part and a residual `available` part when it overshoots.
    pub fn create_payout_request(&self, tg_id: i64, amount_rub: i64, now: DateTime<Utc>) -> Result<PayoutRequest> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let available: i64 = tx.query_row(
            "SELECT COALESCE(SUM(earned_rub), 0) FROM referral_earnings WHERE referrer_tg_id = ?1 AND status = 'available'",
            params![tg_id],
            |r| r.get(0),
        )?;
        if available < amount_rub {
            return Err(BrokerError::business("insufficient available balance"));
        }

        tx.execute(
            "INSERT INTO payout_requests (tg_id, amount_rub, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
            params![tg_id, amount_rub, now.to_rfc3339()],
        )?;
        let payout_id = tx.last_insert_rowid();

        let rows: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, earned_rub FROM referral_earnings WHERE referrer_tg_id = ?1 AND status = 'available' ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![tg_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut remaining = amount_rub;
        for (id, earned) in rows {
            if remaining <= 0 {
                break;
            }
            if earned <= remaining {
                tx.execute(
                    "UPDATE referral_earnings SET status = 'reserved', payout_request_id = ?1 WHERE id = ?2",
                    params![payout_id, id],
                )?;
                remaining -= earned;
            } else {
                tx.execute(
                    "UPDATE referral_earnings SET earned_rub = ?1, status = 'reserved', payout_request_id = ?2 WHERE id = ?3",
                    params![remaining, payout_id, id],
                )?;
                tx.execute(
                    "INSERT INTO referral_earnings
                        (referrer_tg_id, referred_tg_id, payment_id, payment_amount_rub, percent, earned_rub, status, available_at, created_at)
                     SELECT referrer_tg_id, referred_tg_id, payment_id, payment_amount_rub, percent, ?1, 'available', available_at, ?2
                     FROM referral_earnings WHERE id = ?3",
                    params![earned - remaining, now.to_rfc3339(), id],
                )?;
                remaining = 0;
            }
        }

        tx.commit()?;
        Ok(PayoutRequest { id: payout_id, tg_id, amount_rub, status: "pending".to_string() })
    }

    pub fn mark_payout_paid(&self, payout_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE referral_earnings SET status = 'paid', paid_at = ?1 WHERE payout_request_id = ?2 AND status = 'reserved'",
            params![now.to_rfc3339(), payout_id],
        )?;
        tx.execute(
            "UPDATE payout_requests SET status = 'paid', processed_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), payout_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn reject_payout(&self, payout_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE referral_earnings SET status = 'available', payout_request_id = NULL
             WHERE payout_request_id = ?1 AND status = 'reserved'",
            params![payout_id],
        )?;
        tx.execute(
            "UPDATE payout_requests SET status = 'rejected', processed_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), payout_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_earnings_for_payout(&self, payout_id: i64) -> Result<Vec<ReferralEarning>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, referrer_tg_id, referred_tg_id, payment_id, payment_amount_rub, percent, earned_rub, status, available_at, payout_request_id
             FROM referral_earnings WHERE payout_request_id = ?1",
        )?;
        let rows = stmt.query_map(params![payout_id], Self::row_to_earning)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::utcnow;

    fn seed_earning(store: &Store, referrer: i64, referred: i64, payment_id: i64, earned: i64, now: DateTime<Utc>) {
        store.ensure_user(referrer).unwrap();
        store.ensure_user(referred).unwrap();
        store
            .insert_earning_if_absent(referrer, referred, payment_id, earned * 100 / 5, 5, earned, now, now)
            .unwrap();
        store.release_pending_earnings(now).unwrap();
    }

    #[test]
    fn insert_earning_if_absent_rejects_replay_of_same_payment_and_referrer() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        store.ensure_user(2).unwrap();
        let now = utcnow();
        assert!(store.insert_earning_if_absent(1, 2, 10, 500, 5, 25, now, now).unwrap());
        assert!(!store.insert_earning_if_absent(1, 2, 10, 500, 5, 25, now, now).unwrap());
    }

    #[test]
    fn create_payout_request_splits_last_consumed_row() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        seed_earning(&store, 1, 2, 10, 25, now);
        seed_earning(&store, 1, 3, 11, 20, now);

        assert_eq!(store.available_balance(1).unwrap(), 45);

        let payout = store.create_payout_request(1, 40, now).unwrap();
        assert_eq!(store.available_balance(1).unwrap(), 5);
        assert_eq!(store.balance_by_status(1, EarningStatus::Reserved).unwrap(), 40);

        let reserved = store.list_earnings_for_payout(payout.id).unwrap();
        assert_eq!(reserved.iter().map(|e| e.earned_rub).sum::<i64>(), 40);
    }

    #[test]
    fn reject_payout_restores_available_balance_exactly() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        seed_earning(&store, 1, 2, 10, 25, now);
        let payout = store.create_payout_request(1, 25, now).unwrap();
        store.reject_payout(payout.id, now).unwrap();
        assert_eq!(store.available_balance(1).unwrap(), 25);
        assert_eq!(store.balance_by_status(1, EarningStatus::Reserved).unwrap(), 0);
    }

    #[test]
    fn mark_payout_paid_then_reject_is_a_no_op_on_already_paid_rows() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        seed_earning(&store, 1, 2, 10, 25, now);
        let payout = store.create_payout_request(1, 25, now).unwrap();
        store.mark_payout_paid(payout.id, now).unwrap();
        store.reject_payout(payout.id, now).unwrap();
        assert_eq!(store.balance_by_status(1, EarningStatus::Paid).unwrap(), 25);
        assert_eq!(store.available_balance(1).unwrap(), 0);
    }

    #[test]
    fn ensure_ref_code_is_stable_across_calls() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        let n = std::cell::Cell::new(0);
        let code_a = store.ensure_ref_code(1, || { n.set(n.get() + 1); format!("code{}", n.get()) }).unwrap();
        let code_b = store.ensure_ref_code(1, || { n.set(n.get() + 1); format!("code{}", n.get()) }).unwrap();
        assert_eq!(code_a, code_b);
    }

    #[test]
    fn attach_pending_referrer_does_not_overwrite_existing_inviter() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        store.ensure_user(2).unwrap();
        store.ensure_user(3).unwrap();
        store.ensure_ref_code(1, || "code1".to_string()).unwrap();
        store.ensure_ref_code(2, || "code2".to_string()).unwrap();
        let now = utcnow();
        assert!(store.attach_pending_referrer(3, "code1", now).unwrap());
        assert!(!store.attach_pending_referrer(3, "code2", now).unwrap());
        assert_eq!(store.get_inviter(3).unwrap(), Some(1));
    }
}
