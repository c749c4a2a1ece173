// Subscription store: the single SQLite-backed source of truth for users,
// subscriptions, payments, VPN peers, region sessions, coverage read-model
// rows, and scheduler job state.
//
// Mirrors the teacher's `SqlStorage` shape (`Arc<Mutex<Connection>>`, one
// connection per process) but owns a much richer schema, so the CRUD surface
// is split across this file (users/subscriptions/payments/peers/sessions/
// coverage/job-state) and `referrals.rs` (the ledger tables).

pub mod migrations;
pub mod models;
pub mod referrals;

use crate::clock::utcnow;
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Months, Utc};
use models::{RegionVpnSession, Subscription, User, VpnPeer, YandexCoverageRow};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self { conn: self.conn.clone() }
    }
}

pub(crate) fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_dt)
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        migrations::run(&mut conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations::run(&mut conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    // ---- users / subscriptions ----

    /// Idempotently creates the user row (and a dormant subscription row) on
    /// first contact, matching the original's guarantee that every operation
    /// downstream of first contact can assume both rows exist.
    pub fn ensure_user(&self, tg_id: i64) -> Result<()> {
        let now = utcnow().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO users (tg_id, created_at, status) VALUES (?1, ?2, 'active')",
            params![tg_id, now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO subscriptions (tg_id, start_at, end_at, is_active, status)
             VALUES (?1, ?2, ?2, 0, 'pending')",
            params![tg_id, now],
        )?;
        Ok(())
    }

    pub fn get_user(&self, tg_id: i64) -> Result<Option<User>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT tg_id, created_at, status, ref_code, referred_by_tg_id FROM users WHERE tg_id = ?1",
            params![tg_id],
            |row| {
                Ok(User {
                    tg_id: row.get(0)?,
                    created_at: parse_dt(&row.get::<_, String>(1)?),
                    status: row.get(2)?,
                    ref_code: row.get(3)?,
                    referred_by_tg_id: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_subscription(&self, tg_id: i64) -> Result<Option<Subscription>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT tg_id, start_at, end_at, is_active, status FROM subscriptions WHERE tg_id = ?1",
            params![tg_id],
            Self::row_to_subscription,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_subscription(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
        Ok(Subscription {
            tg_id: row.get(0)?,
            start_at: parse_dt(&row.get::<_, String>(1)?),
            end_at: parse_dt(&row.get::<_, String>(2)?),
            is_active: row.get(3)?,
            status: row.get(4)?,
        })
    }

    /// Extends the subscription window by `months` calendar months from
    /// `max(now, current end_at)`. A zero-month extend is a no-op that still
    /// activates a previously-dormant row without shortening the window.
    pub fn extend_subscription(&self, tg_id: i64, months: u32, now: DateTime<Utc>) -> Result<Subscription> {
        let conn = self.lock();
        let current_end: String = conn.query_row(
            "SELECT end_at FROM subscriptions WHERE tg_id = ?1",
            params![tg_id],
            |r| r.get(0),
        )?;
        let current_end = parse_dt(&current_end);
        let base = current_end.max(now);
        let new_end = base
            .checked_add_months(Months::new(months))
            .ok_or_else(|| BrokerError::business("subscription extension overflowed"))?;

        conn.execute(
            "UPDATE subscriptions SET end_at = ?1, is_active = 1, status = 'active',
             start_at = CASE WHEN is_active = 0 THEN ?2 ELSE start_at END
             WHERE tg_id = ?3",
            params![new_end.to_rfc3339(), now.to_rfc3339(), tg_id],
        )?;

        conn.query_row(
            "SELECT tg_id, start_at, end_at, is_active, status FROM subscriptions WHERE tg_id = ?1",
            params![tg_id],
            Self::row_to_subscription,
        )
        .map_err(Into::into)
    }

    pub fn list_expired_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT tg_id, start_at, end_at, is_active, status FROM subscriptions
             WHERE is_active = 1 AND end_at <= ?1",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], Self::row_to_subscription)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn set_subscription_expired(&self, tg_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE subscriptions SET is_active = 0, status = 'expired' WHERE tg_id = ?1",
            params![tg_id],
        )?;
        Ok(())
    }

    /// Administrator-driven direct mutation of the subscription window,
    /// bypassing the calendar-month extension math entirely.
    pub fn set_subscription_window(&self, tg_id: i64, start_at: DateTime<Utc>, end_at: DateTime<Utc>, is_active: bool) -> Result<()> {
        self.lock().execute(
            "UPDATE subscriptions SET start_at = ?1, end_at = ?2, is_active = ?3 WHERE tg_id = ?4",
            params![start_at.to_rfc3339(), end_at.to_rfc3339(), is_active, tg_id],
        )?;
        Ok(())
    }

    /// Upserts the `coverage_end_at` read-model field owned by the external
    /// Yandex-family collaborator; the core never writes other coverage fields.
    pub fn set_coverage_end(&self, tg_id: i64, coverage_end_at: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            "INSERT INTO yandex_coverage (tg_id, coverage_end_at) VALUES (?1, ?2)
             ON CONFLICT(tg_id) DO UPDATE SET coverage_end_at = excluded.coverage_end_at",
            params![tg_id, coverage_end_at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- payments ----

    /// Records a payment. Duplicate `provider_payment_id` values are rejected
    /// by the column's unique constraint and surfaced as a business-rule error.
    pub fn record_payment(
        &self,
        tg_id: i64,
        amount: i64,
        currency: &str,
        provider: &str,
        status: &str,
        provider_payment_id: Option<&str>,
        period_months: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO payments (tg_id, amount, currency, provider, status, paid_at, period_months, provider_payment_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![tg_id, amount, currency, provider, status, now.to_rfc3339(), period_months, provider_payment_id],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(BrokerError::business("duplicate provider payment id"))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- vpn peers ----

    pub fn get_active_peer(&self, tg_id: i64, server_code: Option<&str>) -> Result<Option<VpnPeer>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, tg_id, client_public_key, client_private_key_enc, client_ip, server_code, is_active
             FROM vpn_peers WHERE tg_id = ?1 AND server_code IS ?2 AND is_active = 1
             ORDER BY id DESC LIMIT 1",
            params![tg_id, server_code],
            Self::row_to_peer,
        )
        .optional()
        .map_err(Into::into)
    }

    /// True if some active peer already holds `ip`, scoped to `server_code`.
    /// Used to resolve allocation collisions before a new peer is inserted.
    pub fn is_ip_active(&self, ip: &str, server_code: Option<&str>) -> Result<bool> {
        let conn = self.lock();
        conn.query_row(
            "SELECT 1 FROM vpn_peers WHERE client_ip = ?1 AND server_code IS ?2 AND is_active = 1",
            params![ip, server_code],
            |_| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .map_err(Into::into)
    }

    fn row_to_peer(row: &rusqlite::Row) -> rusqlite::Result<VpnPeer> {
        Ok(VpnPeer {
            id: row.get(0)?,
            tg_id: row.get(1)?,
            client_public_key: row.get(2)?,
            client_private_key_enc: row.get(3)?,
            client_ip: row.get(4)?,
            server_code: row.get(5)?,
            is_active: row.get(6)?,
        })
    }

    pub fn insert_peer(
        &self,
        tg_id: i64,
        public_key: &str,
        private_key_enc: &str,
        client_ip: &str,
        server_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<VpnPeer> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO vpn_peers (tg_id, client_public_key, client_private_key_enc, client_ip, server_code, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![tg_id, public_key, private_key_enc, client_ip, server_code, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        Ok(VpnPeer {
            id,
            tg_id,
            client_public_key: public_key.to_string(),
            client_private_key_enc: private_key_enc.to_string(),
            client_ip: client_ip.to_string(),
            server_code: server_code.map(str::to_string),
            is_active: true,
        })
    }

    /// Marks every active peer for `(tg_id, server_code)` revoked in one
    /// transaction, returning the peers that were deactivated so the caller can
    /// best-effort remove them from the remote interface.
    pub fn deactivate_peers(
        &self,
        tg_id: i64,
        server_code: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<VpnPeer>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let peers: Vec<VpnPeer> = {
            let mut stmt = tx.prepare(
                "SELECT id, tg_id, client_public_key, client_private_key_enc, client_ip, server_code, is_active
                 FROM vpn_peers WHERE tg_id = ?1 AND server_code IS ?2 AND is_active = 1",
            )?;
            let rows = stmt.query_map(params![tg_id, server_code], Self::row_to_peer)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE vpn_peers SET is_active = 0, revoked_at = ?1, rotation_reason = ?2
             WHERE tg_id = ?3 AND server_code IS ?4 AND is_active = 1",
            params![now.to_rfc3339(), reason, tg_id, server_code],
        )?;
        tx.commit()?;
        Ok(peers)
    }

    // ---- region vpn sessions ----

    pub fn get_region_session(&self, tg_id: i64) -> Result<Option<RegionVpnSession>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT tg_id, active_ip, last_seen_at, last_switch_at FROM region_vpn_sessions WHERE tg_id = ?1",
            params![tg_id],
            |row| {
                Ok(RegionVpnSession {
                    tg_id: row.get(0)?,
                    active_ip: row.get(1)?,
                    last_seen_at: parse_dt_opt(row.get(2)?),
                    last_switch_at: parse_dt_opt(row.get(3)?),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Records `ip` as the active source for `tg_id`. Returns the previous
    /// `active_ip` when it differs (the caller treats that as now-stale and
    /// routes it to the blackhole for the rest of the tick).
    pub fn record_active_ip(&self, tg_id: i64, ip: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let conn = self.lock();
        let previous: Option<String> = conn
            .query_row(
                "SELECT active_ip FROM region_vpn_sessions WHERE tg_id = ?1",
                params![tg_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();

        let changed = previous.as_deref() != Some(ip);
        conn.execute(
            "INSERT INTO region_vpn_sessions (tg_id, active_ip, last_seen_at, last_switch_at, created_at)
             VALUES (?1, ?2, ?3, ?3, ?3)
             ON CONFLICT(tg_id) DO UPDATE SET
                active_ip = excluded.active_ip,
                last_seen_at = excluded.last_seen_at,
                last_switch_at = CASE WHEN region_vpn_sessions.active_ip IS NOT excluded.active_ip
                                      THEN excluded.last_switch_at ELSE region_vpn_sessions.last_switch_at END",
            params![tg_id, ip, now.to_rfc3339()],
        )?;

        Ok(if changed { previous } else { None })
    }

    /// Users whose subscription has been inactive for more than `grace`
    /// and who still have a region session row — the prune-job candidate set.
    pub fn list_stale_region_sessions(&self, now: DateTime<Utc>, grace: chrono::Duration) -> Result<Vec<i64>> {
        let conn = self.lock();
        let threshold = now - grace;
        let mut stmt = conn.prepare(
            "SELECT r.tg_id FROM region_vpn_sessions r
             JOIN subscriptions s ON s.tg_id = r.tg_id
             WHERE s.is_active = 0 AND s.end_at <= ?1",
        )?;
        let rows = stmt.query_map(params![threshold.to_rfc3339()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn clear_region_session(&self, tg_id: i64) -> Result<()> {
        self.lock().execute(
            "DELETE FROM region_vpn_sessions WHERE tg_id = ?1",
            params![tg_id],
        )?;
        Ok(())
    }

    // ---- coverage (yandex read model) ----

    /// Rows with a future subscription end, a known coverage end, and not
    /// removed — the candidate set for the 7/3/1-day reminder job.
    pub fn list_coverage_reminder_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(YandexCoverageRow, Subscription)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT c.tg_id, c.coverage_end_at, c.removed_at, c.notified_7d_at, c.notified_3d_at, c.notified_1d_at,
                    s.tg_id, s.start_at, s.end_at, s.is_active, s.status
             FROM yandex_coverage c
             JOIN subscriptions s ON s.tg_id = c.tg_id
             WHERE c.coverage_end_at IS NOT NULL AND c.removed_at IS NULL AND s.end_at > ?1",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| {
            Ok((
                YandexCoverageRow {
                    tg_id: row.get(0)?,
                    coverage_end_at: parse_dt_opt(row.get(1)?),
                    removed_at: parse_dt_opt(row.get(2)?),
                    notified_7d_at: parse_dt_opt(row.get(3)?),
                    notified_3d_at: parse_dt_opt(row.get(4)?),
                    notified_1d_at: parse_dt_opt(row.get(5)?),
                },
                Subscription {
                    tg_id: row.get(6)?,
                    start_at: parse_dt(&row.get::<_, String>(7)?),
                    end_at: parse_dt(&row.get::<_, String>(8)?),
                    is_active: row.get(9)?,
                    status: row.get(10)?,
                },
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn mark_notified(&self, tg_id: i64, column: &str, now: DateTime<Utc>) -> Result<()> {
        let sql = match column {
            "7d" => "UPDATE yandex_coverage SET notified_7d_at = ?1 WHERE tg_id = ?2",
            "3d" => "UPDATE yandex_coverage SET notified_3d_at = ?1 WHERE tg_id = ?2",
            "1d" => "UPDATE yandex_coverage SET notified_1d_at = ?1 WHERE tg_id = ?2",
            other => return Err(BrokerError::business(format!("unknown dedup column: {other}"))),
        };
        self.lock().execute(sql, params![now.to_rfc3339(), tg_id])?;
        Ok(())
    }

    pub fn list_kick_report_rows(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT c.tg_id, s.end_at FROM yandex_coverage c
             JOIN subscriptions s ON s.tg_id = c.tg_id
             WHERE s.end_at <= ?1 AND c.removed_at IS NULL
             ORDER BY s.end_at ASC, c.tg_id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit], |row| {
            Ok((row.get::<_, i64>(0)?, parse_dt(&row.get::<_, String>(1)?)))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ---- job state / advisory lock ----

    pub fn get_job_state(&self, key: &str) -> Result<Option<String>> {
        self.lock()
            .query_row("SELECT value FROM job_state WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn set_job_state(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            "INSERT INTO job_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Non-blocking try-lock modeled as a leased row: a holder can re-acquire
    /// its own lease, and any lease is acquirable once expired. Plays the same
    /// role as `pg_try_advisory_lock` for the single-process deployment this
    /// crate targets.
    pub fn try_acquire_lock(
        &self,
        lock_key: i64,
        holder_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = format!("leader:{lock_key}");
        let expires_at = now + chrono::Duration::seconds(lease_seconds);
        let value = serde_json::json!({ "holder_id": holder_id, "expires_at": expires_at.to_rfc3339() }).to_string();

        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE job_state SET value = ?1, updated_at = ?2
             WHERE key = ?3 AND (
                json_extract(value, '$.expires_at') <= ?4
                OR json_extract(value, '$.holder_id') = ?5
             )",
            params![value, now.to_rfc3339(), key, now.to_rfc3339(), holder_id],
        )?;
        if updated > 0 {
            return Ok(true);
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO job_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now.to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn release_lock(&self, lock_key: i64, holder_id: &str) -> Result<()> {
        let key = format!("leader:{lock_key}");
        self.lock().execute(
            "DELETE FROM job_state WHERE key = ?1 AND json_extract(value, '$.holder_id') = ?2",
            params![key, holder_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ensure_user_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        store.ensure_user(1).unwrap();
        assert!(store.get_user(1).unwrap().is_some());
        assert!(store.get_subscription(1).unwrap().is_some());
    }

    #[test]
    fn extend_subscription_never_shortens_window() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        let now = utcnow();
        let first = store.extend_subscription(1, 1, now).unwrap();
        let second = store.extend_subscription(1, 0, now).unwrap();
        assert_eq!(first.end_at, second.end_at);
        assert!(second.is_active);
    }

    #[test]
    fn extend_subscription_bases_on_prior_end_when_still_covered() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        let now = utcnow();
        let first = store.extend_subscription(1, 1, now).unwrap();
        let second = store.extend_subscription(1, 1, now + Duration::days(1)).unwrap();
        assert_eq!(second.end_at, first.end_at.checked_add_months(Months::new(1)).unwrap());
    }

    #[test]
    fn deactivate_peers_marks_inactive_and_returns_revoked_rows() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        let now = utcnow();
        store.insert_peer(1, "pub1", "enc1", "10.66.0.3", None, now).unwrap();
        let revoked = store.deactivate_peers(1, None, "expired", now).unwrap();
        assert_eq!(revoked.len(), 1);
        assert!(store.get_active_peer(1, None).unwrap().is_none());
    }

    #[test]
    fn record_active_ip_reports_previous_on_switch() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_user(1).unwrap();
        let now = utcnow();
        assert_eq!(store.record_active_ip(1, "1.1.1.1", now).unwrap(), None);
        assert_eq!(
            store.record_active_ip(1, "2.2.2.2", now + Duration::seconds(1)).unwrap(),
            Some("1.1.1.1".to_string())
        );
        assert_eq!(store.record_active_ip(1, "2.2.2.2", now + Duration::seconds(2)).unwrap(), None);
    }

    #[test]
    fn try_acquire_lock_excludes_other_holders_until_expiry() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        assert!(store.try_acquire_lock(947382611, "a", 30, now).unwrap());
        assert!(!store.try_acquire_lock(947382611, "b", 30, now).unwrap());
        assert!(store.try_acquire_lock(947382611, "a", 30, now + Duration::seconds(1)).unwrap());
        assert!(store
            .try_acquire_lock(947382611, "b", 30, now + Duration::seconds(31))
            .unwrap());
    }

    #[test]
    fn release_lock_only_removes_own_lease() {
        let store = Store::open_in_memory().unwrap();
        let now = utcnow();
        store.try_acquire_lock(1, "a", 30, now).unwrap();
        store.release_lock(1, "b").unwrap();
        assert!(!store.try_acquire_lock(1, "b", 30, now).unwrap());
        store.release_lock(1, "a").unwrap();
        assert!(store.try_acquire_lock(1, "b", 30, now).unwrap());
    }
}
