// Row types returned by the store. Timestamps are parsed eagerly so callers
// never handle raw RFC3339 strings.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct User {
    pub tg_id: i64,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub ref_code: Option<String>,
    pub referred_by_tg_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub tg_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_active: bool,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct VpnPeer {
    pub id: i64,
    pub tg_id: i64,
    pub client_public_key: String,
    pub client_private_key_enc: String,
    pub client_ip: String,
    pub server_code: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct RegionVpnSession {
    pub tg_id: i64,
    pub active_ip: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_switch_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct YandexCoverageRow {
    pub tg_id: i64,
    pub coverage_end_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
    pub notified_7d_at: Option<DateTime<Utc>>,
    pub notified_3d_at: Option<DateTime<Utc>>,
    pub notified_1d_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarningStatus {
    Pending,
    Available,
    Reserved,
    Paid,
}

impl EarningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EarningStatus::Pending => "pending",
            EarningStatus::Available => "available",
            EarningStatus::Reserved => "reserved",
            EarningStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => EarningStatus::Available,
            "reserved" => EarningStatus::Reserved,
            "paid" => EarningStatus::Paid,
            _ => EarningStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferralEarning {
    pub id: i64,
    pub referrer_tg_id: i64,
    pub referred_tg_id: i64,
    pub payment_id: Option<i64>,
    pub payment_amount_rub: i64,
    pub percent: i64,
    pub earned_rub: i64,
    pub status: EarningStatus,
    pub available_at: Option<DateTime<Utc>>,
    pub payout_request_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub id: i64,
    pub tg_id: i64,
    pub amount_rub: i64,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct Payment {
    pub id: i64,
    pub tg_id: i64,
    pub amount: i64,
    pub currency: String,
    pub provider: String,
    pub status: String,
    pub provider_payment_id: Option<String>,
}
