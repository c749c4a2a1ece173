// Immutable application configuration, loaded once at process startup.
//
// Unlike `dynamic_config.rs`-style env readers that default everything, every field
// enumerated here as required aborts startup with a named-variable error when absent.
// Optional fields fall back to the defaults noted inline.

use crate::error::{BrokerError, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct WireGuardConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub interface: String,
    pub server_public_key: String,
    pub endpoint: String,
    pub network_cidr: String,
    pub dns: String,
    pub key_enc_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionVpnConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub xray_config_path: String,
    pub access_log_path: String,
    pub max_clients: u32,
    pub vless_host: String,
    pub vless_port: u16,
    pub vless_sni: String,
    pub vless_fp: String,
    pub vless_pbk: String,
    pub vless_sid: String,
    pub vless_flow: String,
    pub vless_label: String,
    pub session_guard_period_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    pub base_url: String,
    pub merchant_id: String,
    pub secret: String,
    pub price_amount: i64,
    pub price_currency: String,
    pub period_months: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferralsConfig {
    pub hold_days: i64,
    pub min_payout_rub: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_path: String,
    pub scheduler_period_seconds: u64,
    pub admin_bind_addr: String,
    pub wireguard: WireGuardConfig,
    pub region_vpn: RegionVpnConfig,
    pub payments: PaymentsConfig,
    pub referrals: ReferralsConfig,
}

/// Field-level accumulator so a single `load()` call reports every missing
/// required variable at once rather than aborting on the first.
struct Required<'a> {
    missing: Vec<&'static str>,
    raw: &'a config::Config,
}

impl<'a> Required<'a> {
    fn string(&mut self, key: &'static str) -> String {
        match self.raw.get_string(key) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                self.missing.push(key);
                String::new()
            }
        }
    }

    fn opt_string(&self, key: &'static str) -> Option<String> {
        self.raw.get_string(key).ok().filter(|s| !s.trim().is_empty())
    }

    fn u16(&mut self, key: &'static str, default: u16) -> u16 {
        self.raw.get_int(key).map(|v| v as u16).unwrap_or(default)
    }

    fn u32(&mut self, key: &'static str, default: u32) -> u32 {
        self.raw.get_int(key).map(|v| v as u32).unwrap_or(default)
    }

    fn u64(&mut self, key: &'static str, default: u64) -> u64 {
        self.raw.get_int(key).map(|v| v as u64).unwrap_or(default)
    }

    fn i64(&mut self, key: &'static str, default: i64) -> i64 {
        self.raw.get_int(key).unwrap_or(default)
    }

    fn string_or(&mut self, key: &'static str, default: &str) -> String {
        match self.raw.get_string(key) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => default.to_string(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from the process environment. Any name in the required
    /// list that is absent or empty collects into a single startup-aborting error
    /// naming every missing variable.
    pub fn load() -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let mut r = Required { missing: Vec::new(), raw: &raw };

        let wireguard = WireGuardConfig {
            ssh_host: r.string("WG_SSH_HOST"),
            ssh_port: r.u16("WG_SSH_PORT", 22),
            ssh_user: r.string("WG_SSH_USER"),
            ssh_password: r.opt_string("WG_SSH_PASSWORD"),
            ssh_private_key: r.opt_string("WG_SSH_PRIVATE_KEY"),
            interface: r.string_or("VPN_INTERFACE", "wg0"),
            server_public_key: r.string("VPN_SERVER_PUBLIC_KEY"),
            endpoint: r.string("VPN_ENDPOINT"),
            network_cidr: r.string_or("VPN_NETWORK_CIDR", "10.66.0.0/16"),
            dns: r.string_or("VPN_DNS", "1.1.1.1"),
            key_enc_secret: r.string("VPN_KEY_ENC_SECRET"),
        };

        let region_vpn = RegionVpnConfig {
            ssh_host: r.string("REGION_SSH_HOST"),
            ssh_port: r.u16("REGION_SSH_PORT", 22),
            ssh_user: r.string_or("REGION_SSH_USER", "root"),
            ssh_password: r.opt_string("REGION_SSH_PASSWORD"),
            ssh_private_key: r.opt_string("REGION_SSH_PRIVATE_KEY_B64"),
            xray_config_path: r.string_or(
                "REGION_XRAY_CONFIG_PATH",
                "/usr/local/etc/xray/config.json",
            ),
            access_log_path: r.string_or(
                "REGION_ACCESS_LOG_PATH",
                "/var/log/xray/access.log",
            ),
            max_clients: r.u32("REGION_MAX_CLIENTS", 40),
            vless_host: r.string("REGION_VLESS_HOST"),
            vless_port: r.u16("REGION_VLESS_PORT", 443),
            vless_sni: r.string_or("REGION_VLESS_SNI", "max.ru"),
            vless_fp: r.string_or("REGION_VLESS_FP", "chrome"),
            vless_pbk: r.string("REGION_VLESS_PBK"),
            vless_sid: r.opt_string("REGION_VLESS_SID").unwrap_or_default(),
            vless_flow: r.string_or("REGION_VLESS_FLOW", "xtls-rprx-vision"),
            vless_label: r.string_or("REGION_VLESS_NAME", "VPN Region"),
            session_guard_period_seconds: r.u64("REGION_SESSION_GUARD_PERIOD_SECONDS", 5),
        };

        let payments = PaymentsConfig {
            base_url: r.string_or("PAYMENTS_BASE_URL", "https://app.platega.io"),
            merchant_id: r.string("PAYMENTS_MERCHANT_ID"),
            secret: r.string("PAYMENTS_SECRET"),
            price_amount: r.i64("PRICE_AMOUNT", 299),
            price_currency: r.string_or("PRICE_CURRENCY", "RUB"),
            period_months: r.i64("PERIOD_MONTHS", 1),
        };

        let referrals = ReferralsConfig {
            hold_days: r.i64("REFERRAL_HOLD_DAYS", 7),
            min_payout_rub: r.i64("REFERRAL_MIN_PAYOUT_RUB", 50),
        };

        let database_path = r.string_or("DATABASE_PATH", "./data/broker.sqlite3");
        let scheduler_period_seconds = r.u64("SCHEDULER_PERIOD_SECONDS", 30);
        let admin_bind_addr = r.string_or("ADMIN_BIND_ADDR", "0.0.0.0:8787");

        if !r.missing.is_empty() {
            return Err(BrokerError::InvalidConfig(format!(
                "missing required environment variables: {}",
                r.missing.join(", ")
            )));
        }

        Ok(AppConfig {
            database_path,
            scheduler_period_seconds,
            admin_bind_addr,
            wireguard,
            region_vpn,
            payments,
            referrals,
        })
    }
}
