// Parsing of the Xray access log.
//
// Only lines naming an accepted VLESS connection whose client email is tagged
// `tg:<id>` are of interest; every other accepted/rejected line (other inbounds,
// other tag prefixes) is silently skipped. The arbiter re-fetches the last N
// lines every tick rather than tracking a byte offset, so duplicate lines are
// expected and filtered by comparing the fixed-width timestamp string against
// a high-water mark (lexical order matches chronological order here).

use chrono::{DateTime, NaiveDateTime, Utc};
use static_regex::ACCESS_LINE_RE;
use std::net::Ipv4Addr;

mod static_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct LazyRegex(OnceLock<Regex>, &'static str);

    impl LazyRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self(OnceLock::new(), pattern)
        }

        pub fn get(&self) -> &Regex {
            self.0.get_or_init(|| Regex::new(self.1).expect("static regex is valid"))
        }
    }

    pub static ACCESS_LINE_RE: LazyRegex = LazyRegex::new(
        r"^(?P<dt>\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2}\.\d+).*?\bfrom\s+(?P<ip>\d{1,3}(?:\.\d{1,3}){3}):\d+\s+accepted\b.*?\bemail:\s*(?P<email>\S+)",
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub timestamp: String,
    pub ip: Ipv4Addr,
    pub tg_id: i64,
}

/// Parses a single access log line, returning `None` for any line that is not
/// an accepted connection tagged with a `tg:<id>` email.
pub fn parse_line(line: &str) -> Option<AccessEvent> {
    let caps = ACCESS_LINE_RE.get().captures(line)?;
    let email = &caps["email"];
    let tg_id_str = email.strip_prefix("tg:")?;
    let tg_id: i64 = tg_id_str.parse().ok()?;
    let ip: Ipv4Addr = caps["ip"].parse().ok()?;
    Some(AccessEvent {
        timestamp: caps["dt"].to_string(),
        ip,
        tg_id,
    })
}

/// Parses a raw multi-line tail-fetch, dropping any event whose timestamp does
/// not sort strictly after `high_water_mark` (empty mark keeps everything).
pub fn parse_since<'a>(raw: &'a str, high_water_mark: &str) -> Vec<AccessEvent> {
    raw.lines()
        .filter_map(parse_line)
        .filter(|e| e.timestamp.as_str() > high_water_mark)
        .collect()
}

/// Parses the log's fixed-width `YYYY/MM/DD HH:MM:SS.ffffff` timestamp,
/// which Xray writes in UTC here, as a real instant rather than an opaque
/// sort key. `None` for a malformed string, which the regex should already
/// rule out.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, "%Y/%m/%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Keeps only the most recent event per user within a single tick's batch.
pub fn latest_per_user(events: Vec<AccessEvent>) -> Vec<AccessEvent> {
    use std::collections::HashMap;
    let mut latest: HashMap<i64, AccessEvent> = HashMap::new();
    for event in events {
        latest
            .entry(event.tg_id)
            .and_modify(|existing| {
                if event.timestamp > existing.timestamp {
                    *existing = event.clone();
                }
            })
            .or_insert(event);
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accepted_tg_tagged_line() {
        let line = "2024/05/01 12:00:01.123456 from 203.0.113.9:51000 accepted tcp:example.com:443 [vless-in -> direct] email: tg:4242";
        let event = parse_line(line).unwrap();
        assert_eq!(event.tg_id, 4242);
        assert_eq!(event.ip, Ipv4Addr::new(203, 0, 113, 9));
    }

    #[test]
    fn ignores_non_tg_emails() {
        let line = "2024/05/01 12:00:01.123456 from 203.0.113.9:51000 accepted tcp:example.com:443 email: anon@example.com";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn ignores_rejected_lines() {
        let line = "2024/05/01 12:00:01.123456 from 203.0.113.9:51000 rejected tcp:example.com:443 email: tg:4242";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn parse_since_drops_lines_at_or_before_high_water_mark() {
        let raw = "2024/05/01 12:00:01.000000 from 203.0.113.9:1 accepted x email: tg:1\n\
                    2024/05/01 12:00:02.000000 from 203.0.113.9:1 accepted x email: tg:1\n";
        let events = parse_since(raw, "2024/05/01 12:00:01.000000");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, "2024/05/01 12:00:02.000000");
    }

    #[test]
    fn parses_fixed_width_timestamp_as_utc_instant() {
        let dt = parse_timestamp("2024/05/01 12:00:01.500000").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-05-01T12:00:01.500+00:00");
    }

    #[test]
    fn latest_per_user_keeps_newest_event_only() {
        let events = vec![
            AccessEvent { timestamp: "2024/05/01 12:00:01.000000".into(), ip: Ipv4Addr::new(1, 1, 1, 1), tg_id: 7 },
            AccessEvent { timestamp: "2024/05/01 12:00:02.000000".into(), ip: Ipv4Addr::new(2, 2, 2, 2), tg_id: 7 },
        ];
        let latest = latest_per_user(events);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].ip, Ipv4Addr::new(2, 2, 2, 2));
    }
}
