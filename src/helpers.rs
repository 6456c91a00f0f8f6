use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

/// Current UTC time as ISO-8601 with microsecond precision.
pub fn utc_now_iso() -> String {
    format_iso(Utc::now())
}

pub fn format_iso(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Namespace that hosts the workloads of a Beiboot: `<prefix>-<name>`.
pub fn beiboot_namespace(prefix: &str, name: &str) -> String {
    format!("{prefix}-{name}")
}

/// Maximum length of a DNS-1123 label (namespace names).
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Generate the shared k3s node token: 32 random bytes, hex encoded.
pub fn generate_node_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

// ── Duration grammar ──────────────────────────────────────────────────────────

/// Longest accepted duration, in seconds (100 years).
pub const MAX_DURATION_SECONDS: i64 = 100 * 365 * 86_400;

/// Parse a duration such as `2h30m`, `3d` or `-5h`.
///
/// Tokens are `<digits><unit>` with units `d`, `h`, `m`, `s`, each at most
/// once and in that order.  A leading `+` or `-` applies to the whole value.
/// Negative durations are rejected unless `allow_negative` is set, and
/// magnitudes beyond [`MAX_DURATION_SECONDS`] always are.
pub fn parse_timedelta(input: &str, allow_negative: bool) -> Result<TimeDelta, String> {
    let s = input.trim();
    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if body.is_empty() {
        return Err(format!("invalid duration {input:?}: no tokens"));
    }

    const UNITS: [(char, i64); 4] = [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];
    let mut next_unit = 0usize;
    let mut total: i64 = 0;
    let mut digits = String::new();

    for c in body.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let Some(pos) = UNITS.iter().position(|(u, _)| *u == c) else {
            return Err(format!("invalid duration {input:?}: unknown unit {c:?}"));
        };
        if pos < next_unit {
            return Err(format!(
                "invalid duration {input:?}: unit {c:?} repeated or out of order"
            ));
        }
        if digits.is_empty() {
            return Err(format!("invalid duration {input:?}: unit {c:?} without value"));
        }
        let value: i64 = digits
            .parse()
            .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
        total = value
            .checked_mul(UNITS[pos].1)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("invalid duration {input:?}: overflow"))?;
        digits.clear();
        next_unit = pos + 1;
    }
    if !digits.is_empty() {
        return Err(format!("invalid duration {input:?}: trailing digits without unit"));
    }

    if total > MAX_DURATION_SECONDS {
        return Err(format!(
            "invalid duration {input:?}: longer than {} days",
            MAX_DURATION_SECONDS / 86_400
        ));
    }
    let seconds = if negative { -total } else { total };
    if seconds < 0 && !allow_negative {
        return Err(format!("invalid duration {input:?}: negative values are not allowed"));
    }
    TimeDelta::try_seconds(seconds).ok_or_else(|| format!("invalid duration {input:?}: out of range"))
}

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Parse a `"local:remote"` port forward, both in 1..=65535.
pub fn parse_port_mapping(s: &str) -> Result<(u16, u16), String> {
    let (local, remote) = s
        .split_once(':')
        .ok_or_else(|| format!("port mapping {s:?} must be <local>:<remote>"))?;
    let parse = |p: &str| -> Result<u16, String> {
        match p.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!(
                "port mapping {s:?}: {p:?} is not a port in 1-65535"
            )),
            Ok(v) => Ok(v),
        }
    };
    Ok((parse(local)?, parse(remote)?))
}

/// Valid `(local, remote)` pairs of a port list; malformed entries are
/// skipped.  Each remote port is published once, by its first mapping.
pub fn ports_to_pairs(ports: &[String]) -> Vec<(u16, u16)> {
    let mut seen = BTreeSet::new();
    ports
        .iter()
        .filter_map(|p| parse_port_mapping(p).ok())
        .filter(|&(_, remote)| seen.insert(remote))
        .collect()
}

/// Parse an inclusive port range such as `31820-31920`.
pub fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| format!("port range {s:?} must be <from>-<to>"))?;
    let lo: u16 = lo
        .trim()
        .parse()
        .map_err(|e| format!("port range {s:?}: {e}"))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .map_err(|e| format!("port range {s:?}: {e}"))?;
    if lo == 0 || lo > hi {
        return Err(format!("port range {s:?} is empty or invalid"));
    }
    Ok((lo, hi))
}

/// Pick a port uniformly at random from `range` that is not in `taken`.
pub fn pick_free_port<R: Rng + ?Sized>(
    range: (u16, u16),
    taken: &BTreeSet<u16>,
    rng: &mut R,
) -> Option<u16> {
    let free: Vec<u16> = (range.0..=range.1).filter(|p| !taken.contains(p)).collect();
    free.choose(rng).copied()
}

// ── Sunset ────────────────────────────────────────────────────────────────────

/// Latest client contact across all entries of the heartbeat map.
/// Values that are not RFC 3339 timestamps are skipped.
pub fn latest_client_contact(data: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    data.iter()
        .filter_map(|(client, value)| match DateTime::parse_from_rfc3339(value) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                warn!(%client, %value, %e, "ignoring unparsable client heartbeat");
                None
            }
        })
        .max()
}

/// Outcome of evaluating the sunset policy for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SunsetCheck {
    /// Creation time + max lifetime, if a lifetime is configured.
    pub sunset: Option<DateTime<Utc>>,
    /// Last contact + max session timeout, if both are known.
    pub session_deadline: Option<DateTime<Utc>>,
}

impl SunsetCheck {
    pub fn evaluate(
        created: Option<DateTime<Utc>>,
        max_lifetime: Option<TimeDelta>,
        last_contact: Option<DateTime<Utc>>,
        max_session_timeout: Option<TimeDelta>,
    ) -> Self {
        // A deadline past the representable range is no deadline.
        let sunset = created
            .zip(max_lifetime)
            .and_then(|(c, l)| c.checked_add_signed(l));
        let session_deadline = last_contact
            .zip(max_session_timeout)
            .and_then(|(c, t)| c.checked_add_signed(t));
        Self {
            sunset,
            session_deadline,
        }
    }

    /// True when either deadline lies in the past relative to `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.sunset.is_some_and(|s| s <= now) || self.session_deadline.is_some_and(|d| d <= now)
    }
}
