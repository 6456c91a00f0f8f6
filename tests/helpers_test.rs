//! Unit tests for naming, duration, port and sunset helpers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{TimeDelta, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use beiboot_operator::helpers::*;

#[test]
fn test_namespace_is_prefix_dash_name() {
    assert_eq!(beiboot_namespace("getdeck-bbt", "demo"), "getdeck-bbt-demo");
    assert_eq!(
        beiboot_namespace("getdeck-bbt", "demo"),
        beiboot_namespace("getdeck-bbt", "demo")
    );
}

#[test]
fn test_durations() {
    assert_eq!(parse_timedelta("1d", false).unwrap(), TimeDelta::days(1));
    assert_eq!(
        parse_timedelta("1h30m", false).unwrap(),
        TimeDelta::minutes(90)
    );
    assert_eq!(parse_timedelta("-10s", true).unwrap(), TimeDelta::seconds(-10));
    assert!(parse_timedelta("-10s", false).is_err());
    assert!(parse_timedelta("", false).is_err());
    assert!(parse_timedelta("10", false).is_err());
    assert!(parse_timedelta("1m1h", false).is_err());
    assert!(parse_timedelta("1h1h", false).is_err());
}

#[test]
fn test_port_mappings() {
    assert_eq!(parse_port_mapping("8080:80").unwrap(), (8080, 80));
    assert!(parse_port_mapping("65536:80").is_err());
    assert_eq!(
        ports_to_pairs(&["8080:80".into(), "junk".into(), "6443:6443".into()]),
        vec![(8080, 80), (6443, 6443)]
    );
}

#[test]
fn test_free_port_never_taken() {
    let taken: BTreeSet<u16> = (31820..31830).collect();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let port = pick_free_port((31820, 31830), &taken, &mut rng).unwrap();
        assert_eq!(port, 31830);
    }
    let all: BTreeSet<u16> = (31820..=31830).collect();
    assert_eq!(pick_free_port((31820, 31830), &all, &mut rng), None);
}

#[test]
fn test_sunset_by_lifetime_or_idle_session() {
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let contact = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();

    let check = SunsetCheck::evaluate(Some(created), Some(TimeDelta::hours(4)), None, None);
    assert!(!check.expired(created + TimeDelta::hours(3)));
    assert!(check.expired(created + TimeDelta::hours(4)));

    let check = SunsetCheck::evaluate(
        Some(created),
        None,
        Some(contact),
        Some(TimeDelta::minutes(30)),
    );
    assert_eq!(check.sunset, None);
    assert!(check.expired(contact + TimeDelta::minutes(31)));
    assert!(!check.expired(contact + TimeDelta::minutes(29)));

    let never = SunsetCheck::evaluate(Some(created), None, Some(contact), None);
    assert!(!never.expired(created + TimeDelta::days(365)));
}

#[test]
fn test_heartbeats_use_latest_parsable_value() {
    let data = BTreeMap::from([
        ("alice".to_string(), "2024-05-01T12:00:00Z".to_string()),
        ("bob".to_string(), "2024-05-01T14:00:00.000000Z".to_string()),
        ("carol".to_string(), "yesterday".to_string()),
    ]);
    let latest = latest_client_contact(&data).unwrap();
    assert_eq!(latest, Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap());
    assert_eq!(latest_client_contact(&BTreeMap::new()), None);
}
