//! Properties of the Beiboot and Shelf transition tables.

use std::collections::BTreeSet;

use beiboot_operator::controller::shelf_machine::{self, ShelfEvent};
use beiboot_operator::controller::state_machine::{self, needs_teardown, ClusterEvent};
use beiboot_operator::crd::beiboot::BeibootState;
use beiboot_operator::crd::shared::StateTransitions;
use beiboot_operator::crd::shelf::ShelfState;

/// Every state reachable from REQUESTED without passing through ERROR.
fn reachable_without_error() -> BTreeSet<String> {
    let mut seen = BTreeSet::from([BeibootState::Requested.to_string()]);
    let mut frontier = vec![BeibootState::Requested];
    while let Some(s) = frontier.pop() {
        for t in state_machine::TRANSITIONS.iter().filter(|t| t.from == s) {
            if t.to == BeibootState::Error || t.to == BeibootState::Terminating {
                continue;
            }
            if seen.insert(t.to.to_string()) {
                frontier.push(t.to);
            }
        }
    }
    seen
}

#[test]
fn test_ready_only_reachable_through_creating_and_pending() {
    use BeibootState::*;
    // edges into RUNNING/READY come only from PENDING, RUNNING, READY or ERROR
    for t in state_machine::TRANSITIONS {
        if t.to == Running {
            assert!(matches!(t.from, Pending | Error), "{} --{}--> RUNNING", t.from, t.event);
        }
        if t.to == Ready {
            assert!(matches!(t.from, Running | Ready | Error));
        }
        if t.to == Pending {
            assert_eq!(t.from, Creating);
        }
    }
    let reachable = reachable_without_error();
    for s in ["CREATING", "PENDING", "RUNNING", "READY"] {
        assert!(reachable.contains(s), "{s} unreachable");
    }
}

#[test]
fn test_every_event_has_a_row() {
    for e in ClusterEvent::ALL {
        assert!(state_machine::TRANSITIONS.iter().any(|t| t.event == e), "{e}");
    }
    for e in ShelfEvent::ALL {
        assert!(shelf_machine::TRANSITIONS.iter().any(|t| t.event == e), "{e}");
    }
}

#[test]
fn test_terminating_is_final() {
    assert!(state_machine::TRANSITIONS
        .iter()
        .all(|t| t.from != BeibootState::Terminating));
    assert!(shelf_machine::TRANSITIONS
        .iter()
        .all(|t| t.from != ShelfState::Terminating));
}

#[test]
fn test_cluster_self_loops_are_limited() {
    let loops: Vec<_> = state_machine::TRANSITIONS
        .iter()
        .filter(|t| t.from == t.to)
        .map(|t| (t.from, t.event))
        .collect();
    assert_eq!(
        loops,
        vec![
            (BeibootState::Creating, ClusterEvent::Create),
            (BeibootState::Ready, ClusterEvent::Reconcile)
        ]
    );
}

#[test]
fn test_teardown_exactly_when_provisioned() {
    let torn_down: Vec<_> = BeibootState::ALL
        .into_iter()
        .filter(|s| needs_teardown(*s))
        .collect();
    assert!(!torn_down.contains(&BeibootState::Requested));
    assert!(!torn_down.contains(&BeibootState::Terminating));
    assert_eq!(torn_down.len(), 5);
}

#[test]
fn test_shelf_replay_guard() {
    let mut transitions = StateTransitions::new();
    transitions.insert("READY".into(), "2024-05-01T12:00:00.000000Z".into());
    assert!(!shelf_machine::needs_write(ShelfState::Ready, &transitions, ShelfState::Ready));

    transitions.insert("ERROR".into(), "2024-05-01T12:05:00.000000Z".into());
    assert!(shelf_machine::needs_write(ShelfState::Error, &transitions, ShelfState::Ready));
}

#[test]
fn test_shelf_error_recovers_to_creating() {
    assert_eq!(
        shelf_machine::next_state(ShelfState::Error, ShelfEvent::Recover).unwrap(),
        ShelfState::Creating
    );
    assert!(shelf_machine::next_state(ShelfState::Requested, ShelfEvent::Terminate).is_err());
}
