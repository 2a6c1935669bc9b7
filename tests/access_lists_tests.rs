//! Integration tests for the access list store

mod common;

use common::{names, Harness, CONTROLS, SIGNALS};
use hwbroker::access::AccessLists;
use hwbroker::error::{BrokerError, NameKind};
use std::fs;
use std::os::unix::fs::PermissionsExt;

fn lists(harness: &Harness) -> AccessLists {
    AccessLists::new(
        harness.access_dir(),
        harness.store.clone(),
        names(&SIGNALS),
        names(&CONTROLS),
    )
}

#[test]
fn test_user_access_is_union_of_lists() {
    let harness = Harness::new();
    harness.write_access("0.DEFAULT_ACCESS", &["ENERGY"], &[]);
    harness.write_access("users/alice", &["TEMPERATURE"], &["FREQUENCY"]);
    harness.write_access("groups/power", &["POWER", "ENERGY"], &["POWER_LIMIT"]);
    harness.write_access("groups/other", &["POWER"], &["UNCORE_FREQUENCY"]);

    let (signals, controls) = lists(&harness)
        .get_user_access("alice", &names(&["power"]))
        .unwrap();

    assert_eq!(signals, names(&["ENERGY", "POWER", "TEMPERATURE"]));
    assert_eq!(controls, names(&["FREQUENCY", "POWER_LIMIT"]));
}

#[test]
fn test_missing_lists_grant_nothing() {
    let harness = Harness::new();

    let (signals, controls) = lists(&harness)
        .get_user_access("bob", &names(&["nogroup"]))
        .unwrap();

    assert!(signals.is_empty());
    assert!(controls.is_empty());
}

#[test]
fn test_root_gets_everything() {
    let harness = Harness::new();

    let access = lists(&harness).get_user_access("root", &[]).unwrap();

    assert_eq!(access, lists(&harness).get_all_access());
    assert_eq!(access.0, names(&SIGNALS));
    assert_eq!(access.1, names(&CONTROLS));
}

#[test]
fn test_unknown_names_are_ignored() {
    let harness = Harness::new();
    harness.write_access("0.DEFAULT_ACCESS", &["ENERGY", "NOT_A_SIGNAL"], &["FREQUENCY", "ENERGY"]);

    let (signals, controls) = lists(&harness).get_user_access("carol", &[]).unwrap();

    assert_eq!(signals, names(&["ENERGY"]));
    assert_eq!(controls, names(&["FREQUENCY"]));
}

#[test]
fn test_insecure_list_is_quarantined_and_ignored() {
    let harness = Harness::new();
    harness.write_access("users/alice", &["ENERGY"], &["FREQUENCY"]);
    let planted = harness.access_dir().join("users/alice/allowed_controls");
    fs::set_permissions(&planted, fs::Permissions::from_mode(0o666)).unwrap();

    let (signals, controls) = lists(&harness).get_user_access("alice", &[]).unwrap();

    assert_eq!(signals, names(&["ENERGY"]));
    assert!(controls.is_empty());
    assert!(!planted.exists());
}

#[test]
fn test_set_group_access_round_trip() {
    let harness = Harness::new();
    let lists = lists(&harness);

    lists
        .set_group_access("power", &names(&["POWER"]), &names(&["POWER_LIMIT"]))
        .unwrap();

    assert_eq!(
        lists.get_group_access("power").unwrap(),
        (names(&["POWER"]), names(&["POWER_LIMIT"]))
    );
    let (signals, _) = lists.get_user_access("dave", &names(&["power"])).unwrap();
    assert_eq!(signals, names(&["POWER"]));
}

#[test]
fn test_empty_group_addresses_default_list() {
    let harness = Harness::new();
    let lists = lists(&harness);

    lists.set_group_access("", &names(&["ENERGY"]), &[]).unwrap();

    assert!(harness
        .access_dir()
        .join("0.DEFAULT_ACCESS/allowed_signals")
        .exists());
    let (signals, _) = lists.get_user_access("erin", &[]).unwrap();
    assert_eq!(signals, names(&["ENERGY"]));
}

#[test]
fn test_set_group_access_rejects_unexposed_names() {
    let harness = Harness::new();

    let err = lists(&harness)
        .set_group_access("power", &names(&["ZZZ", "ENERGY", "AAA"]), &[])
        .unwrap_err();

    match err {
        BrokerError::AccessDenied { kind, names: denied } => {
            assert_eq!(kind, NameKind::Signals);
            assert_eq!(denied, names(&["AAA", "ZZZ"]));
        }
        other => panic!("Expected AccessDenied, got {:?}", other),
    }
    assert!(!harness.access_dir().join("groups/power").exists());
}

#[test]
fn test_group_names_are_validated() {
    let harness = Harness::new();
    let lists = lists(&harness);

    for bad in ["../etc", "a/b", ".hidden", "x y"] {
        assert!(matches!(
            lists.get_group_access(bad),
            Err(BrokerError::InvalidArgument(_))
        ));
    }
}
