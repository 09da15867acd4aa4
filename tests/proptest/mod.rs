// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for innodb-cluster-admin.
//!
//! Uses proptest to generate random inputs and verify invariants.

use proptest::prelude::*;

use innodb_cluster_admin::client::{GtidSet, MemberState};
use innodb_cluster_admin::controller::OptionValue;
use innodb_cluster_admin::controller::options::{
    OptionTarget, lookup, multi_primary_auto_increment, resolve,
};
use innodb_cluster_admin::controller::validation::{
    MAX_CLUSTER_NAME_LENGTH, validate_cluster_name,
};
use innodb_cluster_admin::group::{QuorumVerdict, compute_verdict, failure_tolerance};

const SOURCE: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

/// Strategy for generating member states.
fn any_state() -> impl Strategy<Value = MemberState> {
    prop_oneof![
        Just(MemberState::Online),
        Just(MemberState::Recovering),
        Just(MemberState::Offline),
        Just(MemberState::Error),
        Just(MemberState::Unreachable),
    ]
}

/// Strategy for generating a non-empty group view (1-9 members).
fn any_view() -> impl Strategy<Value = Vec<MemberState>> {
    prop::collection::vec(any_state(), 1..=9)
}

/// Strategy for generating GTID intervals of one source.
fn intervals() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((1..500u64, 0..20u64).prop_map(|(s, len)| (s, s + len)), 0..8)
}

fn gtid_set(intervals: &[(u64, u64)]) -> GtidSet {
    let mut set = GtidSet::new();
    for &(s, e) in intervals {
        set.add(SOURCE, s, e);
    }
    set
}

proptest! {
    /// Property: A verdict reports quorum only if active members are a strict majority.
    #[test]
    fn test_quorum_requires_majority(view in any_view(), extra in 0..3usize) {
        let active = view.iter().filter(|s| s.is_active()).count();
        let online = view.iter().filter(|s| **s == MemberState::Online).count();
        let verdict = compute_verdict(&view, online, online + extra);
        prop_assert_eq!(verdict.has_quorum(), active * 2 > view.len());
    }

    /// Property: Members missing from metadata-only never affect quorum.
    #[test]
    fn test_recorded_members_do_not_change_quorum(
        view in any_view(),
        online in 0..9usize,
        extra in 0..9usize,
    ) {
        let a = compute_verdict(&view, online, online);
        let b = compute_verdict(&view, online, online + extra);
        prop_assert_eq!(a == QuorumVerdict::NoQuorum, b == QuorumVerdict::NoQuorum);
    }

    /// Property: With quorum, a verdict without tolerance means at most two online members.
    #[test]
    fn test_no_tolerance_below_three_online(online in 1..12usize) {
        let view = vec![MemberState::Online; online];
        let verdict = compute_verdict(&view, online, online);
        if online < 3 {
            prop_assert_eq!(verdict, QuorumVerdict::OkNoTolerance);
        } else {
            prop_assert_eq!(verdict, QuorumVerdict::Ok);
        }
    }

    /// Property: The group survives losing `failure_tolerance(n)` members but not one more.
    #[test]
    fn test_failure_tolerance_matches_majority(online in 1..64usize) {
        let tolerance = failure_tolerance(online);
        prop_assert!((online - tolerance) * 2 > online);
        prop_assert!((online - tolerance - 1) * 2 <= online);
    }

    /// Property: Multi-primary offsets are in range and increments cover the group.
    #[test]
    fn test_auto_increment_in_range(members in 1..20usize, server_id in any::<u32>()) {
        let (increment, offset) = multi_primary_auto_increment(members, server_id);
        prop_assert!(increment >= 7);
        prop_assert!(increment >= members as u64);
        prop_assert!(offset >= 1 && offset <= increment);
    }

    /// Property: memberWeight accepts exactly 0..=100.
    #[test]
    fn test_member_weight_range(weight in -500i64..500) {
        let result = resolve("memberWeight", &OptionValue::Int(weight), OptionTarget::Cluster);
        prop_assert_eq!(result.is_ok(), (0..=100).contains(&weight));
        if let Ok((_, value)) = result {
            prop_assert_eq!(value, weight.to_string());
        }
    }

    /// Property: exitStateAction normalizes case-insensitively.
    #[test]
    fn test_exit_state_action_case_insensitive(
        action in prop::sample::select(vec!["ABORT_SERVER", "READ_ONLY", "OFFLINE_MODE"]),
        lower in any::<bool>(),
    ) {
        let spec = lookup("exitStateAction").unwrap();
        let input = if lower { action.to_lowercase() } else { action.to_string() };
        prop_assert_eq!(spec.normalize(&OptionValue::Str(input)).unwrap(), action);
    }

    /// Property: Names matching the identifier pattern are valid cluster names.
    #[test]
    fn test_valid_cluster_names(name in "[A-Za-z_][A-Za-z0-9_]{0,39}") {
        prop_assert!(validate_cluster_name(&name).is_ok());
    }

    /// Property: Names longer than the limit are rejected.
    #[test]
    fn test_long_cluster_names_rejected(name in "[A-Za-z_][A-Za-z0-9_]{40,60}") {
        prop_assert!(name.len() > MAX_CLUSTER_NAME_LENGTH);
        prop_assert!(validate_cluster_name(&name).is_err());
    }

    /// Property: Names starting with a digit or containing a dash are rejected.
    #[test]
    fn test_invalid_cluster_names_rejected(name in "([0-9][a-z]{0,10}|[a-z]{1,5}-[a-z]{1,5})") {
        prop_assert!(validate_cluster_name(&name).is_err());
    }

    /// Property: A GTID set is a subset of its union with anything.
    #[test]
    fn test_gtid_subset_of_union(a in intervals(), b in intervals()) {
        let left = gtid_set(&a);
        let union = gtid_set(&[a.clone(), b].concat());
        prop_assert!(left.is_subset_of(&union));
    }

    /// Property: The difference is empty exactly when the set is a subset.
    #[test]
    fn test_gtid_difference_empty_iff_subset(a in intervals(), b in intervals()) {
        let left = gtid_set(&a);
        let right = gtid_set(&b);
        prop_assert_eq!(left.difference(&right).is_empty(), left.is_subset_of(&right));
    }

    /// Property: Parsing the rendered set yields the same set.
    #[test]
    fn test_gtid_display_parses_back(a in intervals()) {
        let set = gtid_set(&a);
        let parsed: GtidSet = set.to_string().parse().unwrap();
        prop_assert_eq!(parsed, set);
    }
}
