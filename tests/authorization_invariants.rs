//! Cross-cutting invariants (see `DESIGN.md`, testable properties 2-6), exercised against the
//! published `palpo_room_auth` API rather than any internal module.

use palpo_room_auth::{
    check, room_version_capabilities, AuthErrorKind, AuthEvents, Capability, EventType, EventView,
};
use serde_json::{json, Value};

fn room_version(id: &str) -> &'static palpo_room_auth::RoomVersion {
    palpo_room_auth::ROOM_VERSIONS.iter().find(|v| v.id == id).unwrap()
}

fn create_event(creator: &str, room_id: &str) -> EventView {
    EventView {
        event_type: EventType::Create,
        sender: creator.to_owned(),
        state_key: Some(String::new()),
        content: json!({"creator": creator}),
        room_id: room_id.to_owned(),
        depth: 0,
        event_id: "$create:example.org".to_owned(),
        prev_events: vec![],
        auth_events: vec![],
    }
}

fn member_event(room_id: &str, sender: &str, target: &str, membership: &str) -> EventView {
    EventView {
        event_type: EventType::Member,
        sender: sender.to_owned(),
        state_key: Some(target.to_owned()),
        content: json!({"membership": membership}),
        room_id: room_id.to_owned(),
        depth: 1,
        event_id: format!("$member-{target}:example.org"),
        prev_events: vec!["$create:example.org".to_owned()],
        auth_events: vec!["$create:example.org".to_owned()],
    }
}

fn state_event(room_id: &str, sender: &str, content: Value) -> EventView {
    EventView {
        event_type: EventType::Other("m.room.topic".to_owned()),
        sender: sender.to_owned(),
        state_key: Some(String::new()),
        content,
        room_id: room_id.to_owned(),
        depth: 2,
        event_id: "$topic:example.org".to_owned(),
        prev_events: vec!["$create:example.org".to_owned()],
        auth_events: vec!["$create:example.org".to_owned()],
    }
}

fn base_room(room_id: &str, creator: &str) -> AuthEvents {
    let mut auth = AuthEvents::new();
    auth.insert("", create_event(creator, room_id));
    auth.insert(creator, member_event(room_id, creator, creator, "join"));
    auth
}

/// Invariant 1: determinism. Two calls over identical inputs agree.
#[test]
fn determinism_over_repeated_calls() {
    let room_id = "!room:example.org";
    let rv = room_version("6");
    let auth = base_room(room_id, "@creator:example.org");
    let ev = state_event(room_id, "@creator:example.org", json!({"topic": "hi"}));

    let first = check(rv, &ev, &auth, false, None);
    let second = check(rv, &ev, &auth, false, None);
    assert_eq!(first.is_ok(), second.is_ok());
}

/// Invariant 2: before any power-levels event exists, only the creator may pass state-event
/// authorization; every other joined sender is rejected for insufficient power.
#[test]
fn creator_omnipotence_before_first_power_levels_event() {
    let room_id = "!room:example.org";
    let rv = room_version("6");
    let mut auth = base_room(room_id, "@creator:example.org");
    auth.insert("@other:example.org", member_event(room_id, "@other:example.org", "@other:example.org", "join"));

    let creator_ev = state_event(room_id, "@creator:example.org", json!({"topic": "hi"}));
    check(rv, &creator_ev, &auth, false, None).expect("creator may always send state before any PL event");

    let other_ev = state_event(room_id, "@other:example.org", json!({"topic": "hi"}));
    let err = check(rv, &other_ev, &auth, false, None).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InsufficientPower);
}

/// Invariant 3: a banned user's join and knock attempts fail regardless of join rule.
#[test]
fn ban_dominates_join_and_knock_under_every_join_rule() {
    let room_id = "!room:example.org";
    let rv = room_version("7");

    for join_rule in ["public", "invite", "knock"] {
        let mut auth = base_room(room_id, "@creator:example.org");
        auth.insert("@bob:example.org", member_event(room_id, "@creator:example.org", "@bob:example.org", "ban"));
        auth.insert("", EventView {
            event_type: EventType::JoinRules,
            sender: "@creator:example.org".to_owned(),
            state_key: Some(String::new()),
            content: json!({"join_rule": join_rule}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$jr:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        });

        let join_ev = member_event(room_id, "@bob:example.org", "@bob:example.org", "join");
        let err = check(rv, &join_ev, &auth, false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::Banned, "join under join_rule={join_rule}");

        let knock_ev = member_event(room_id, "@bob:example.org", "@bob:example.org", "knock");
        let err = check(rv, &knock_ev, &auth, false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidMembershipTransition, "knock under join_rule={join_rule}");
    }
}

/// Invariant 4: no force-join. A `member=join` event whose sender differs from its target state
/// key is always rejected, even in a public room.
#[test]
fn no_force_join_even_in_public_room() {
    let room_id = "!room:example.org";
    let rv = room_version("6");
    let mut auth = base_room(room_id, "@creator:example.org");
    auth.insert("", EventView {
        event_type: EventType::JoinRules,
        sender: "@creator:example.org".to_owned(),
        state_key: Some(String::new()),
        content: json!({"join_rule": "public"}),
        room_id: room_id.to_owned(),
        depth: 1,
        event_id: "$jr:example.org".to_owned(),
        prev_events: vec!["$create:example.org".to_owned()],
        auth_events: vec!["$create:example.org".to_owned()],
    });

    let ev = member_event(room_id, "@creator:example.org", "@victim:example.org", "join");
    let err = check(rv, &ev, &auth, false, None).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidMembershipTransition);
}

/// Invariant 5: a sender below `state_default` is rejected for every `is_state=true` event.
#[test]
fn monotone_state_default() {
    let room_id = "!room:example.org";
    let rv = room_version("6");
    let mut auth = base_room(room_id, "@creator:example.org");
    auth.insert("@low:example.org", member_event(room_id, "@low:example.org", "@low:example.org", "join"));
    auth.insert("", EventView {
        event_type: EventType::PowerLevels,
        sender: "@creator:example.org".to_owned(),
        state_key: Some(String::new()),
        content: json!({"state_default": 40, "users": {"@low:example.org": 39}}),
        room_id: room_id.to_owned(),
        depth: 1,
        event_id: "$pl:example.org".to_owned(),
        prev_events: vec!["$create:example.org".to_owned()],
        auth_events: vec!["$create:example.org".to_owned()],
    });

    let ev = state_event(room_id, "@low:example.org", json!({"topic": "hi"}));
    let err = check(rv, &ev, &auth, false, None).unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InsufficientPower);
}

/// Invariant 6: the `knock` capability enumerates exactly the versions with `knocking = true`.
#[test]
fn version_capability_consistency_for_knocking() {
    let caps = room_version_capabilities();
    let knock_support = &caps.iter().find(|(c, _)| *c == Capability::Knock).unwrap().1.supporting_versions;

    for v in palpo_room_auth::ROOM_VERSIONS {
        assert_eq!(v.knocking, knock_support.contains(&v.id), "room version {} disagrees with capability table", v.id);
    }
}
