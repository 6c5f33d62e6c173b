//! Top-level authorization predicate (C6, §4.6): dispatches per event type and enforces the
//! create/join-rules/power-levels/alias/third-party-invite/membership rules for a room version.
//!
//! Grounded on `palpo-im-palpo`'s `state::event_auth::auth_check` (the synchronous,
//! `fetch_state`-closure-based entry point) for the overall pipeline shape, and on
//! `state::event_auth::mod::check_state_independent_auth_rules` for the create-event and
//! auth-events-presence checks. Re-expressed over the engine's own [`AuthEvents`] map and
//! [`PowerLevelView`]/[`membership`] helpers rather than the teacher's generic `Pdu`/`Fetch`
//! type parameters, per the pure-function contract in §5.

use tracing::{debug, info, instrument, warn};

use crate::error::{AuthError, AuthErrorKind};
use crate::event::{AuthEvents, EventType, EventView};
use crate::identifiers::domain_of;
use crate::membership;
use crate::power_levels::PowerLevelView;
use crate::room_version::RoomVersion;

/// Abstraction over the external signature verifier (§6): `(event, required_domains) -> ok|err`.
///
/// The engine never implements cryptography itself; wire signature verification and key-server
/// fetching live elsewhere (§1). This trait lets an embedding server plug in its real verifier
/// while letting the engine's own tests use a stub.
pub trait SignatureVerifier {
    fn verify(&self, event: &EventView, required_domains: &[String]) -> Result<(), AuthError>;
}

impl<F> SignatureVerifier for F
where
    F: Fn(&EventView, &[String]) -> Result<(), AuthError>,
{
    fn verify(&self, event: &EventView, required_domains: &[String]) -> Result<(), AuthError> {
        self(event, required_domains)
    }
}

/// The primary predicate: decides whether `event` is authorized to be applied to the room DAG,
/// given `auth_events` and `room_version`.
///
/// `do_sig_check` gates whether `verifier` is consulted at all (§4.6 step 1); when `false`,
/// `verifier` may be `None`.
#[instrument(skip_all, fields(event_id = %event.event_id, event_type = %event.event_type))]
pub fn check(
    room_version: &RoomVersion,
    event: &EventView,
    auth_events: &AuthEvents,
    do_sig_check: bool,
    verifier: Option<&dyn SignatureVerifier>,
) -> Result<(), AuthError> {
    info!("auth_check beginning");

    // Step 1: signature gate.
    if do_sig_check {
        let verifier = verifier.ok_or_else(|| {
            AuthError::new(
                AuthErrorKind::SignatureError,
                "signature check was requested but no verifier was supplied",
            )
        })?;
        let required_domains = vec![domain_of(&event.sender)?.to_owned()];
        verifier.verify(event, &required_domains).map_err(|mut e| {
            e.kind = AuthErrorKind::SignatureError;
            e
        })?;
    }

    // Step 2: the create event has no auth dependencies and a dedicated rule set.
    if event.event_type == EventType::Create {
        return check_create(event);
    }

    // Step 3: auth-events presence.
    let create_event = auth_events.create().ok_or_else(|| {
        AuthError::new(AuthErrorKind::MissingCreate, "no `m.room.create` event among auth events")
    })?;
    if !event.auth_events.iter().any(|id| id == &create_event.event_id) {
        return Err(AuthError::new(
            AuthErrorKind::MissingCreate,
            "candidate event does not list the room's create event in its auth_events",
        ));
    }
    if event.room_id != create_event.room_id {
        return Err(AuthError::new(
            AuthErrorKind::RoomIdMismatch,
            "candidate event's room_id does not match the create event's room_id",
        ));
    }

    let creator = create_event.sender.clone();

    // Step 4: sender membership, except for `m.room.member` (delegated to C5) and the
    // pre-MSC2432 `m.room.aliases` special case.
    let is_aliases_special_case =
        room_version.special_case_aliases_auth && event.event_type == EventType::Aliases;

    if event.event_type != EventType::Member && !is_aliases_special_case {
        let sender_membership = auth_events.member(&event.sender).map(|e| e.membership()).transpose()?;
        if sender_membership != Some(crate::event::Membership::Join) {
            return Err(AuthError::new(
                AuthErrorKind::SenderNotInRoom,
                "sender is not a joined member of the room",
            ));
        }
    }

    let power_levels = PowerLevelView::resolve(auth_events, room_version)?;
    let sender_level = power_levels.level_for_user(&event.sender, &creator);

    // Step 5: type-specific rules.
    match &event.event_type {
        EventType::Create => unreachable!("m.room.create is handled by the early return in step 2"),
        EventType::Member => {
            debug!("starting m.room.member check");
            membership::check_membership_change(room_version, event, auth_events, &power_levels, &creator)?;
        }
        EventType::PowerLevels => {
            debug!("starting m.room.power_levels check");
            check_power_levels(room_version, event, auth_events, sender_level)?;
        }
        EventType::JoinRules => {
            check_state_default(&power_levels, sender_level)?;
            if event.join_rule()? == crate::event::JoinRule::Restricted && !room_version.restricted_join_rule {
                return Err(AuthError::new(
                    AuthErrorKind::Forbidden,
                    "restricted join rule is not supported by this room version",
                ));
            }
        }
        EventType::Aliases => {
            if room_version.special_case_aliases_auth {
                debug!("starting m.room.aliases check");
                check_aliases(event)?;
            } else {
                check_can_send(event, &power_levels, sender_level)?;
            }
        }
        EventType::ThirdPartyInvite => {
            if sender_level < power_levels.invite {
                return Err(AuthError::new(
                    AuthErrorKind::InsufficientPower,
                    "sender cannot send third-party invites in this room",
                ));
            }
        }
        EventType::Redaction => {
            check_redaction(room_version, event, &power_levels, sender_level)?;
        }
        EventType::Other(_) => {
            check_can_send(event, &power_levels, sender_level)?;
        }
    }

    info!("event passed all authorization checks");
    Ok(())
}

fn check_create(event: &EventView) -> Result<(), AuthError> {
    debug!("starting m.room.create check");

    if event.state_key.as_deref() != Some("") {
        return Err(AuthError::new(AuthErrorKind::InvalidCreate, "create event must have an empty state key"));
    }
    if !event.prev_events.is_empty() {
        return Err(AuthError::new(AuthErrorKind::InvalidCreate, "create event must not have prev_events"));
    }
    if !event.auth_events.is_empty() {
        return Err(AuthError::new(AuthErrorKind::InvalidCreate, "create event must not have auth_events"));
    }

    let sender_domain = domain_of(&event.sender)?;
    let room_domain = domain_of(&event.room_id)?;
    if sender_domain != room_domain {
        return Err(AuthError::new(
            AuthErrorKind::InvalidCreate,
            "create event sender's domain must match the room id's domain",
        ));
    }

    let creator = event.creator()?.ok_or_else(|| {
        AuthError::new(AuthErrorKind::InvalidCreate, "create event content is missing `creator`")
    })?;
    if creator != event.sender {
        return Err(AuthError::new(
            AuthErrorKind::InvalidCreate,
            "create event content's `creator` must equal the sender",
        ));
    }

    info!("m.room.create event was allowed");
    Ok(())
}

fn check_aliases(event: &EventView) -> Result<(), AuthError> {
    let sender_domain = domain_of(&event.sender)?;
    let state_key = event.state_key.as_deref().unwrap_or("");
    if state_key.is_empty() || state_key != sender_domain {
        return Err(AuthError::with_field(
            AuthErrorKind::BadAliasStateKey,
            "state_key",
            "pre-MSC2432 alias events require a non-empty state_key equal to the sender's domain",
        ));
    }
    Ok(())
}

fn check_state_default(power_levels: &PowerLevelView, sender_level: i64) -> Result<(), AuthError> {
    if sender_level < power_levels.state_default {
        return Err(AuthError::new(
            AuthErrorKind::InsufficientPower,
            format!("sender's power level {sender_level} is below state_default {}", power_levels.state_default),
        ));
    }
    Ok(())
}

/// The generic "any other event" rule (§4.6 step 5, last bullet): the event-type's required
/// power level must not exceed the sender's, and a `@`-prefixed state key must match the sender.
fn check_can_send(event: &EventView, power_levels: &PowerLevelView, sender_level: i64) -> Result<(), AuthError> {
    let required = power_levels.level_for_sending(&event.event_type, event.is_state());
    if sender_level < required {
        return Err(AuthError::new(
            AuthErrorKind::InsufficientPower,
            format!("sender's power level {sender_level} is below the required level {required} for {}", event.event_type),
        ));
    }
    if let Some(state_key) = &event.state_key {
        if state_key.starts_with('@') && state_key != &event.sender {
            return Err(AuthError::with_field(
                AuthErrorKind::Forbidden,
                "state_key",
                "a state_key starting with '@' must match the sender",
            ));
        }
    }
    Ok(())
}

fn check_power_levels(
    room_version: &RoomVersion,
    event: &EventView,
    auth_events: &AuthEvents,
    sender_level: i64,
) -> Result<(), AuthError> {
    if event.state_key.as_deref() != Some("") {
        return Err(AuthError::new(
            AuthErrorKind::InvalidPowerLevels,
            "m.room.power_levels event must have an empty state key",
        ));
    }

    let new_view = PowerLevelView::from_content(&event.content, room_version)?;

    let Some(previous) = auth_events.power_levels() else {
        // No previous power-levels event in the room: allow (§4.4, exception clause).
        return Ok(());
    };
    let old_view = PowerLevelView::from_content(&previous.content, room_version)?;

    PowerLevelView::check_change_allowed(&old_view, &new_view, &event.sender, sender_level, room_version)
}

fn check_redaction(
    room_version: &RoomVersion,
    event: &EventView,
    power_levels: &PowerLevelView,
    sender_level: i64,
) -> Result<(), AuthError> {
    if sender_level >= power_levels.redact {
        return Ok(());
    }

    if !room_version.updated_redaction_rules {
        if let Some(redacted_id) = event.redacts()? {
            if let (Ok(sender_domain), Ok(redacted_domain)) =
                (domain_of(&event.sender), domain_of(&redacted_id))
            {
                if sender_domain == redacted_domain {
                    return Ok(());
                }
            }
        }
    }

    warn!("redaction rejected: insufficient power and no same-domain shortcut applies");
    Err(AuthError::new(
        AuthErrorKind::InsufficientPower,
        "sender cannot redact without sufficient power or a same-domain shortcut",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AuthEvents, EventType};
    use crate::room_version::lookup;
    use serde_json::json;

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

    fn base_room(room_id: &str, creator: &str) -> AuthEvents {
        let mut auth = AuthEvents::new();
        auth.insert("", create_event(creator, room_id));
        auth.insert(creator, member_event(room_id, creator, creator, "join"));
        auth
    }

    #[test]
    fn create_event_is_accepted() {
        let room_id = "!room:example.org";
        let ev = create_event("@creator:example.org", room_id);
        check(lookup("6").unwrap(), &ev, &AuthEvents::new(), false, None).unwrap();
    }

    #[test]
    fn create_event_domain_mismatch_is_rejected() {
        let ev = create_event("@creator:other.org", "!room:example.org");
        let err = check(lookup("6").unwrap(), &ev, &AuthEvents::new(), false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidCreate);
    }

    /// S1: a non-creator, non-privileged joined user cannot send a state event before any
    /// power-levels event exists.
    #[test]
    fn s1_state_event_from_non_creator_is_rejected() {
        let room_id = "!room:example.org";
        let mut auth = base_room(room_id, "@c:example.org");
        auth.insert("@j:example.org", member_event(room_id, "@j:example.org", "@j:example.org", "join"));

        let ev = EventView {
            event_type: EventType::Other("m.room.topic".to_owned()),
            sender: "@j:example.org".to_owned(),
            state_key: Some(String::new()),
            content: json!({"topic": "hi"}),
            room_id: room_id.to_owned(),
            depth: 2,
            event_id: "$topic:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        };

        let err = check(lookup("1").unwrap(), &ev, &auth, false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InsufficientPower);
    }

    /// S2: after a power-levels event sets `state_default:30`, a user at level 30 may send a
    /// state event but a user at level 29 may not.
    #[test]
    fn s2_power_level_threshold() {
        let room_id = "!room:example.org";
        let mut auth = base_room(room_id, "@c:example.org");
        auth.insert("@p:example.org", member_event(room_id, "@p:example.org", "@p:example.org", "join"));
        auth.insert("@k:example.org", member_event(room_id, "@k:example.org", "@k:example.org", "join"));
        auth.insert("", EventView {
            event_type: EventType::PowerLevels,
            sender: "@c:example.org".to_owned(),
            state_key: Some(String::new()),
            content: json!({"state_default": 30, "users": {"@p:example.org": 29, "@k:example.org": 30}}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$pl:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        });

        let make_ev = |sender: &str| EventView {
            event_type: EventType::Other("m.room.topic".to_owned()),
            sender: sender.to_owned(),
            state_key: Some(String::new()),
            content: json!({"topic": "hi"}),
            room_id: room_id.to_owned(),
            depth: 2,
            event_id: "$topic:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        };

        check(lookup("1").unwrap(), &make_ev("@k:example.org"), &auth, false, None).unwrap();
        let err = check(lookup("1").unwrap(), &make_ev("@p:example.org"), &auth, false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InsufficientPower);
    }

    /// S3/S4: the alias special case is version-gated.
    #[test]
    fn s3_alias_special_case_on_v1() {
        let room_id = "!room:example.org";
        let auth = base_room(room_id, "@c:example.org");

        let make_ev = |state_key: &str| EventView {
            event_type: EventType::Aliases,
            sender: "@c:example.org".to_owned(),
            state_key: Some(state_key.to_owned()),
            content: json!({"aliases": []}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$aliases:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        };

        check(lookup("1").unwrap(), &make_ev("example.org"), &auth, false, None).unwrap();
        assert!(matches!(
            check(lookup("1").unwrap(), &make_ev(""), &auth, false, None),
            Err(e) if e.kind == AuthErrorKind::BadAliasStateKey
        ));
        assert!(matches!(
            check(lookup("1").unwrap(), &make_ev("other.com"), &auth, false, None),
            Err(e) if e.kind == AuthErrorKind::BadAliasStateKey
        ));
    }

    #[test]
    fn s4_alias_special_case_off_on_v6() {
        let room_id = "!room:example.org";
        let auth = base_room(room_id, "@c:example.org");

        let make_ev = |state_key: &str| EventView {
            event_type: EventType::Aliases,
            sender: "@c:example.org".to_owned(),
            state_key: Some(state_key.to_owned()),
            content: json!({"aliases": []}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$aliases:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        };

        check(lookup("6").unwrap(), &make_ev(""), &auth, false, None).unwrap();
        check(lookup("6").unwrap(), &make_ev("other.com"), &auth, false, None).unwrap();
    }

    /// S5/S6: invite-only join requires prior invite membership.
    #[test]
    fn s5_s6_invite_only_join() {
        let room_id = "!room:example.org";
        let mut auth = base_room(room_id, "@c:example.org");
        auth.insert("", EventView {
            event_type: EventType::JoinRules,
            sender: "@c:example.org".to_owned(),
            state_key: Some(String::new()),
            content: json!({"join_rule": "invite"}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$jr:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        });

        let join_ev = member_event(room_id, "@p:example.org", "@p:example.org", "join");
        let err = check(lookup("6").unwrap(), &join_ev, &auth, false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidMembershipTransition);

        auth.insert("@p:example.org", member_event(room_id, "@c:example.org", "@p:example.org", "invite"));
        check(lookup("6").unwrap(), &join_ev, &auth, false, None).unwrap();
    }

    /// S7/S8: restricted join requires a valid `join_authorised_via_users_server`.
    #[test]
    fn s7_s8_restricted_join() {
        let room_id = "!room:example.org";
        let mut auth = base_room(room_id, "@c:example.org");
        auth.insert("", EventView {
            event_type: EventType::JoinRules,
            sender: "@c:example.org".to_owned(),
            state_key: Some(String::new()),
            content: json!({"join_rule": "restricted"}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$jr:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        });
        auth.insert("", EventView {
            event_type: EventType::PowerLevels,
            sender: "@c:example.org".to_owned(),
            state_key: Some(String::new()),
            content: json!({"invite": 0}),
            room_id: room_id.to_owned(),
            depth: 1,
            event_id: "$pl:example.org".to_owned(),
            prev_events: vec!["$create:example.org".to_owned()],
            auth_events: vec!["$create:example.org".to_owned()],
        });

        let mut join_ev = member_event(room_id, "@p:example.org", "@p:example.org", "join");
        let err = check(lookup("8").unwrap(), &join_ev, &auth, false, None).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::MissingAuthorisedVia);

        join_ev.content = json!({"membership": "join", "join_authorised_via_users_server": "@c:example.org"});
        check(lookup("8").unwrap(), &join_ev, &auth, false, None).unwrap();
    }

    /// Invariant: determinism — two calls on the same inputs agree.
    #[test]
    fn invariant_determinism() {
        let room_id = "!room:example.org";
        let ev = create_event("@c:example.org", room_id);
        let rv = lookup("6").unwrap();
        let r1 = check(rv, &ev, &AuthEvents::new(), false, None);
        let r2 = check(rv, &ev, &AuthEvents::new(), false, None);
        assert_eq!(r1.is_ok(), r2.is_ok());
    }
}
