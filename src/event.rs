//! Read-only projection of a room event and the auth-events lookup map.
//!
//! Grounded on `palpo`'s `TimelineEventType`/`StateEventType` enums and its `Event` accessor
//! trait (`state/event_auth.rs`, `state/event_auth/mod.rs`). The engine never owns a full event
//! type (hashing, redaction, signing are out of scope per §1) — it only needs the projection
//! described in §3, so this module defines a concrete `EventView` rather than a generic `Event`
//! trait parameterized over a caller's storage type.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AuthError, AuthErrorKind};

/// The well-known event types the engine has dedicated authorization rules for.
///
/// Mirrors `palpo_core::events::TimelineEventType`'s shape: a fixed set of well-known variants
/// plus a catch-all for everything else (message events, custom state events, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Create,
    Member,
    PowerLevels,
    JoinRules,
    Aliases,
    ThirdPartyInvite,
    Redaction,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "m.room.create",
            Self::Member => "m.room.member",
            Self::PowerLevels => "m.room.power_levels",
            Self::JoinRules => "m.room.join_rules",
            Self::Aliases => "m.room.aliases",
            Self::ThirdPartyInvite => "m.room.third_party_invite",
            Self::Redaction => "m.room.redaction",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "m.room.create" => Self::Create,
            "m.room.member" => Self::Member,
            "m.room.power_levels" => Self::PowerLevels,
            "m.room.join_rules" => Self::JoinRules,
            "m.room.aliases" => Self::Aliases,
            "m.room.third_party_invite" => Self::ThirdPartyInvite,
            "m.room.redaction" => Self::Redaction,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A membership value, as recorded in an `m.room.member` event's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Knock,
    Leave,
    Ban,
}

/// `m.room.join_rules` content's `join_rule` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRule {
    Public,
    Invite,
    Knock,
    Restricted,
    Private,
}

/// Read-only projection of an event, as required by §3.
///
/// Performs no content validation beyond what the caller already guarantees (`type` and
/// `sender` present); everything else is validated lazily, per-rule, in [`crate::auth`].
#[derive(Debug, Clone)]
pub struct EventView {
    pub event_type: EventType,
    pub sender: String,
    pub state_key: Option<String>,
    pub content: Value,
    pub room_id: String,
    pub depth: i64,
    pub event_id: String,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
}

impl EventView {
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Deserializes a typed view of `content`, wrapping failures as
    /// [`AuthErrorKind::Forbidden`] (malformed content is always a rejection, never a panic).
    pub fn content_as<T: for<'de> Deserialize<'de>>(&self, field: &str) -> Result<T, AuthError> {
        serde_json::from_value(self.content.clone())
            .map_err(|e| AuthError::from_json(AuthErrorKind::Forbidden, field, e))
    }

    /// The `membership` field of an `m.room.member` event's content.
    pub fn membership(&self) -> Result<Membership, AuthError> {
        #[derive(Deserialize)]
        struct Fields {
            membership: Membership,
        }
        self.content_as::<Fields>("membership").map(|f| f.membership)
    }

    /// The `join_authorised_via_users_server` field of an `m.room.member` event's content.
    pub fn join_authorised_via_users_server(&self) -> Result<Option<String>, AuthError> {
        #[derive(Deserialize, Default)]
        struct Fields {
            #[serde(default)]
            join_authorised_via_users_server: Option<String>,
        }
        self.content_as::<Fields>("join_authorised_via_users_server")
            .map(|f| f.join_authorised_via_users_server)
    }

    /// The `creator` field of an `m.room.create` event's content.
    pub fn creator(&self) -> Result<Option<String>, AuthError> {
        #[derive(Deserialize, Default)]
        struct Fields {
            #[serde(default)]
            creator: Option<String>,
        }
        self.content_as::<Fields>("creator").map(|f| f.creator)
    }

    /// The `join_rule` field of an `m.room.join_rules` event's content.
    pub fn join_rule(&self) -> Result<JoinRule, AuthError> {
        #[derive(Deserialize)]
        struct Fields {
            join_rule: JoinRule,
        }
        self.content_as::<Fields>("join_rule").map(|f| f.join_rule)
    }

    /// The event id named by `redacts`, for `m.room.redaction` events.
    pub fn redacts(&self) -> Result<Option<String>, AuthError> {
        #[derive(Deserialize, Default)]
        struct Fields {
            #[serde(default)]
            redacts: Option<String>,
        }
        self.content_as::<Fields>("redacts").map(|f| f.redacts)
    }
}

/// The `(type, state_key)` key used to index auth events, per §3.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthEventKey(pub EventType, pub String);

/// A mapping from `(type, state_key)` to an event view, with at most one entry per key.
///
/// Grounded on the teacher's `fetch_state: impl Fn(&StateEventType, &str) -> Option<E>` closures
/// (`event_auth.rs::auth_check`), but expressed as a concrete map rather than a callback, since
/// the engine is specified as a pure function over in-memory values (§5) rather than something
/// that may need to fetch state lazily.
#[derive(Debug, Clone, Default)]
pub struct AuthEvents {
    by_key: BTreeMap<AuthEventKey, EventView>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `event` under `(event.event_type.clone(), state_key)`.
    ///
    /// Replaces an existing entry at the same key (the map structurally permits at most one
    /// value per key; there is no insertion-order dependency, per §9).
    pub fn insert(&mut self, state_key: impl Into<String>, event: EventView) {
        let key = AuthEventKey(event.event_type.clone(), state_key.into());
        self.by_key.insert(key, event);
    }

    pub fn get(&self, event_type: &EventType, state_key: &str) -> Option<&EventView> {
        self.by_key.get(&AuthEventKey(event_type.clone(), state_key.to_owned()))
    }

    pub fn create(&self) -> Option<&EventView> {
        self.get(&EventType::Create, "")
    }

    pub fn power_levels(&self) -> Option<&EventView> {
        self.get(&EventType::PowerLevels, "")
    }

    pub fn join_rules(&self) -> Option<&EventView> {
        self.get(&EventType::JoinRules, "")
    }

    pub fn member(&self, user_id: &str) -> Option<&EventView> {
        self.get(&EventType::Member, user_id)
    }

    pub fn third_party_invite(&self, token: &str) -> Option<&EventView> {
        self.get(&EventType::ThirdPartyInvite, token)
    }

    pub fn contains_event_id(&self, event_id: &str) -> bool {
        self.by_key.values().any(|e| e.event_id == event_id)
    }
}

/// Computes the `(type, state_key)` pairs a candidate event's auth chain is expected to name.
///
/// Grounded on `event_auth/mod.rs::auth_types_for_event`: the `m.room.create` event has no auth
/// dependencies; every other event depends on the current power-levels event and the sender's
/// member event; `m.room.member` events additionally depend on the join-rules event (when the
/// membership is join/invite/knock), the target's member event, and — for invites carrying a
/// third-party-invite token, or restricted joins — the relevant third-party-invite or authorizing
/// member event.
pub fn auth_types_for_event(
    event_type: &EventType,
    sender: &str,
    state_key: Option<&str>,
    content: &Value,
) -> Result<Vec<AuthEventKey>, AuthError> {
    if *event_type == EventType::Create {
        return Ok(vec![]);
    }

    let mut keys = vec![
        AuthEventKey(EventType::PowerLevels, String::new()),
        AuthEventKey(EventType::Member, sender.to_owned()),
        AuthEventKey(EventType::Create, String::new()),
    ];

    if *event_type == EventType::Member {
        let Some(state_key) = state_key else {
            return Err(AuthError::with_field(
                AuthErrorKind::Forbidden,
                "state_key",
                "missing `state_key` field for `m.room.member` event",
            ));
        };

        let target_key = AuthEventKey(EventType::Member, state_key.to_owned());
        if !keys.contains(&target_key) {
            keys.push(target_key);
        }

        #[derive(Deserialize)]
        struct MemberFields {
            membership: Option<Membership>,
            #[serde(default)]
            third_party_invite: Option<ThirdPartyInviteToken>,
            #[serde(default)]
            join_authorised_via_users_server: Option<String>,
        }
        #[derive(Deserialize)]
        struct ThirdPartyInviteToken {
            signed: SignedToken,
        }
        #[derive(Deserialize)]
        struct SignedToken {
            token: String,
        }

        let fields: MemberFields = serde_json::from_value(content.clone())
            .map_err(|e| AuthError::from_json(AuthErrorKind::Forbidden, "content", e))?;

        if let Some(membership) = fields.membership {
            if matches!(membership, Membership::Join | Membership::Invite | Membership::Knock) {
                let join_rules_key = AuthEventKey(EventType::JoinRules, String::new());
                if !keys.contains(&join_rules_key) {
                    keys.push(join_rules_key);
                }
            }

            if membership == Membership::Invite {
                if let Some(tpi) = fields.third_party_invite {
                    let key = AuthEventKey(EventType::ThirdPartyInvite, tpi.signed.token);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }

            if membership == Membership::Join {
                if let Some(user_id) = fields.join_authorised_via_users_server {
                    let key = AuthEventKey(EventType::Member, user_id);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view(event_type: EventType, sender: &str, state_key: Option<&str>, content: Value) -> EventView {
        EventView {
            event_type,
            sender: sender.to_owned(),
            state_key: state_key.map(str::to_owned),
            content,
            room_id: "!room:example.org".to_owned(),
            depth: 1,
            event_id: "$event:example.org".to_owned(),
            prev_events: vec![],
            auth_events: vec![],
        }
    }

    #[test]
    fn auth_events_map_round_trips() {
        let mut map = AuthEvents::new();
        map.insert("", view(EventType::Create, "@alice:example.org", Some(""), json!({})));
        assert!(map.create().is_some());
        assert!(map.power_levels().is_none());
    }

    #[test]
    fn auth_types_for_create_is_empty() {
        let keys = auth_types_for_event(&EventType::Create, "@alice:example.org", Some(""), &json!({}))
            .unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn auth_types_for_join_includes_join_rules() {
        let content = json!({"membership": "join"});
        let keys = auth_types_for_event(
            &EventType::Member,
            "@alice:example.org",
            Some("@alice:example.org"),
            &content,
        )
        .unwrap();
        assert!(keys.contains(&AuthEventKey(EventType::JoinRules, String::new())));
    }
}
