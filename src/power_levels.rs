//! Interprets an `m.room.power_levels` event into a query interface (C4, §4.4).
//!
//! Grounded on `palpo-matrix-server-palpo`'s `state::power_levels` module: the teacher
//! deserializes power levels through a pair of structs (`RoomPowerLevelsEventContent` for
//! strict-JSON rooms, `IntRoomPowerLevelsEventContent` for old rooms that stored levels as
//! decimal strings) and converts between them with `From`. Here the two paths are unified into
//! one coercion function since the engine only needs the *values*, not a serializable content
//! struct to round-trip.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{AuthError, AuthErrorKind};
use crate::event::{AuthEvents, EventType};
use crate::room_version::RoomVersion;

/// Room-version-independent defaults used when a field is absent from the power-levels content,
/// or when there is no power-levels event at all (§4.4.1). `users_default` and `events_default`
/// are not included here: they default to `0`.
const DEFAULT_POWER_LEVEL: i64 = 50;

/// The fields consulted for the "ops can't exceed their own level" comparison rule (§4.4).
pub const COMPARED_SCALAR_FIELDS: &[&str] =
    &["users_default", "events_default", "state_default", "ban", "redact", "kick", "invite"];

/// A derived, read-only view over an `m.room.power_levels` event's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerLevelView {
    pub users_default: i64,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
    pub users: BTreeMap<String, i64>,
    pub events: BTreeMap<String, i64>,
    pub notifications: BTreeMap<String, i64>,
    /// Whether this view was derived from an explicit power-levels event, as opposed to the
    /// room-version-independent defaults. Once an explicit `users` map exists the creator has no
    /// permanent privilege (§4.4.3).
    has_explicit_event: bool,
}

impl PowerLevelView {
    /// The defaults used when no `m.room.power_levels` event is present in the room (§4.4.1).
    fn defaults() -> Self {
        Self {
            users_default: 0,
            events_default: 0,
            state_default: DEFAULT_POWER_LEVEL,
            ban: DEFAULT_POWER_LEVEL,
            kick: DEFAULT_POWER_LEVEL,
            redact: DEFAULT_POWER_LEVEL,
            invite: DEFAULT_POWER_LEVEL,
            users: BTreeMap::new(),
            events: BTreeMap::new(),
            notifications: BTreeMap::new(),
            has_explicit_event: false,
        }
    }

    /// Derives a [`PowerLevelView`] from the power-levels auth event, if any, falling back to
    /// the room-version-independent defaults otherwise.
    pub fn resolve(auth_events: &AuthEvents, room_version: &RoomVersion) -> Result<Self, AuthError> {
        match auth_events.power_levels() {
            None => Ok(Self::defaults()),
            Some(event) => Self::from_content(&event.content, room_version),
        }
    }

    /// Parses and coerces `content` directly (used both by [`Self::resolve`] and by the
    /// power-levels-change comparison, which needs a view of the *candidate* event's content
    /// before it is accepted as an auth event).
    pub fn from_content(content: &Value, room_version: &RoomVersion) -> Result<Self, AuthError> {
        let obj = content.as_object().ok_or_else(|| {
            AuthError::new(AuthErrorKind::InvalidPowerLevels, "power_levels content is not an object")
        })?;

        let mut view = Self::defaults();
        view.has_explicit_event = true;

        if let Some(v) = obj.get("users_default") {
            view.users_default = coerce_i64(v, "users_default", room_version)?;
        }
        if let Some(v) = obj.get("events_default") {
            view.events_default = coerce_i64(v, "events_default", room_version)?;
        }
        if let Some(v) = obj.get("state_default") {
            view.state_default = coerce_i64(v, "state_default", room_version)?;
        }
        if let Some(v) = obj.get("ban") {
            view.ban = coerce_i64(v, "ban", room_version)?;
        }
        if let Some(v) = obj.get("kick") {
            view.kick = coerce_i64(v, "kick", room_version)?;
        }
        if let Some(v) = obj.get("redact") {
            view.redact = coerce_i64(v, "redact", room_version)?;
        }
        if let Some(v) = obj.get("invite") {
            view.invite = coerce_i64(v, "invite", room_version)?;
        }

        if let Some(users) = obj.get("users") {
            view.users = coerce_map(users, "users", room_version)?;
        }
        if let Some(events) = obj.get("events") {
            view.events = coerce_map(events, "events", room_version)?;
        }
        if let Some(notifications) = obj.get("notifications") {
            view.notifications = coerce_map(notifications, "notifications", room_version)?;
        }

        Ok(view)
    }

    /// `level_for_user(u) = users.get(u, users_default)` (§4.4.3).
    ///
    /// `creator` is consulted only when this view was derived from the room-version-independent
    /// defaults (no explicit power-levels event exists yet); once a power-levels event exists the
    /// creator has no permanent privilege, per §4.4 and invariant 2 in §8.
    pub fn level_for_user(&self, user_id: &str, creator: &str) -> i64 {
        if let Some(level) = self.users.get(user_id) {
            return *level;
        }
        if !self.has_explicit_event && user_id == creator {
            return 100;
        }
        self.users_default
    }

    /// `level_for_sending(type, is_state) = events.get(type, state_default if is_state else
    /// events_default)` (§4.4.4).
    pub fn level_for_sending(&self, event_type: &EventType, is_state: bool) -> i64 {
        if let Some(level) = self.events.get(event_type.as_str()) {
            return *level;
        }
        if is_state {
            self.state_default
        } else {
            self.events_default
        }
    }

    /// Applies the power-level change comparison rule (§4.4): for each changed key in `users`,
    /// `events`, and (if the room version limits notification levels) `notifications`, the
    /// sender must have a level strictly greater than *both* the old and the new value. The
    /// sender may not raise their own `users` entry above their current level either.
    pub fn check_change_allowed(
        old: &PowerLevelView,
        new: &PowerLevelView,
        sender: &str,
        sender_level: i64,
        room_version: &RoomVersion,
    ) -> Result<(), AuthError> {
        let mut user_keys: Vec<&String> = old.users.keys().chain(new.users.keys()).collect();
        user_keys.sort();
        user_keys.dedup();
        for user in user_keys {
            let old_level = old.users.get(user).copied();
            let new_level = new.users.get(user).copied();
            if old_level == new_level {
                continue;
            }
            if user == sender {
                if let Some(new_level) = new_level {
                    if new_level > sender_level {
                        return Err(forbidden_power_change(user));
                    }
                }
            }
            if old_level.is_some_and(|l| l > sender_level) || new_level.is_some_and(|l| l > sender_level) {
                return Err(forbidden_power_change(user));
            }
        }

        let mut event_keys: Vec<&String> = old.events.keys().chain(new.events.keys()).collect();
        event_keys.sort();
        event_keys.dedup();
        for ev_type in event_keys {
            let old_level = old.events.get(ev_type).copied();
            let new_level = new.events.get(ev_type).copied();
            if old_level == new_level {
                continue;
            }
            if old_level.is_some_and(|l| l > sender_level) || new_level.is_some_and(|l| l > sender_level) {
                return Err(forbidden_power_change(ev_type));
            }
        }

        if room_version.limit_notifications_power_levels {
            let mut notif_keys: Vec<&String> =
                old.notifications.keys().chain(new.notifications.keys()).collect();
            notif_keys.sort();
            notif_keys.dedup();
            for key in notif_keys {
                let old_level = old.notifications.get(key).copied();
                let new_level = new.notifications.get(key).copied();
                if old_level == new_level {
                    continue;
                }
                if old_level.is_some_and(|l| l > sender_level)
                    || new_level.is_some_and(|l| l > sender_level)
                {
                    return Err(forbidden_power_change(key));
                }
            }
        }

        for field in COMPARED_SCALAR_FIELDS {
            let (old_level, new_level) = (old.scalar(field), new.scalar(field));
            if old_level == new_level {
                continue;
            }
            if old_level > sender_level || new_level > sender_level {
                return Err(forbidden_power_change(field));
            }
        }

        Ok(())
    }

    fn scalar(&self, field: &str) -> i64 {
        match field {
            "users_default" => self.users_default,
            "events_default" => self.events_default,
            "state_default" => self.state_default,
            "ban" => self.ban,
            "redact" => self.redact,
            "kick" => self.kick,
            "invite" => self.invite,
            _ => 0,
        }
    }
}

fn forbidden_power_change(field: &str) -> AuthError {
    AuthError::with_field(
        AuthErrorKind::InsufficientPower,
        field,
        format!("sender cannot change power-level field {field:?} beyond their own level"),
    )
}

/// Coerces a JSON value to `i64`, rejecting floats, NaN, and out-of-64-bit-range values.
///
/// Strings parse as integers only when `room_version.integer_power_levels()` is true (i.e. the
/// room version does not enforce strict canonical JSON); a strict room rejects a string-typed
/// power level outright.
fn coerce_i64(value: &Value, field: &str, room_version: &RoomVersion) -> Result<i64, AuthError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            AuthError::with_field(
                AuthErrorKind::InvalidPowerLevels,
                field,
                format!("power level {field:?} is not a valid 64-bit integer"),
            )
        }),
        Value::String(s) if room_version.integer_power_levels() => s.parse::<i64>().map_err(|_| {
            AuthError::with_field(
                AuthErrorKind::InvalidPowerLevels,
                field,
                format!("power level {field:?} is not a coercible integer string"),
            )
        }),
        other => Err(AuthError::with_field(
            AuthErrorKind::InvalidPowerLevels,
            field,
            format!("power level {field:?} has unsupported type: {other:?}"),
        )),
    }
}

fn coerce_map(
    value: &Value,
    field: &str,
    room_version: &RoomVersion,
) -> Result<BTreeMap<String, i64>, AuthError> {
    let obj = value.as_object().ok_or_else(|| {
        AuthError::with_field(AuthErrorKind::InvalidPowerLevels, field, format!("{field:?} is not an object"))
    })?;

    let mut map = BTreeMap::new();
    for (key, v) in obj {
        map.insert(key.clone(), coerce_i64(v, field, room_version)?);
    }
    Ok(map)
}
