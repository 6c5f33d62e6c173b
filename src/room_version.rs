//! Immutable table mapping a room version identifier to its behavioral flags.
//!
//! Grounded on `palpo-matrix-server-palpo`'s `state::room_version` module (the
//! `RoomDisposition`/`EventFormatVersion`/`StateResolutionVersion` enums), expanded per §3/§4.2
//! of the specification into the full flags record and a `const` registry. The source dispatches
//! per-version behavior through a record of booleans rather than a class hierarchy per version;
//! this module keeps that shape.

use crate::error::{AuthError, AuthErrorKind};

/// Disposition of a room version: whether it has a stable specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomDisposition {
    /// A room version that has a stable specification.
    Stable,
    /// A room version that is not yet fully specified.
    Unstable,
}

/// Determines the shape of event ids for a room version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormatVersion {
    /// `$id:server` event id format.
    V1,
    /// MSC1659-style `$hash` event id format, introduced for room v3.
    V2,
    /// MSC1884-style `$hash` format, introduced for room v4.
    V3,
}

/// Which state resolution algorithm a room version is coupled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateResolutionVersion {
    /// State resolution for rooms at version 1.
    V1,
    /// State resolution for room version 2 or later.
    V2,
}

/// The full set of behavioral flags for one room version.
///
/// Instances are `'static` and never constructed outside [`ROOM_VERSIONS`]; once published, a
/// record's flags never change (see §4.2 contract).
#[derive(Debug, Clone, Copy)]
pub struct RoomVersion {
    pub id: &'static str,
    pub disposition: RoomDisposition,
    pub event_format: EventFormatVersion,
    pub state_res: StateResolutionVersion,
    pub enforce_key_validity: bool,
    /// If true, `m.room.aliases` events have the pre-MSC2432 special-case authorization rule.
    pub special_case_aliases_auth: bool,
    /// If true, canonical JSON values must not contain floats, NaN, or integers outside
    /// ±(2^53−1).
    pub strict_canonicaljson: bool,
    /// MSC2209: power levels gate `notifications.room` as well as the other fields.
    pub limit_notifications_power_levels: bool,
    /// MSC2176: redaction no longer falls back to same-domain shortcut.
    pub updated_redaction_rules: bool,
    /// MSC3083: `join_rule: restricted` is a recognized join rule.
    pub restricted_join_rule: bool,
    /// MSC2403: `knock` membership and `join_rule: knock` are recognized.
    pub knocking: bool,
    /// MSC2716: historical (backfilled) events are accepted with relaxed depth/auth rules.
    pub historical_events: bool,
}

impl RoomVersion {
    /// Power levels accept decimal-string-encoded integers as well as native integers.
    ///
    /// This is the inverse of `strict_canonicaljson`: rooms that do not enforce strict canonical
    /// JSON must still interoperate with servers that serialized power levels as strings.
    pub fn integer_power_levels(&self) -> bool {
        !self.strict_canonicaljson
    }
}

macro_rules! room_version {
    (
        id: $id:literal,
        disposition: $disposition:ident,
        event_format: $event_format:ident,
        state_res: $state_res:ident,
        enforce_key_validity: $ekv:literal,
        special_case_aliases_auth: $alias:literal,
        strict_canonicaljson: $strict:literal,
        limit_notifications_power_levels: $notif:literal,
        updated_redaction_rules: $redact:literal,
        restricted_join_rule: $restricted:literal,
        knocking: $knock:literal,
        historical_events: $hist:literal $(,)?
    ) => {
        RoomVersion {
            id: $id,
            disposition: RoomDisposition::$disposition,
            event_format: EventFormatVersion::$event_format,
            state_res: StateResolutionVersion::$state_res,
            enforce_key_validity: $ekv,
            special_case_aliases_auth: $alias,
            strict_canonicaljson: $strict,
            limit_notifications_power_levels: $notif,
            updated_redaction_rules: $redact,
            restricted_join_rule: $restricted,
            knocking: $knock,
            historical_events: $hist,
        }
    };
}

/// The fixed, process-global table of known room versions.
///
/// Cross-checked against the specification's open question on MSC2716/MSC2403: each flag below
/// is set independently per the room-version table, rather than derived from another flag (see
/// `DESIGN.md`).
pub const ROOM_VERSIONS: &[RoomVersion] = &[
    room_version! {
        id: "1", disposition: Stable, event_format: V1, state_res: V1,
        enforce_key_validity: false, special_case_aliases_auth: true, strict_canonicaljson: false,
        limit_notifications_power_levels: false, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: false,
    },
    room_version! {
        id: "2", disposition: Stable, event_format: V1, state_res: V2,
        enforce_key_validity: false, special_case_aliases_auth: true, strict_canonicaljson: false,
        limit_notifications_power_levels: false, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: false,
    },
    room_version! {
        id: "3", disposition: Stable, event_format: V2, state_res: V2,
        enforce_key_validity: false, special_case_aliases_auth: true, strict_canonicaljson: false,
        limit_notifications_power_levels: false, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: false,
    },
    room_version! {
        id: "4", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: false, special_case_aliases_auth: true, strict_canonicaljson: false,
        limit_notifications_power_levels: false, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: false,
    },
    room_version! {
        id: "5", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: true, strict_canonicaljson: false,
        limit_notifications_power_levels: false, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: false,
    },
    room_version! {
        id: "6", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: false,
    },
    room_version! {
        id: "7", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: true, historical_events: false,
    },
    room_version! {
        id: "8", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: false,
        restricted_join_rule: true, knocking: true, historical_events: false,
    },
    room_version! {
        id: "9", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: false,
        restricted_join_rule: true, knocking: true, historical_events: false,
    },
    room_version! {
        id: "10", disposition: Stable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: true,
        restricted_join_rule: true, knocking: true, historical_events: false,
    },
    // MSC3083 v2: restricted joins with the "allow" rule shape, pre-dating room v8's stable
    // adoption. Kept unstable per the reverse-DNS naming convention in §4.2.
    room_version! {
        id: "org.matrix.msc3083.v2", disposition: Unstable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: false,
        restricted_join_rule: true, knocking: false, historical_events: false,
    },
    // MSC2716: historical events, independent of the knocking flag per the open question in §9.
    room_version! {
        id: "org.matrix.msc2716v4", disposition: Unstable, event_format: V3, state_res: V2,
        enforce_key_validity: true, special_case_aliases_auth: false, strict_canonicaljson: true,
        limit_notifications_power_levels: true, updated_redaction_rules: false,
        restricted_join_rule: false, knocking: false, historical_events: true,
    },
];

/// Looks up a room version by its identifier.
///
/// Returns [`AuthErrorKind::UnknownRoomVersion`] rather than panicking; the identifier space is
/// attacker-controlled (it arrives in every federation request).
pub fn lookup(id: &str) -> Result<&'static RoomVersion, AuthError> {
    ROOM_VERSIONS.iter().find(|v| v.id == id).ok_or_else(|| {
        AuthError::with_field(
            AuthErrorKind::UnknownRoomVersion,
            "room_version",
            format!("unrecognized room version: {id:?}"),
        )
    })
}

/// A capability identifier, as exposed by [`capabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Knock,
    Restricted,
    LimitNotificationsPowerLevels,
    UpdatedRedactionRules,
    HistoricalEvents,
}

/// The set of room versions supporting a capability, plus the preferred (highest stable, else
/// highest unstable) version among them.
#[derive(Debug, Clone)]
pub struct CapabilitySupport {
    pub preferred_version: &'static str,
    pub supporting_versions: Vec<&'static str>,
}

fn predicate_for(capability: Capability) -> impl Fn(&RoomVersion) -> bool {
    move |v: &RoomVersion| match capability {
        Capability::Knock => v.knocking,
        Capability::Restricted => v.restricted_join_rule,
        Capability::LimitNotificationsPowerLevels => v.limit_notifications_power_levels,
        Capability::UpdatedRedactionRules => v.updated_redaction_rules,
        Capability::HistoricalEvents => v.historical_events,
    }
}

/// Computes, for each [`Capability`], the room versions supporting it and a preferred version.
///
/// Pure function of [`ROOM_VERSIONS`]; see §4.2 and invariant 6 in §8 (the `knock` capability
/// enumerates exactly the versions with `knocking = true`, and vice versa).
pub fn room_version_capabilities() -> Vec<(Capability, CapabilitySupport)> {
    [
        Capability::Knock,
        Capability::Restricted,
        Capability::LimitNotificationsPowerLevels,
        Capability::UpdatedRedactionRules,
        Capability::HistoricalEvents,
    ]
    .into_iter()
    .map(|cap| {
        let pred = predicate_for(cap);
        let supporting: Vec<&'static str> =
            ROOM_VERSIONS.iter().filter(|v| pred(v)).map(|v| v.id).collect();
        let preferred = supporting
            .iter()
            .rev()
            .find(|id| {
                ROOM_VERSIONS
                    .iter()
                    .find(|v| &v.id == *id)
                    .is_some_and(|v| v.disposition == RoomDisposition::Stable)
            })
            .or_else(|| supporting.last())
            .copied()
            .unwrap_or("");
        (cap, CapabilitySupport { preferred_version: preferred, supporting_versions: supporting })
    })
    .collect()
}
