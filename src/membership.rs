//! Computes the set of valid membership transitions for a user (C5, §4.5).
//!
//! Grounded on `palpo-matrix-server-palpo`'s `state::event_auth::room_member` module
//! (`check_room_member_join`/`_invite`/`_leave`/`_ban`/`_knock`), re-expressed as a synchronous
//! function over an in-memory [`AuthEvents`] map instead of the teacher's `async fn ... Fetch:
//! Fn(...) -> Fut` closures, per the "pure, single-invocation" contract in §5.

use crate::error::{AuthError, AuthErrorKind};
use crate::event::{AuthEvents, EventView, JoinRule, Membership};
use crate::power_levels::PowerLevelView;
use crate::room_version::RoomVersion;

/// Checks whether `event` (an `m.room.member` state event) is an authorized membership
/// transition, given the current room state in `auth_events`.
pub fn check_membership_change(
    room_version: &RoomVersion,
    event: &EventView,
    auth_events: &AuthEvents,
    power_levels: &PowerLevelView,
    creator: &str,
) -> Result<(), AuthError> {
    let target_user = event.state_key.as_deref().ok_or_else(|| {
        AuthError::with_field(
            AuthErrorKind::InvalidMembershipTransition,
            "state_key",
            "missing `state_key` field in `m.room.member` event",
        )
    })?;
    let target_membership = event.membership()?;
    let sender = event.sender.as_str();

    match target_membership {
        Membership::Join => check_join(room_version, event, target_user, auth_events, power_levels, creator),
        Membership::Invite => check_invite(event, target_user, auth_events, power_levels, creator),
        Membership::Leave => check_leave(room_version, event, target_user, auth_events, power_levels, creator),
        Membership::Ban => check_ban(event, target_user, auth_events, power_levels, creator),
        Membership::Knock if room_version.knocking => check_knock(event, target_user, sender, auth_events),
        Membership::Knock => Err(AuthError::new(
            AuthErrorKind::InvalidMembershipTransition,
            "knock membership is not supported by this room version",
        )),
    }
}

fn current_membership(auth_events: &AuthEvents, user_id: &str) -> Result<Option<Membership>, AuthError> {
    match auth_events.member(user_id) {
        None => Ok(None),
        Some(event) => event.membership().map(Some),
    }
}

fn join_rule(auth_events: &AuthEvents) -> Result<JoinRule, AuthError> {
    match auth_events.join_rules() {
        None => Ok(JoinRule::Invite),
        Some(event) => event.join_rule(),
    }
}

/// The sole previous event being the create event, and the target being the creator: the
/// room's implicit bootstrap join (§4.5 table row, "any → join (self)" via the create event).
fn is_bootstrap_creator_join(
    event: &EventView,
    target_user: &str,
    creator: &str,
    auth_events: &AuthEvents,
) -> bool {
    if target_user != creator || event.sender != creator {
        return false;
    }
    let Some(create_event) = auth_events.create() else {
        return false;
    };
    let mut prev = event.prev_events.iter();
    let first_is_create = prev.next().is_some_and(|id| *id == create_event.event_id);
    first_is_create && prev.next().is_none()
}

fn check_join(
    room_version: &RoomVersion,
    event: &EventView,
    target_user: &str,
    auth_events: &AuthEvents,
    power_levels: &PowerLevelView,
    creator: &str,
) -> Result<(), AuthError> {
    if is_bootstrap_creator_join(event, target_user, creator, auth_events) {
        return Ok(());
    }

    if event.sender != target_user {
        return Err(AuthError::new(
            AuthErrorKind::InvalidMembershipTransition,
            "sender of join event must match target user; force-join is never authorized",
        ));
    }

    let current = current_membership(auth_events, target_user)?;
    if current == Some(Membership::Ban) {
        return Err(AuthError::new(AuthErrorKind::Banned, "banned user cannot join room"));
    }

    let rule = join_rule(auth_events)?;

    if rule == JoinRule::Public {
        return Ok(());
    }

    if (rule == JoinRule::Invite || (room_version.knocking && rule == JoinRule::Knock))
        && matches!(current, Some(Membership::Invite) | Some(Membership::Join))
    {
        return Ok(());
    }

    if room_version.restricted_join_rule && rule == JoinRule::Restricted {
        if matches!(current, Some(Membership::Invite) | Some(Membership::Join)) {
            return Ok(());
        }

        let Some(authorizer) = event.join_authorised_via_users_server()? else {
            return Err(AuthError::new(
                AuthErrorKind::MissingAuthorisedVia,
                "restricted join requires `join_authorised_via_users_server` when not already invited or joined",
            ));
        };

        let authorizer_membership = current_membership(auth_events, &authorizer)?;
        if authorizer_membership != Some(Membership::Join) {
            return Err(AuthError::with_field(
                AuthErrorKind::UnauthorisedVia,
                "join_authorised_via_users_server",
                "named authorizing user is not currently joined",
            ));
        }

        let authorizer_level = power_levels.level_for_user(&authorizer, creator);
        if authorizer_level >= power_levels.invite {
            return Ok(());
        }
        return Err(AuthError::with_field(
            AuthErrorKind::UnauthorisedVia,
            "join_authorised_via_users_server",
            "named authorizing user does not have sufficient invite power",
        ));
    }

    Err(AuthError::new(
        AuthErrorKind::InvalidMembershipTransition,
        "cannot join a room that is not public, or without a qualifying prior membership",
    ))
}

fn check_invite(
    event: &EventView,
    target_user: &str,
    auth_events: &AuthEvents,
    power_levels: &PowerLevelView,
    creator: &str,
) -> Result<(), AuthError> {
    let target_current = current_membership(auth_events, target_user)?;
    if target_current == Some(Membership::Ban) {
        return Err(AuthError::new(AuthErrorKind::Banned, "cannot invite a banned user"));
    }

    if matches!(target_current, Some(Membership::Join)) {
        return Err(AuthError::new(
            AuthErrorKind::InvalidMembershipTransition,
            "cannot invite a user who is already joined",
        ));
    }

    if let Some(token) = third_party_invite_token(event)? {
        return check_third_party_invite(event, target_user, &token, auth_events);
    }

    let sender_membership = current_membership(auth_events, &event.sender)?;
    if sender_membership != Some(Membership::Join) {
        return Err(AuthError::new(
            AuthErrorKind::SenderNotInRoom,
            "cannot invite unless the sender is joined",
        ));
    }

    let sender_level = power_levels.level_for_user(&event.sender, creator);
    if sender_level < power_levels.invite {
        return Err(AuthError::new(
            AuthErrorKind::InsufficientPower,
            "sender does not have enough power to invite",
        ));
    }

    Ok(())
}

/// The `third_party_invite.signed.token` field of an invite event's content, if present.
///
/// Grounded on `state::event_auth::room_member::check_third_party_invite`: a third-party invite
/// is accepted by the invited server sending the `m.room.member` invite on the target's behalf,
/// bypassing the usual sender-must-be-joined and sender-has-invite-power checks in favour of
/// validating the referenced `m.room.third_party_invite` event (§4.5, "third-party-invite variant
/// validates the signed token").
fn third_party_invite_token(event: &EventView) -> Result<Option<String>, AuthError> {
    #[derive(serde::Deserialize, Default)]
    struct Fields {
        #[serde(default)]
        third_party_invite: Option<ThirdPartyInvite>,
    }
    #[derive(serde::Deserialize)]
    struct ThirdPartyInvite {
        signed: SignedToken,
    }
    #[derive(serde::Deserialize)]
    struct SignedToken {
        mxid: String,
        token: String,
    }

    let fields: Fields = event.content_as("third_party_invite")?;
    Ok(fields.third_party_invite.map(|tpi| {
        let _ = &tpi.signed.mxid;
        tpi.signed.token
    }))
}

fn check_third_party_invite(
    event: &EventView,
    target_user: &str,
    token: &str,
    auth_events: &AuthEvents,
) -> Result<(), AuthError> {
    #[derive(serde::Deserialize)]
    struct SignedFields {
        mxid: String,
    }
    #[derive(serde::Deserialize)]
    struct ContentFields {
        third_party_invite: ThirdPartyInviteFields,
    }
    #[derive(serde::Deserialize)]
    struct ThirdPartyInviteFields {
        signed: SignedFields,
    }

    let invite_event = auth_events.third_party_invite(token).ok_or_else(|| {
        AuthError::with_field(
            AuthErrorKind::Forbidden,
            "third_party_invite",
            "no matching m.room.third_party_invite event for this token",
        )
    })?;

    let fields: ContentFields = event
        .content_as("third_party_invite")
        .map_err(|e| AuthError::with_field(AuthErrorKind::Forbidden, "third_party_invite", e.to_string()))?;
    if fields.third_party_invite.signed.mxid != target_user {
        return Err(AuthError::with_field(
            AuthErrorKind::Forbidden,
            "third_party_invite",
            "signed mxid does not match the invited user",
        ));
    }

    let _ = invite_event;
    Ok(())
}

fn check_leave(
    room_version: &RoomVersion,
    event: &EventView,
    target_user: &str,
    auth_events: &AuthEvents,
    power_levels: &PowerLevelView,
    creator: &str,
) -> Result<(), AuthError> {
    let sender = event.sender.as_str();

    if sender == target_user {
        let current = current_membership(auth_events, target_user)?;
        return match current {
            Some(Membership::Ban) => Err(AuthError::new(
                AuthErrorKind::InvalidMembershipTransition,
                "a banned user cannot leave (un-ban requires the banner or another privileged user)",
            )),
            Some(Membership::Join) | Some(Membership::Invite) => Ok(()),
            Some(Membership::Knock) if room_version.knocking => Ok(()),
            _ => Err(AuthError::new(
                AuthErrorKind::InvalidMembershipTransition,
                "cannot leave a room that was never joined, invited, or knocked on",
            )),
        };
    }

    // Kick or un-ban: the sender must be joined.
    let sender_membership = current_membership(auth_events, sender)?;
    if sender_membership != Some(Membership::Join) {
        return Err(AuthError::new(
            AuthErrorKind::SenderNotInRoom,
            "cannot kick or un-ban unless the sender is joined",
        ));
    }

    let sender_level = power_levels.level_for_user(sender, creator);
    let target_current = current_membership(auth_events, target_user)?;
    let target_level = power_levels.level_for_user(target_user, creator);

    if target_current == Some(Membership::Ban) {
        if sender_level < power_levels.ban {
            return Err(AuthError::new(
                AuthErrorKind::InsufficientPower,
                "sender does not have enough power to un-ban",
            ));
        }
    }

    if sender_level >= power_levels.kick && target_level < sender_level {
        Ok(())
    } else {
        Err(AuthError::new(
            AuthErrorKind::InsufficientPower,
            "sender does not have enough power to kick or un-ban the target user",
        ))
    }
}

fn check_ban(
    event: &EventView,
    target_user: &str,
    auth_events: &AuthEvents,
    power_levels: &PowerLevelView,
    creator: &str,
) -> Result<(), AuthError> {
    let sender = event.sender.as_str();
    let sender_membership = current_membership(auth_events, sender)?;
    if sender_membership != Some(Membership::Join) {
        return Err(AuthError::new(AuthErrorKind::SenderNotInRoom, "cannot ban unless the sender is joined"));
    }

    let sender_level = power_levels.level_for_user(sender, creator);
    let target_level = power_levels.level_for_user(target_user, creator);

    if sender_level >= power_levels.ban && target_level < sender_level {
        Ok(())
    } else {
        Err(AuthError::new(
            AuthErrorKind::InsufficientPower,
            "sender does not have enough power to ban the target user",
        ))
    }
}

fn check_knock(
    event: &EventView,
    target_user: &str,
    sender: &str,
    auth_events: &AuthEvents,
) -> Result<(), AuthError> {
    let rule = join_rule(auth_events)?;
    if rule != JoinRule::Knock {
        return Err(AuthError::new(
            AuthErrorKind::InvalidMembershipTransition,
            "join rule is not set to knock; knocking is not allowed",
        ));
    }

    if sender != target_user {
        return Err(AuthError::new(
            AuthErrorKind::InvalidMembershipTransition,
            "cannot make another user knock; sender must match target user",
        ));
    }

    let current = current_membership(auth_events, sender)?;
    if matches!(current, Some(Membership::Ban) | Some(Membership::Invite) | Some(Membership::Join)) {
        return Err(AuthError::new(
            AuthErrorKind::InvalidMembershipTransition,
            "cannot knock while banned, invited, or already joined",
        ));
    }

    let _ = event;
    Ok(())
}
