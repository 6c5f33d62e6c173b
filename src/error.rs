//! Structured rejection reasons surfaced by the authorization engine.
//!
//! Grounded on `palpo-matrix-server-palpo`'s `state::error::StateError`: a single
//! `thiserror`-derived enum with a `#[from]` arm for JSON deserialization failures and a
//! `Custom`/`other` escape hatch, rather than one error type per rule.

use thiserror::Error;

/// Stable rejection codes a caller can match on without parsing the message.
///
/// New variants may be added in the future (the type is `#[non_exhaustive]`), but once
/// published a variant's meaning never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthErrorKind {
    Forbidden,
    MissingCreate,
    InvalidCreate,
    RoomIdMismatch,
    SenderNotInRoom,
    InsufficientPower,
    InvalidPowerLevels,
    BadAliasStateKey,
    Banned,
    MissingAuthorisedVia,
    UnauthorisedVia,
    InvalidMembershipTransition,
    SignatureError,
    UnknownRoomVersion,
}

impl AuthErrorKind {
    /// The lowercase, underscore-separated code used in diagnostics and tests.
    pub fn code(self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::MissingCreate => "missing_create",
            Self::InvalidCreate => "invalid_create",
            Self::RoomIdMismatch => "room_id_mismatch",
            Self::SenderNotInRoom => "sender_not_in_room",
            Self::InsufficientPower => "insufficient_power",
            Self::InvalidPowerLevels => "invalid_power_levels",
            Self::BadAliasStateKey => "bad_alias_state_key",
            Self::Banned => "banned",
            Self::MissingAuthorisedVia => "missing_authorised_via",
            Self::UnauthorisedVia => "unauthorised_via",
            Self::InvalidMembershipTransition => "invalid_membership_transition",
            Self::SignatureError => "signature_error",
            Self::UnknownRoomVersion => "unknown_room_version",
        }
    }
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A rejection produced by the authorization engine.
///
/// Carries the [`AuthErrorKind`], the name of the offending field when one is identifiable
/// (`sender`, `state_key`, a power-level key, ...), and a short human-readable message. The
/// engine never retries internally and always surfaces the first violation it detects.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub field: Option<String>,
    pub message: String,
    #[source]
    source: Option<serde_json::Error>,
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self { kind, field: None, message: message.into(), source: None }
    }

    pub fn with_field(kind: AuthErrorKind, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, field: Some(field.into()), message: message.into(), source: None }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Forbidden, message)
    }

    pub fn from_json(kind: AuthErrorKind, field: &str, err: serde_json::Error) -> Self {
        Self {
            kind,
            field: Some(field.to_owned()),
            message: err.to_string(),
            source: Some(err),
        }
    }
}
