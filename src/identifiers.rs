//! Parsing and validation for Matrix-style identifiers (`@user:domain`, `!room:domain`, ...).
//!
//! Grounded on `palpo-matrix-server-palpo`'s `identifiers/*.rs` newtype-over-`str` idiom, trimmed
//! down to the sigil/localpart/domain split the authorization engine actually needs. The
//! `diesel`/macro-generated `Id` infrastructure the teacher uses for its wire types is dropped
//! here: this engine never stores identifiers, it only parses and compares them (see
//! `DESIGN.md`).

use std::fmt;

use crate::error::{AuthError, AuthErrorKind};

/// Maximum length, in bytes, of a user id, room id, room alias, or event id.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// The sigil distinguishing the kind of identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sigil {
    User,
    Room,
    RoomAlias,
    Event,
}

impl Sigil {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '@' => Some(Self::User),
            '!' => Some(Self::Room),
            '#' => Some(Self::RoomAlias),
            '$' => Some(Self::Event),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::User => '@',
            Self::Room => '!',
            Self::RoomAlias => '#',
            Self::Event => '$',
        }
    }
}

/// A parsed `sigil + localpart + ':' + domain` identifier.
///
/// Borrows from the input string; never panics on malformed untrusted input, always returns a
/// typed [`AuthError`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedId<'a> {
    sigil: Sigil,
    full: &'a str,
    colon_pos: usize,
}

impl<'a> ParsedId<'a> {
    /// Parses `s`, requiring it to start with `sigil` and to be no longer than
    /// [`MAX_IDENTIFIER_LEN`].
    pub fn parse(s: &'a str, expected: Sigil) -> Result<Self, AuthError> {
        if s.len() > MAX_IDENTIFIER_LEN {
            return Err(AuthError::with_field(
                AuthErrorKind::Forbidden,
                "identifier",
                format!("identifier exceeds {MAX_IDENTIFIER_LEN} characters"),
            ));
        }

        let mut chars = s.chars();
        let first = chars.next().ok_or_else(|| {
            AuthError::with_field(AuthErrorKind::Forbidden, "identifier", "empty identifier")
        })?;
        let sigil = Sigil::from_char(first).ok_or_else(|| {
            AuthError::with_field(
                AuthErrorKind::Forbidden,
                "identifier",
                format!("identifier does not start with a recognized sigil: {s:?}"),
            )
        })?;
        if sigil != expected {
            return Err(AuthError::with_field(
                AuthErrorKind::Forbidden,
                "identifier",
                format!("expected sigil '{}', found '{}'", expected.as_char(), first),
            ));
        }

        let colon_pos = s.find(':').ok_or_else(|| {
            AuthError::with_field(
                AuthErrorKind::Forbidden,
                "identifier",
                format!("identifier is missing ':' separator: {s:?}"),
            )
        })?;
        if colon_pos == 1 {
            return Err(AuthError::with_field(
                AuthErrorKind::Forbidden,
                "identifier",
                "identifier has an empty localpart",
            ));
        }
        if colon_pos + 1 == s.len() {
            return Err(AuthError::with_field(
                AuthErrorKind::Forbidden,
                "identifier",
                "identifier has an empty domain",
            ));
        }

        Ok(Self { sigil, full: s, colon_pos })
    }

    pub fn sigil(&self) -> Sigil {
        self.sigil
    }

    pub fn localpart(&self) -> &'a str {
        &self.full[1..self.colon_pos]
    }

    pub fn domain(&self) -> &'a str {
        &self.full[self.colon_pos + 1..]
    }

    pub fn as_str(&self) -> &'a str {
        self.full
    }
}

impl fmt::Display for ParsedId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full)
    }
}

/// Returns the substring of `identifier` after the first `:`, without validating the sigil.
///
/// This is the engine's primary entry point for identifier parsing (`domain_of` in §4.1); rule
/// code that only needs the domain (e.g. comparing a sender's domain to a room id's domain)
/// should use this rather than constructing a full [`ParsedId`].
pub fn domain_of(identifier: &str) -> Result<&str, AuthError> {
    let colon_pos = identifier.find(':').ok_or_else(|| {
        AuthError::with_field(
            AuthErrorKind::Forbidden,
            "identifier",
            format!("identifier is missing ':' separator: {identifier:?}"),
        )
    })?;
    Ok(&identifier[colon_pos + 1..])
}

/// Parses a user id (`@local:domain`).
pub fn parse_user_id(s: &str) -> Result<ParsedId<'_>, AuthError> {
    ParsedId::parse(s, Sigil::User)
}

/// Parses a room id (`!local:domain`).
pub fn parse_room_id(s: &str) -> Result<ParsedId<'_>, AuthError> {
    ParsedId::parse(s, Sigil::Room)
}

/// Parses an event id (`$local:domain` or, for `EventFormatVersion::V2`/`V3`, a bare
/// content-hash id with no domain suffix — see [`crate::room_version::EventFormatVersion`]).
pub fn parse_event_id(s: &str) -> Result<ParsedId<'_>, AuthError> {
    ParsedId::parse(s, Sigil::Event)
}

/// Parses a room alias (`#local:domain`).
pub fn parse_room_alias(s: &str) -> Result<ParsedId<'_>, AuthError> {
    ParsedId::parse(s, Sigil::RoomAlias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_id() {
        let id = parse_user_id("@alice:example.org").unwrap();
        assert_eq!(id.localpart(), "alice");
        assert_eq!(id.domain(), "example.org");
    }

    #[test]
    fn rejects_wrong_sigil() {
        assert!(parse_user_id("!room:example.org").is_err());
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_user_id("@alice").is_err());
    }

    #[test]
    fn rejects_empty_localpart() {
        assert!(parse_user_id("@:example.org").is_err());
    }

    #[test]
    fn rejects_empty_domain() {
        assert!(parse_user_id("@alice:").is_err());
    }

    #[test]
    fn rejects_oversized_identifier() {
        let long = format!("@{}:example.org", "a".repeat(MAX_IDENTIFIER_LEN));
        assert!(parse_user_id(&long).is_err());
    }

    #[test]
    fn domain_of_extracts_suffix() {
        assert_eq!(domain_of("!room:example.org").unwrap(), "example.org");
        assert_eq!(domain_of("$event:matrix.org").unwrap(), "matrix.org");
    }
}
