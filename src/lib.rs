//! A pure, synchronous event-authorization engine for room-based federation protocols.
//!
//! Given a room version, a candidate event, and the relevant slice of prior room state, [`auth::check`]
//! decides whether the event is authorized to be applied to the room's event graph. The engine performs
//! no I/O, holds no state across calls, and never suspends: every decision is a single, deterministic
//! function of its arguments (see `DESIGN.md` for the grounding of each module).
//!
//! Grounded on `palpo-matrix-server-palpo`'s `crates/core/src/state` module, whose file layout this
//! crate mirrors: [`error`], [`room_version`], [`power_levels`], and a membership sub-module collapsed
//! here into [`membership`].

pub mod auth;
pub mod error;
pub mod event;
pub mod identifiers;
pub mod membership;
pub mod power_levels;
pub mod room_version;

pub use auth::{check, SignatureVerifier};
pub use error::{AuthError, AuthErrorKind, AuthResult};
pub use event::{auth_types_for_event, AuthEventKey, AuthEvents, EventType, EventView, JoinRule, Membership};
pub use power_levels::PowerLevelView;
pub use room_version::{room_version_capabilities, Capability, CapabilitySupport, RoomVersion, ROOM_VERSIONS};
