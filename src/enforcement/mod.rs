//! Enforcement data model
//!
//! Records, their lifecycle, the kinds and actions that create them, and the
//! notices and hooks through which changes leave the engine.

mod action;
mod error;
mod hook;
mod notice;
mod record;

pub use action::{
    EnforcementAction, EnforcementKind, EscalationLadder, ViolationPoints, format_duration,
    parse_duration,
};
pub use error::{EnforcementError, EnforcementResult};
pub use hook::{EnforcementHook, HookRegistry, LiftReason};
pub use notice::{ChangeKind, ChangeNotice};
pub use record::{ActiveSet, ActorId, EnforcementRecord, EnforcementState, NodeId, RecordId, SubjectId};
