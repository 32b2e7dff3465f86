//! Enforcement kinds and actions
//!
//! This module defines the categories of enforcement a subject can carry, the
//! textual action grammar used by configuration and moderators (`ban:1d`,
//! `mute:10m`), and the escalation ladder that maps violation points to actions.

use crate::enforcement::{EnforcementError, EnforcementResult, SubjectId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Category of an enforcement record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementKind {
    /// Denied access to the network
    Ban,
    /// Denied chat
    Mute,
    /// Recorded warning, restricts nothing on its own
    Warning,
    /// Explicit permission grant or denial layered over the host's defaults
    PermissionOverride,
}

impl EnforcementKind {
    pub const ALL: [Self; 4] = [Self::Ban, Self::Mute, Self::Warning, Self::PermissionOverride];

    /// Stable storage name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Mute => "mute",
            Self::Warning => "warning",
            Self::PermissionOverride => "permission_override",
        }
    }

    /// Whether an unreachable store should be read as "restricted" for this kind
    #[must_use]
    pub fn fails_closed(self) -> bool {
        matches!(self, Self::Ban | Self::Mute)
    }

    /// Ordering used when several kinds are active at once, highest first
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Self::Ban => 3,
            Self::Mute => 2,
            Self::PermissionOverride => 1,
            Self::Warning => 0,
        }
    }
}

impl fmt::Display for EnforcementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementKind {
    type Err = EnforcementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ban" => Ok(Self::Ban),
            "mute" => Ok(Self::Mute),
            "warn" | "warning" => Ok(Self::Warning),
            "override" | "permission_override" => Ok(Self::PermissionOverride),
            other => Err(EnforcementError::ValidationFailed(format!(
                "unknown enforcement kind '{other}'"
            ))),
        }
    }
}

/// Parse a moderator duration such as `30s`, `10m`, `2h`, `7d`, `1w` or `permanent`.
///
/// A bare number is read as minutes. Returns `None` for permanent.
///
/// # Errors
/// Returns `ValidationFailed` for empty, zero, or malformed input
pub fn parse_duration(input: &str) -> EnforcementResult<Option<Duration>> {
    let input = input.trim().to_ascii_lowercase();
    if matches!(input.as_str(), "permanent" | "perm") {
        return Ok(None);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let amount: i64 = digits
        .parse()
        .map_err(|_| EnforcementError::ValidationFailed(format!("invalid duration '{input}'")))?;
    if amount <= 0 {
        return Err(EnforcementError::ValidationFailed(format!(
            "duration must be positive, got '{input}'"
        )));
    }

    let duration = match unit {
        "s" => Duration::try_seconds(amount),
        "" | "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        "w" => Duration::try_weeks(amount),
        _ => None,
    };

    duration
        .map(Some)
        .ok_or_else(|| EnforcementError::ValidationFailed(format!("invalid duration '{input}'")))
}

/// Render a duration using the largest unit that divides it evenly
#[must_use]
pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "permanent".to_string();
    };

    let secs = duration.num_seconds();
    if secs > 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs > 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// An enforcement to issue: a kind plus an optional duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcementAction {
    pub kind: EnforcementKind,
    /// `None` is permanent
    pub duration: Option<Duration>,
}

impl EnforcementAction {
    /// Create a new `Ban` action
    pub fn ban(duration: impl Into<Option<Duration>>) -> Self {
        Self {
            kind: EnforcementKind::Ban,
            duration: duration.into(),
        }
    }

    /// Create a new `Mute` action
    pub fn mute(duration: impl Into<Option<Duration>>) -> Self {
        Self {
            kind: EnforcementKind::Mute,
            duration: duration.into(),
        }
    }

    pub fn warning() -> Self {
        Self {
            kind: EnforcementKind::Warning,
            duration: None,
        }
    }

    pub fn permission_override(duration: impl Into<Option<Duration>>) -> Self {
        Self {
            kind: EnforcementKind::PermissionOverride,
            duration: duration.into(),
        }
    }

    /// Check if this action lifts itself after a while
    #[must_use]
    pub fn is_timed(&self) -> bool {
        self.duration.is_some()
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.duration) {
            (EnforcementKind::Warning, _) => write!(f, "warn"),
            (kind, duration) => write!(f, "{kind}:{}", format_duration(duration)),
        }
    }
}

impl FromStr for EnforcementAction {
    type Err = EnforcementError;

    /// Parses `ban`, `ban:1d`, `mute:10m`, `warn`, `override:2h`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, duration) = match s.split_once(':') {
            Some((kind, duration)) => (kind.parse::<EnforcementKind>()?, parse_duration(duration)?),
            None => (s.parse::<EnforcementKind>()?, None),
        };
        if kind == EnforcementKind::Warning && duration.is_some() {
            return Err(EnforcementError::ValidationFailed(
                "warnings do not take a duration".to_string(),
            ));
        }
        Ok(Self { kind, duration })
    }
}

/// Maps accumulated violation points to the action they earn
#[derive(Debug, Clone, Default)]
pub struct EscalationLadder {
    steps: BTreeMap<u32, EnforcementAction>,
}

impl EscalationLadder {
    /// Build a ladder from `points -> action string` pairs as found in configuration
    ///
    /// # Errors
    /// Returns `ValidationFailed` if any action string does not parse
    pub fn from_config(entries: &BTreeMap<u32, String>) -> EnforcementResult<Self> {
        let steps = entries
            .iter()
            .map(|(points, action)| -> EnforcementResult<(u32, EnforcementAction)> {
                Ok((*points, action.parse()?))
            })
            .collect::<EnforcementResult<BTreeMap<_, _>>>()?;
        Ok(Self { steps })
    }

    pub fn insert(&mut self, points: u32, action: EnforcementAction) {
        self.steps.insert(points, action);
    }

    /// Highest step whose threshold does not exceed `points`
    #[must_use]
    pub fn action_for(&self, points: u32) -> Option<&EnforcementAction> {
        self.steps.range(..=points).next_back().map(|(_, action)| action)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A subject's running violation tally, shared by every process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationPoints {
    pub subject_id: SubjectId,
    /// Points counted against the subject now; decay lowers these
    pub points: u32,
    /// Violations ever recorded; decay never lowers this
    pub total_violations: u32,
    pub last_violation: DateTime<Utc>,
    pub decayed_at: Option<DateTime<Utc>>,
}
