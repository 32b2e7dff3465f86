//! Host callbacks
//!
//! The host runtime (kicking a banned player, telling a muted player their
//! mute ran out) is reached through [`EnforcementHook`]s registered per kind.

use crate::enforcement::{EnforcementKind, EnforcementRecord, EnforcementResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// Why a record stopped being in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftReason {
    Revoked,
    Superseded,
    Expired,
}

/// Trait for reacting to enforcement changes in the host runtime
#[async_trait::async_trait]
pub trait EnforcementHook: Send + Sync {
    /// A record came into effect
    async fn applied(&self, record: &EnforcementRecord) -> EnforcementResult<()>;

    /// A record stopped being in effect
    async fn lifted(&self, record: &EnforcementRecord, reason: LiftReason) -> EnforcementResult<()>;
}

/// Registry of hooks, keyed by enforcement kind
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<EnforcementKind, Vec<Arc<dyn EnforcementHook>>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for a kind
    pub fn register(&mut self, kind: EnforcementKind, hook: Arc<dyn EnforcementHook>) {
        self.hooks.entry(kind).or_default().push(hook);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run `applied` on every hook for the record's kind. Failures are logged;
    /// the record is already committed.
    pub async fn dispatch_applied(&self, record: &EnforcementRecord) {
        for hook in self.hooks.get(&record.kind).into_iter().flatten() {
            if let Err(e) = hook.applied(record).await {
                error!(
                    record_id = %record.id,
                    subject_id = %record.subject_id,
                    kind = %record.kind,
                    "Hook failed on apply: {e}"
                );
            }
        }
    }

    /// Run `lifted` on every hook for the record's kind
    pub async fn dispatch_lifted(&self, record: &EnforcementRecord, reason: LiftReason) {
        for hook in self.hooks.get(&record.kind).into_iter().flatten() {
            if let Err(e) = hook.lifted(record, reason).await {
                error!(
                    record_id = %record.id,
                    subject_id = %record.subject_id,
                    kind = %record.kind,
                    reason = ?reason,
                    "Hook failed on lift: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::{EnforcementError, SubjectId};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(EnforcementKind, Option<LiftReason>)>>,
    }

    #[async_trait::async_trait]
    impl EnforcementHook for Recorder {
        async fn applied(&self, record: &EnforcementRecord) -> EnforcementResult<()> {
            self.seen.lock().push((record.kind, None));
            Ok(())
        }

        async fn lifted(&self, record: &EnforcementRecord, reason: LiftReason) -> EnforcementResult<()> {
            self.seen.lock().push((record.kind, Some(reason)));
            Err(EnforcementError::Other("player offline".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = HookRegistry::new();
        registry.register(EnforcementKind::Ban, recorder.clone());

        let ban = EnforcementRecord::draft(
            SubjectId::random(),
            EnforcementKind::Ban,
            "cheating",
            "console",
            Utc::now(),
            None,
        );
        let mute = EnforcementRecord {
            kind: EnforcementKind::Mute,
            ..ban.clone()
        };

        registry.dispatch_applied(&ban).await;
        registry.dispatch_applied(&mute).await;
        // Hook errors are swallowed after logging
        registry.dispatch_lifted(&ban, LiftReason::Expired).await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                (EnforcementKind::Ban, None),
                (EnforcementKind::Ban, Some(LiftReason::Expired)),
            ]
        );
    }
}
