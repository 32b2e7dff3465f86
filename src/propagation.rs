//! Change propagation
//!
//! Several processes share one database. Each one tails the store's change
//! sequence from its own watermark and invalidates the cache entries of every
//! subject that changed, so a ban issued on one server reaches the others
//! within one poll interval. The same task sweeps the cache for expiry and,
//! when configured, decays idle violation tallies.

use crate::PROPAGATION_TARGET;
use crate::cache::{EnforcementCache, SweepReport};
use crate::clock::Clock;
use crate::config::{DecayPolicy, PropagationConfig};
use crate::enforcement::{
    ChangeKind, ChangeNotice, EnforcementError, EnforcementRecord, EnforcementResult, HookRegistry,
    LiftReason, NodeId, SubjectId,
};
use crate::store::RecordStore;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Requests accepted by the background task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationRequest {
    /// Poll for changes now instead of waiting for the next tick
    PollNow,
    Sweep,
    /// Run the violation point decay pass now
    Decay,
    Shutdown,
}

/// What one poll cycle processed
#[derive(Debug, Default)]
pub struct PollReport {
    /// Row changes read
    pub changes: usize,
    /// Distinct subjects invalidated
    pub invalidated: usize,
    /// Watermark after the cycle
    pub watermark: u64,
    /// Set when the oldest change processed was older than the lag threshold
    pub lag: Option<EnforcementError>,
}

pub struct ChangePropagator {
    store: Arc<dyn RecordStore>,
    cache: Arc<EnforcementCache>,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
    notices: broadcast::Sender<ChangeNotice>,
    node: NodeId,
    config: PropagationConfig,
    decay: Option<DecayPolicy>,
    watermark: AtomicU64,
    /// Polls run one at a time so batches are processed in order
    polling: Mutex<()>,
}

impl ChangePropagator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<EnforcementCache>,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
        notices: broadcast::Sender<ChangeNotice>,
        node: NodeId,
        config: PropagationConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            hooks,
            notices,
            node,
            config,
            decay: None,
            watermark: AtomicU64::new(0),
            polling: Mutex::new(()),
        }
    }

    /// Also run the violation point decay pass on the policy's interval
    #[must_use]
    pub fn with_decay(mut self, decay: Option<DecayPolicy>) -> Self {
        self.decay = decay;
        self
    }

    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Move the watermark to the store's latest change. Changes committed before
    /// this point are not replayed.
    ///
    /// # Errors
    /// Returns the store error if the sequence cannot be read
    pub async fn seed(&self) -> EnforcementResult<u64> {
        let latest = self.store.latest_change_seq().await?;
        let previous = self.watermark.fetch_max(latest, Ordering::AcqRel);
        let watermark = previous.max(latest);
        info!(target: PROPAGATION_TARGET, node = %self.node, watermark = watermark, "Watermark seeded");
        Ok(watermark)
    }

    /// Read and process every change above the watermark, up to
    /// `max_batches_per_cycle` batches.
    ///
    /// The watermark advances only after a batch has been fully processed. A
    /// change seen twice only invalidates twice, which is harmless.
    ///
    /// # Errors
    /// Returns the store error; batches processed before it keep their progress
    pub async fn poll_once(&self) -> EnforcementResult<PollReport> {
        let _polling = self.polling.lock().await;

        let batch_size = self.config.batch_size.max(1);
        let mut report = PollReport {
            watermark: self.watermark(),
            ..PollReport::default()
        };

        for _ in 0..self.config.max_batches_per_cycle.max(1) {
            let batch = self
                .store
                .list_changed_since(report.watermark, batch_size)
                .await?;
            let Some(oldest) = batch.first() else {
                break;
            };

            let now = self.clock.now();
            let lag = (now - oldest.updated_at).to_std().unwrap_or_default();
            if report.lag.is_none() && lag > self.config.lag_threshold() {
                report.lag = Some(EnforcementError::PropagationLagExceeded {
                    lag_ms: u64::try_from(lag.as_millis()).unwrap_or(u64::MAX),
                    watermark: report.watermark,
                });
            }

            let subjects: HashSet<SubjectId> = batch.iter().map(|r| r.subject_id).collect();
            for subject in &subjects {
                self.cache.invalidate(*subject);
            }
            for record in batch.iter().filter(|r| r.changed_by != self.node) {
                self.observe_remote(record).await;
            }

            let newest = batch
                .iter()
                .map(|r| r.change_seq)
                .max()
                .unwrap_or(report.watermark);
            self.watermark.fetch_max(newest, Ordering::AcqRel);

            report.changes += batch.len();
            report.invalidated += subjects.len();
            report.watermark = self.watermark();

            if batch.len() < batch_size as usize {
                break;
            }
        }

        if let Some(lag) = &report.lag {
            warn!(
                target: PROPAGATION_TARGET,
                node = %self.node,
                watermark = report.watermark,
                error = %lag,
                "Propagation is lagging behind the store"
            );
        }
        if report.changes > 0 {
            debug!(
                target: PROPAGATION_TARGET,
                changes = report.changes,
                invalidated = report.invalidated,
                watermark = report.watermark,
                "Processed store changes"
            );
        }
        Ok(report)
    }

    async fn observe_remote(&self, record: &EnforcementRecord) {
        let notice = ChangeNotice::observed(record, self.clock.now());
        info!(
            target: PROPAGATION_TARGET,
            subject_id = %record.subject_id,
            record_id = %record.id,
            kind = %record.kind,
            change = ?notice.change,
            changed_by = %record.changed_by,
            change_seq = record.change_seq,
            "Observed remote change"
        );
        let change = notice.change;
        let _ = self.notices.send(notice);

        match change {
            ChangeKind::Issued => self.hooks.dispatch_applied(record).await,
            ChangeKind::Revoked | ChangeKind::Superseded => {
                self.hooks.dispatch_lifted(record, LiftReason::Revoked).await;
            }
            // Expiry is raised by each process's own sweep
            ChangeKind::Amended | ChangeKind::Expired => {}
        }
    }

    /// Evict stale cache entries and announce records that ran out since the last sweep
    pub async fn sweep_expired(&self) -> SweepReport {
        let report = self.cache.sweep(self.clock.now());
        for record in &report.expired {
            debug!(
                target: PROPAGATION_TARGET,
                subject_id = %record.subject_id,
                record_id = %record.id,
                kind = %record.kind,
                "Record expired"
            );
            let _ = self
                .notices
                .send(ChangeNotice::local(record, ChangeKind::Expired));
            self.hooks.dispatch_lifted(record, LiftReason::Expired).await;
        }
        report
    }

    /// Lower idle violation tallies once. Zero when decay is switched off.
    ///
    /// A tally is lowered at most once per interval, so processes sharing a
    /// store can all run the pass.
    ///
    /// # Errors
    /// Returns the store error
    pub async fn decay_points(&self) -> EnforcementResult<u64> {
        let Some(policy) = self.decay else {
            return Ok(0);
        };
        let now = self.clock.now();
        let interval =
            chrono::Duration::from_std(policy.interval).unwrap_or_else(|_| chrono::Duration::zero());
        let lowered = self
            .store
            .decay_violation_points(now - policy.after, now - interval, now, policy.amount)
            .await?;
        if lowered > 0 {
            info!(
                target: PROPAGATION_TARGET,
                node = %self.node,
                subjects = lowered,
                amount = policy.amount,
                "Violation points decayed"
            );
        }
        Ok(lowered)
    }

    async fn decay_logged(&self) {
        if let Err(e) = self.decay_points().await {
            warn!(target: PROPAGATION_TARGET, node = %self.node, error = %e, "Violation point decay failed");
        }
    }

    async fn poll_logged(&self) {
        if let Err(e) = self.poll_once().await {
            warn!(
                target: PROPAGATION_TARGET,
                node = %self.node,
                watermark = self.watermark(),
                error = %e,
                "Change poll failed; watermark held"
            );
        }
    }

    /// Background task: polls on an interval, sweeps on another, decays points
    /// on a third, and serves requests until `Shutdown` arrives or every
    /// sender is dropped.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PropagationRequest>) {
        let poll_interval = self.config.poll_interval();
        // Spread processes that started together across the interval
        let jitter_ms = rand::rng().random_range(0..=self.config.poll_interval_ms / 4);
        info!(
            target: PROPAGATION_TARGET,
            node = %self.node,
            watermark = self.watermark(),
            poll_interval_ms = self.config.poll_interval_ms,
            jitter_ms = jitter_ms,
            "Propagation task started"
        );

        let mut poll = tokio::time::interval_at(
            Instant::now() + poll_interval + Duration::from_millis(jitter_ms),
            poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Never ticks when decay is off; the branch below is disabled instead
        let decay_interval = self.decay.map_or(Duration::from_secs(3_600), |policy| policy.interval);
        let mut decay = tokio::time::interval_at(Instant::now() + decay_interval, decay_interval);
        decay.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(PropagationRequest::PollNow) => self.poll_logged().await,
                    Some(PropagationRequest::Sweep) => {
                        self.sweep_expired().await;
                    }
                    Some(PropagationRequest::Decay) => self.decay_logged().await,
                    Some(PropagationRequest::Shutdown) | None => {
                        info!(target: PROPAGATION_TARGET, node = %self.node, "Received shutdown request");
                        break;
                    }
                },
                _ = poll.tick() => self.poll_logged().await,
                _ = sweep.tick() => {
                    self.sweep_expired().await;
                }
                _ = decay.tick(), if self.decay.is_some() => self.decay_logged().await,
            }
        }

        info!(target: PROPAGATION_TARGET, node = %self.node, watermark = self.watermark(), "Propagation task shut down");
    }
}
