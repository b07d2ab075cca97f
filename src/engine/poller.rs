//! Pull-based view reconciliation.
//!
//! Both portal fronts stay current by polling, not by push. A `SyncPoller`
//! runs two tickers against a [`SnapshotSource`]: the critical cadence
//! re-reads the light progress view (flags plus resolved phase), the
//! secondary cadence re-reads the full snapshot so milestone, KYC, and
//! signing detail stays fresh too. Reconciliation is a pure diff of the
//! previous view against the fetched one; a fetch that would move the phase
//! or any flag backwards is reported as a warning and never applied, so an
//! observer's view is monotone even against an inconsistent feed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::Engine;
use super::models::{Actor, Progress, ProgressFlag, TransactionStatus};
use super::resolver::{Phase, PhaseStanding, PhaseView};
use super::snapshot::{ProgressView, TransactionSnapshot};

/// Consecutive fetch failures tolerated before the loop gives up.
const MAX_POLL_FAILURES: u32 = 5;

// ── Snapshot sources ──────────────────────────────────────────────────

/// Where a poller reads transaction state from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_progress(&self, transaction_id: i64) -> Result<ProgressView>;
    async fn fetch_snapshot(&self, transaction_id: i64) -> Result<TransactionSnapshot>;
}

/// Polls a running engine over HTTP, the way the portal front ends do.
pub struct HttpSource {
    base_url: String,
    actor: Actor,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, actor: Actor) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            actor,
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSource {
    async fn fetch_progress(&self, transaction_id: i64) -> Result<ProgressView> {
        let url = format!(
            "{}/api/transactions/{}/progress",
            self.base_url, transaction_id
        );
        let client = reqwest::Client::new();
        client
            .get(&url)
            .header("x-actor-role", self.actor.role.as_str())
            .header("x-actor-id", &self.actor.id)
            .send()
            .await
            .context("Failed to reach the lifecycle engine")?
            .error_for_status()
            .context("Lifecycle engine rejected the progress poll")?
            .json::<ProgressView>()
            .await
            .context("Failed to parse progress view")
    }

    async fn fetch_snapshot(&self, transaction_id: i64) -> Result<TransactionSnapshot> {
        let url = format!("{}/api/transactions/{}", self.base_url, transaction_id);
        let client = reqwest::Client::new();
        client
            .get(&url)
            .header("x-actor-role", self.actor.role.as_str())
            .header("x-actor-id", &self.actor.id)
            .send()
            .await
            .context("Failed to reach the lifecycle engine")?
            .error_for_status()
            .context("Lifecycle engine rejected the snapshot poll")?
            .json::<TransactionSnapshot>()
            .await
            .context("Failed to parse snapshot")
    }
}

/// Reads an in-process engine directly. Used by tests and by setups where
/// the poller shares a process with the engine.
pub struct EngineSource {
    engine: Engine,
    actor: Actor,
}

impl EngineSource {
    pub fn new(engine: Engine, actor: Actor) -> Self {
        Self { engine, actor }
    }
}

#[async_trait]
impl SnapshotSource for EngineSource {
    async fn fetch_progress(&self, transaction_id: i64) -> Result<ProgressView> {
        self.engine
            .progress_view(&self.actor, transaction_id)
            .await
            .map_err(anyhow::Error::from)
    }

    async fn fetch_snapshot(&self, transaction_id: i64) -> Result<TransactionSnapshot> {
        self.engine
            .snapshot(&self.actor, transaction_id)
            .await
            .map_err(anyhow::Error::from)
    }
}

// ── Reconciliation ────────────────────────────────────────────────────

/// One observed change between two polls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    PhaseAdvanced { from: Phase, to: Phase },
    FlagSet { flag: ProgressFlag },
    StandingChanged {
        phase: Phase,
        from: PhaseStanding,
        to: PhaseStanding,
    },
    StatusChanged {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    Warning { message: String },
}

impl std::fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PhaseAdvanced { from, to } => {
                write!(f, "phase advanced: {} -> {}", from, to)
            }
            Self::FlagSet { flag } => write!(f, "flag set: {}", flag.as_str()),
            Self::StandingChanged { phase, from, to } => {
                write!(f, "{}: {} -> {}", phase, from.as_str(), to.as_str())
            }
            Self::StatusChanged { to, .. } => write!(f, "transaction is now {}", to.as_str()),
            Self::Warning { message } => write!(f, "warning: {}", message),
        }
    }
}

/// The slice of a snapshot the poller tracks between polls. Both fetch
/// shapes reduce to it.
#[derive(Debug, Clone, PartialEq)]
struct ObservedState {
    status: TransactionStatus,
    progress: Progress,
    phase: PhaseView,
}

impl From<ProgressView> for ObservedState {
    fn from(view: ProgressView) -> Self {
        Self {
            status: view.status,
            progress: view.progress,
            phase: view.phase,
        }
    }
}

impl From<TransactionSnapshot> for ObservedState {
    fn from(snap: TransactionSnapshot) -> Self {
        Self {
            status: snap.transaction.status,
            progress: snap.progress,
            phase: snap.phase,
        }
    }
}

/// The poller's working view of one transaction.
#[derive(Debug, Default)]
struct SyncState {
    view: Option<ObservedState>,
}

impl SyncState {
    /// Fold a fetched state into the view, returning the changes it brings.
    ///
    /// The first observation seeds the view silently. A fetch that moves the
    /// phase or any flag backwards is never applied; it yields a single
    /// warning event and the view keeps the newer state.
    fn observe(&mut self, next: ObservedState) -> Vec<SyncEvent> {
        let prev = match self.view.take() {
            None => {
                self.view = Some(next);
                return Vec::new();
            }
            Some(prev) => prev,
        };

        if let Some(message) = regression(&prev, &next) {
            self.view = Some(prev);
            return vec![SyncEvent::Warning { message }];
        }

        let mut events = Vec::new();
        if next.phase.phase > prev.phase.phase {
            events.push(SyncEvent::PhaseAdvanced {
                from: prev.phase.phase,
                to: next.phase.phase,
            });
        }
        for flag in ProgressFlag::ALL {
            if next.progress.get(flag) && !prev.progress.get(flag) {
                events.push(SyncEvent::FlagSet { flag });
            }
        }
        for (before, after) in prev.phase.phases.iter().zip(next.phase.phases.iter()) {
            if before.standing != after.standing {
                events.push(SyncEvent::StandingChanged {
                    phase: after.phase,
                    from: before.standing,
                    to: after.standing,
                });
            }
        }
        for warning in &next.phase.warnings {
            if !prev.phase.warnings.contains(warning) {
                events.push(SyncEvent::Warning {
                    message: warning.clone(),
                });
            }
        }
        if next.status != prev.status {
            events.push(SyncEvent::StatusChanged {
                from: prev.status,
                to: next.status,
            });
        }

        self.view = Some(next);
        events
    }
}

fn regression(prev: &ObservedState, next: &ObservedState) -> Option<String> {
    if next.phase.phase < prev.phase.phase {
        return Some(format!(
            "fetched state regresses the phase from {} to {}; keeping the newer view",
            prev.phase.phase.index(),
            next.phase.phase.index()
        ));
    }
    for flag in ProgressFlag::ALL {
        if prev.progress.get(flag) && !next.progress.get(flag) {
            return Some(format!(
                "fetched state clears {}; keeping the newer view",
                flag.as_str()
            ));
        }
    }
    None
}

// ── Poll loop ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Cadence for the light progress view.
    pub critical_interval: Duration,
    /// Cadence for the full snapshot.
    pub secondary_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            critical_interval: Duration::from_secs(3),
            secondary_interval: Duration::from_secs(5),
        }
    }
}

/// Polls one transaction and emits [`SyncEvent`]s on its channel until told
/// to shut down, the event receiver goes away, or the source fails
/// [`MAX_POLL_FAILURES`] times in a row.
pub struct SyncPoller {
    source: Arc<dyn SnapshotSource>,
    transaction_id: i64,
    config: PollerConfig,
}

impl SyncPoller {
    pub fn new(source: Arc<dyn SnapshotSource>, transaction_id: i64, config: PollerConfig) -> Self {
        Self {
            source,
            transaction_id,
            config,
        }
    }

    pub async fn run(
        self,
        events: mpsc::Sender<SyncEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut critical = tokio::time::interval(self.config.critical_interval);
        let mut secondary = tokio::time::interval(self.config.secondary_interval);
        let mut state = SyncState::default();
        let mut failures = 0u32;

        loop {
            let fetched = tokio::select! {
                _ = critical.tick() => {
                    self.source
                        .fetch_progress(self.transaction_id)
                        .await
                        .map(ObservedState::from)
                }
                _ = secondary.tick() => {
                    self.source
                        .fetch_snapshot(self.transaction_id)
                        .await
                        .map(ObservedState::from)
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };

            match fetched {
                Ok(next) => {
                    failures = 0;
                    for event in state.observe(next) {
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        transaction_id = self.transaction_id,
                        failures,
                        error = %err,
                        "poll failed"
                    );
                    if failures >= MAX_POLL_FAILURES {
                        return Err(err.context("poller giving up after repeated failures"));
                    }
                }
            }
        }
    }
}
