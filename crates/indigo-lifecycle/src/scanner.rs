//! Periodic scanner for due credentials.
//!
//! Each pass walks [`list_due`] for the current time and turns every due
//! record into a [`RotationJob`] on a lock-free
//! [`crossbeam::queue::SegQueue`].  Jobs are drained by up to
//! [`ScannerConfig::max_workers`] concurrent tasks, each running one
//! [`LifecycleEngine::process`].
//!
//! # Jobs
//!
//! ```text
//! list_due ──▶ queue ──▶ worker ──▶ done
//!                ▲          │
//!                └──────────┘ key outage / write race (max_requeues per pass)
//! ```
//!
//! Jobs live only for the pass that created them.  Everything worth keeping
//! (attempt counts, backoff, terminal reasons) is written to the credential by
//! the engine, so a restarted process recovers by scanning again.
//!
//! Ids already being processed are tracked in a [`DashMap`] and skipped, so
//! overlapping passes never run two workers on one credential in-process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use indigo_store::{DEFAULT_DUE_PAGE_SIZE, list_due};

use crate::engine::{LifecycleEngine, Outcome};
use crate::error::{LifecycleError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One pending evaluation of a due credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationJob {
    pub credential_id: String,
    /// Time of the pass that found the credential due.
    pub scheduled_at: DateTime<Utc>,
    /// Times this job has been put back on the queue this pass.
    pub attempt: u32,
}

/// Scanner tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Seconds between passes.
    ///
    /// Default: **60**.
    pub interval_secs: u64,

    /// Credentials processed concurrently.
    ///
    /// Default: **8**.
    pub max_workers: usize,

    /// Records fetched per `list_due` page.
    ///
    /// Default: **128**.
    pub page_size: usize,

    /// How often one job may be re-queued within a pass after a key outage
    /// or a lost write race.
    ///
    /// Default: **2**.
    pub max_requeues: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_workers: 8,
            page_size: DEFAULT_DUE_PAGE_SIZE,
            max_requeues: 2,
        }
    }
}

impl ScannerConfig {
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Set the worker count.  Zero is raised to one.
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    pub fn with_max_requeues(mut self, n: u32) -> Self {
        self.max_requeues = n;
        self
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Records `list_due` returned.
    pub due: usize,
    pub rotated: usize,
    pub expired: usize,
    pub abandoned: usize,
    pub superseded: usize,
    pub backing_off: usize,
    pub unchanged: usize,
    /// Rotation attempts charged to a credential's retry budget.
    pub failed: usize,
    /// Jobs still blocked after their re-queues, left for the next pass.
    pub deferred: usize,
    pub requeued: usize,
    /// Jobs dropped because the credential was already being processed.
    pub skipped_in_flight: usize,
    /// Anything else: store failures, panicked workers.
    pub errors: usize,
}

impl ScanReport {
    fn record(&mut self, outcome: &Outcome) {
        let slot = match outcome {
            Outcome::Rotated(_) => &mut self.rotated,
            Outcome::Expired(_) => &mut self.expired,
            Outcome::Abandoned(_) => &mut self.abandoned,
            Outcome::Superseded(_) => &mut self.superseded,
            Outcome::BackingOff { .. } => &mut self.backing_off,
            Outcome::Unchanged(_) => &mut self.unchanged,
        };
        *slot += 1;
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Feeds due credentials to the engine.  Cheap to clone.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    engine: Arc<LifecycleEngine>,
    config: ScannerConfig,
    queue: SegQueue<RotationJob>,
    /// Credential id → when its worker started.
    in_flight: DashMap<String, DateTime<Utc>>,
    /// Wakes the background loop early (trigger or shutdown).
    notify: Notify,
    shutdown: AtomicBool,
}

/// Removes a credential from the in-flight set when its worker ends, however
/// it ends.
struct InFlightGuard {
    inner: Arc<ScannerInner>,
    credential_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.credential_id);
    }
}

impl Scanner {
    #[must_use]
    pub fn new(engine: Arc<LifecycleEngine>, config: ScannerConfig) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                engine,
                config,
                queue: SegQueue::new(),
                in_flight: DashMap::new(),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.inner.config
    }

    /// Number of credentials being processed right now.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Run one pass to completion.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        if self.is_shut_down() {
            return Err(LifecycleError::ScannerShutdown);
        }

        let inner = &self.inner;
        let now = inner.engine.now();
        let mut report = ScanReport::default();

        let mut due = list_due(inner.engine.store(), now, inner.config.page_size);
        while let Some(record) = due.next().await? {
            report.due += 1;
            inner.queue.push(RotationJob {
                credential_id: record.id,
                scheduled_at: now,
                attempt: 0,
            });
        }

        self.drain(&mut report).await;

        if report.due > 0 {
            info!(
                due = report.due,
                rotated = report.rotated,
                expired = report.expired,
                failed = report.failed,
                deferred = report.deferred,
                errors = report.errors,
                "scan pass finished"
            );
        } else {
            debug!("scan pass found nothing due");
        }
        Ok(report)
    }

    /// Spawn the background loop: one pass immediately, then one every
    /// [`ScannerConfig::interval_secs`] or whenever [`trigger`](Self::trigger)
    /// is called.
    pub fn start(&self) -> JoinHandle<()> {
        let scanner = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(scanner.inner.config.interval_secs.max(1));
            info!(interval_secs = interval.as_secs(), "scanner started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scanner.inner.notify.notified() => {}
                }
                if scanner.is_shut_down() {
                    break;
                }
                match scanner.scan_once().await {
                    Ok(_) => {}
                    Err(LifecycleError::ScannerShutdown) => break,
                    Err(e) => error!(error = %e, "scan pass failed"),
                }
            }
            info!("scanner stopped");
        })
    }

    /// Ask the background loop for a pass now.
    pub fn trigger(&self) {
        self.inner.notify.notify_one();
    }

    /// Stop the background loop after the current pass.  Further
    /// [`scan_once`](Self::scan_once) calls fail.
    pub fn shutdown(&self) {
        info!("scanner shutdown requested");
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    // -- Private helpers ----------------------------------------------------

    async fn drain(&self, report: &mut ScanReport) {
        let inner = &self.inner;
        let permits = Arc::new(Semaphore::new(inner.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        loop {
            while let Some(job) = inner.queue.pop() {
                match inner.in_flight.entry(job.credential_id.clone()) {
                    Entry::Occupied(_) => {
                        debug!(credential_id = %job.credential_id, "already in flight, skipping");
                        report.skipped_in_flight += 1;
                        continue;
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(inner.engine.now());
                    }
                }
                let guard = InFlightGuard {
                    inner: Arc::clone(inner),
                    credential_id: job.credential_id.clone(),
                };

                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let engine = Arc::clone(&inner.engine);
                workers.spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    let result = engine.process(&job.credential_id).await;
                    (job, result)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            match joined {
                Ok((job, result)) => self.settle(job, result, report),
                Err(e) => {
                    report.errors += 1;
                    error!(error = %e, "rotation worker panicked");
                }
            }
        }
    }

    fn settle(&self, job: RotationJob, result: Result<Outcome>, report: &mut ScanReport) {
        let max_requeues = self.inner.config.max_requeues;
        match result {
            Ok(outcome) => {
                debug!(credential_id = %job.credential_id, outcome = outcome.label(), "job finished");
                report.record(&outcome);
            }
            Err(e) if e.is_requeueable() && job.attempt < max_requeues => {
                debug!(
                    credential_id = %job.credential_id,
                    attempt = job.attempt + 1,
                    error = %e,
                    "re-queueing job"
                );
                report.requeued += 1;
                self.inner.queue.push(RotationJob {
                    attempt: job.attempt + 1,
                    ..job
                });
            }
            Err(e) if e.is_requeueable() => {
                warn!(credential_id = %job.credential_id, error = %e, "job deferred to next pass");
                report.deferred += 1;
            }
            // Already recorded on the credential by the engine.
            Err(e) if e.counts_against_budget() => report.failed += 1,
            Err(e) => {
                error!(credential_id = %job.credential_id, error = %e, "credential evaluation failed");
                report.errors += 1;
            }
        }
    }
}
