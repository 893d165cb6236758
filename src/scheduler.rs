//! Per-conversation background funding scans.
//!
//! The [`JobRegistry`] holds at most one live [`ScanJob`] per conversation.
//! Every mutation (create, replace, cancel) happens inside a single critical
//! section of the registry lock: the old job's token is cancelled and the new
//! job installed before the lock is released, so the timer loop of a replaced
//! job can never tick again once its successor exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bot::{ConversationKey, MessageSink};
use crate::error::SchedulerError;
use crate::funding::FundingScanner;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    /// Delay before the first tick of a freshly created job.
    pub first_delay: Duration,
    /// Funding rates strictly below this are reported.
    pub threshold: f64,
}

#[derive(Debug)]
pub struct ScanJob {
    pub key: ConversationKey,
    pub interval: Duration,
    first_fire: Instant,
    cancel: CancellationToken,
}

impl ScanJob {
    /// Next tick at or after `now`. Ticks stay on the grid
    /// `first_fire + k * interval` because missed ticks are skipped.
    pub fn next_fire_time(&self, now: Instant) -> Instant {
        if now <= self.first_fire {
            return self.first_fire;
        }
        let elapsed = now - self.first_fire;
        let periods = elapsed.as_nanos().div_ceil(self.interval.as_nanos().max(1));
        self.first_fire + self.interval * periods as u32
    }
}

/// Live jobs plus the interval each conversation last chose. Intervals
/// outlive their job so a later `ensure_job` picks them up again.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<ConversationKey, ScanJob>,
    intervals: HashMap<ConversationKey, Duration>,
}

impl JobRegistry {
    fn install(&mut self, job: ScanJob) {
        self.intervals.insert(job.key, job.interval);
        if let Some(old) = self.jobs.insert(job.key, job) {
            old.cancel.cancel();
        }
    }

    fn remove(&mut self, key: ConversationKey) -> Option<ScanJob> {
        let job = self.jobs.remove(&key)?;
        job.cancel.cancel();
        Some(job)
    }
}

pub struct ScanScheduler {
    registry: Mutex<JobRegistry>,
    runtime: Handle,
    pool: WorkerPool,
    scanner: Arc<dyn FundingScanner>,
    sink: Arc<dyn MessageSink>,
    settings: ScanSettings,
}

impl ScanScheduler {
    /// Fails with [`SchedulerError::Unavailable`] when called outside a tokio
    /// runtime; callers should then run without background scanning.
    pub fn new(
        pool: WorkerPool,
        scanner: Arc<dyn FundingScanner>,
        sink: Arc<dyn MessageSink>,
        settings: ScanSettings,
    ) -> Result<Self, SchedulerError> {
        let runtime =
            Handle::try_current().map_err(|e| SchedulerError::Unavailable(e.to_string()))?;
        Ok(Self {
            registry: Mutex::new(JobRegistry::default()),
            runtime,
            pool,
            scanner,
            sink,
            settings,
        })
    }

    fn registry(&self) -> MutexGuard<'_, JobRegistry> {
        // Registry mutations cannot panic halfway, poisoning leaves the maps intact.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a job unless one is already live for `key`. Returns whether a
    /// job was created. A previously chosen interval wins over `default_interval`.
    pub fn ensure_job(&self, key: ConversationKey, default_interval: Duration) -> bool {
        let mut registry = self.registry();
        if registry.jobs.contains_key(&key) {
            return false;
        }
        let interval = registry
            .intervals
            .get(&key)
            .copied()
            .unwrap_or(default_interval);
        let job = self.start_job(key, interval);
        registry.install(job);
        info!(chat = %key, interval_secs = interval.as_secs(), "background funding scan started");
        true
    }

    /// Replaces any live job for `key` with one running every `interval`.
    pub fn reschedule_job(&self, key: ConversationKey, interval: Duration) {
        let mut registry = self.registry();
        let job = self.start_job(key, interval);
        registry.install(job);
        info!(chat = %key, interval_secs = interval.as_secs(), "background funding scan rescheduled");
    }

    /// Returns whether a job was live. The chosen interval is kept.
    pub fn cancel_job(&self, key: ConversationKey) -> bool {
        let removed = self.registry().remove(key).is_some();
        if removed {
            info!(chat = %key, "background funding scan cancelled");
        }
        removed
    }

    pub fn job_interval(&self, key: ConversationKey) -> Option<Duration> {
        self.registry().jobs.get(&key).map(|job| job.interval)
    }

    pub fn next_fire_time(&self, key: ConversationKey) -> Option<Instant> {
        let now = Instant::now();
        self.registry()
            .jobs
            .get(&key)
            .map(|job| job.next_fire_time(now))
    }

    pub fn job_count(&self) -> usize {
        self.registry().jobs.len()
    }

    fn start_job(&self, key: ConversationKey, interval: Duration) -> ScanJob {
        let interval = interval.max(Duration::from_secs(1));
        let first_fire = Instant::now() + self.settings.first_delay;
        let cancel = CancellationToken::new();

        let tick = TickContext {
            key,
            threshold: self.settings.threshold,
            pool: self.pool.clone(),
            scanner: self.scanner.clone(),
            sink: self.sink.clone(),
        };
        self.runtime
            .spawn(run_job(tick, first_fire, interval, cancel.clone()));

        ScanJob {
            key,
            interval,
            first_fire,
            cancel,
        }
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, job) in registry.jobs.drain() {
            job.cancel.cancel();
        }
    }
}

struct TickContext {
    key: ConversationKey,
    threshold: f64,
    pool: WorkerPool,
    scanner: Arc<dyn FundingScanner>,
    sink: Arc<dyn MessageSink>,
}

async fn run_job(
    tick: TickContext,
    first_fire: Instant,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval_at(first_fire, interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        if let Err(e) = run_tick(&tick, &cancel).await {
            warn!(error = %e, "funding scan tick failed, job keeps its schedule");
        }
    }
    debug!(chat = %tick.key, "scan job loop stopped");
}

/// One scan: check funding on the worker pool, deliver a non-empty report.
/// Cancellation aborts the in-flight check and suppresses delivery.
async fn run_tick(tick: &TickContext, cancel: &CancellationToken) -> Result<(), SchedulerError> {
    let failure = |reason: String| SchedulerError::TickFailure {
        key: tick.key,
        reason,
    };

    let scanner = tick.scanner.clone();
    let threshold = tick.threshold;
    let mut handle = tick
        .pool
        .spawn(async move { scanner.check_extreme_funding(threshold).await });

    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            handle.abort();
            return Ok(());
        }
        joined = &mut handle => joined,
    };

    let report = match joined {
        Ok(Ok(Ok(report))) => report,
        Ok(Ok(Err(e))) => return Err(failure(format!("{e:#}"))),
        Ok(Err(e)) => return Err(failure(e.to_string())),
        Err(e) => {
            error!(chat = %tick.key, error = %e, "funding check task panicked");
            return Err(failure(e.to_string()));
        }
    };

    let Some(text) = report.filter(|text| !text.trim().is_empty()) else {
        debug!(chat = %tick.key, "no extreme funding this tick");
        return Ok(());
    };
    if cancel.is_cancelled() {
        return Ok(());
    }

    tick.sink
        .send_message(tick.key, text)
        .await
        .map_err(|e| failure(format!("delivery failed: {e:#}")))
}
