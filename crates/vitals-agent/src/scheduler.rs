//! Scheduler: three independent periodic loops (ingest, upload, ping).
//!
//! Every loop runs in its own task on its own interval and owns a small
//! Idle/Running/Backoff state machine. A tick that hits a transient failure
//! puts its loop into Backoff; the next tick is skipped and the loop returns
//! to Idle. Loops never wait on each other: the buffer and governor are the
//! only shared state and neither is held across a network call.

use crate::batcher::{Batcher, NextBatch, NotReady};
use crate::buffer::{BufferStats, EventBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::AgentConfig;
use crate::error::{AgentResult, BufferError};
use crate::event::Category;
use crate::governor::{Activity, RateGovernor};
use crate::health::{HealthMonitor, HealthState, PingResult};
use crate::source::CategorySources;
use crate::upload::{self, UploadClient, UploadOutcome};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Loop state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Backoff,
}

/// How a tick ended, as far as its loop is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    TransientFailure,
}

#[derive(Debug)]
pub struct LoopControl {
    name: &'static str,
    state: LoopState,
}

impl LoopControl {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Called on every interval tick. Returns whether work should run.
    pub fn begin_tick(&mut self) -> bool {
        match self.state {
            LoopState::Backoff => {
                debug!(task = self.name, "backing off for one tick");
                self.state = LoopState::Idle;
                false
            }
            LoopState::Idle | LoopState::Running => {
                self.state = LoopState::Running;
                true
            }
        }
    }

    pub fn end_tick(&mut self, outcome: TickOutcome) {
        self.state = match outcome {
            TickOutcome::Completed => LoopState::Idle,
            TickOutcome::TransientFailure => LoopState::Backoff,
        };
    }
}

// ---------------------------------------------------------------------------
// Tick reports
// ---------------------------------------------------------------------------

/// What one ingestion tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub ingested: usize,
    /// Vitals stopped because the sample quota is used up.
    pub quota_limited: bool,
    /// A category stopped because its reject-new buffer is at capacity.
    pub buffer_full: bool,
    pub error: Option<String>,
}

impl IngestReport {
    pub fn outcome(&self) -> TickOutcome {
        if self.error.is_some() {
            TickOutcome::TransientFailure
        } else {
            TickOutcome::Completed
        }
    }
}

/// What one upload tick did, by batch id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub rejected: Vec<String>,
    pub retrying: Vec<String>,
    pub not_ready: Vec<(Category, NotReady)>,
    pub errors: Vec<String>,
}

impl UploadReport {
    pub fn outcome(&self) -> TickOutcome {
        if self.retrying.is_empty() && self.errors.is_empty() {
            TickOutcome::Completed
        } else {
            TickOutcome::TransientFailure
        }
    }
}

fn ping_outcome(result: &PingResult) -> TickOutcome {
    match result {
        PingResult::Unhealthy(_) => TickOutcome::TransientFailure,
        PingResult::Healthy | PingResult::Skipped => TickOutcome::Completed,
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// All components wired together.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    buffer: Arc<EventBuffer>,
    governor: Arc<RateGovernor>,
    health: Arc<HealthState>,
    batcher: Batcher,
    uploader: UploadClient,
    monitor: HealthMonitor,
    sources: CategorySources,
    status_path: Option<PathBuf>,
    /// Index of the category offered upload quota first on the next tick.
    first_category: AtomicUsize,
}

impl Agent {
    /// Wire components around an existing buffer and sources. `config` must
    /// already be validated.
    pub fn new(
        config: AgentConfig,
        clock: Arc<dyn Clock>,
        buffer: Arc<EventBuffer>,
        sources: CategorySources,
    ) -> AgentResult<Self> {
        let http = upload::http_client(&config)?;
        let health = Arc::new(HealthState::new(
            config.device_id.clone(),
            config.degraded_threshold,
            clock.clone(),
        ));
        let governor = Arc::new(RateGovernor::from_config(&config, clock.clone()));
        let batcher = Batcher::new(
            buffer.clone(),
            governor.clone(),
            config.device_id.clone(),
            config.upload_batch_size,
        );
        let uploader = UploadClient::new(http.clone(), &config, health.clone());
        let monitor = HealthMonitor::new(
            http,
            config.health_url(),
            governor.clone(),
            health.clone(),
        );
        Ok(Self {
            config,
            clock,
            buffer,
            governor,
            health,
            batcher,
            uploader,
            monitor,
            sources,
            status_path: None,
            first_category: AtomicUsize::new(0),
        })
    }

    /// Production wiring: system clock, persisted buffer, inbox sources and
    /// status file, all under the configured state directory.
    pub fn open(config: AgentConfig) -> AgentResult<Self> {
        let paths = config.paths();
        let buffer = Arc::new(EventBuffer::open(
            &paths,
            config.buffer_capacity,
            config.overflow_policy,
        )?);
        let sources = CategorySources::inbox(&config)?;
        let agent = Self::new(config, Arc::new(SystemClock), buffer, sources)?;
        Ok(agent.with_status_file(paths.status()))
    }

    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn buffer_stats(&self) -> Vec<BufferStats> {
        Category::ALL
            .into_iter()
            .map(|c| self.buffer.stats(c))
            .collect()
    }

    fn write_status(&self) {
        let Some(path) = &self.status_path else {
            return;
        };
        if let Err(e) = self.health.write_status(path, self.buffer_stats()) {
            warn!(path = %path.display(), error = %e, "failed to write status file");
        }
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    /// Move readings from each category's source into the buffer. Vitals
    /// spend sample quota; feedings are discrete records and are not rate
    /// limited. A reading that cannot be buffered stays in its source and
    /// only stops its own category.
    ///
    /// Ingestion is at-least-once: a reading is buffered before its source
    /// position moves, so a failed `advance` (or a crash between the two)
    /// buffers it again under a new sequence id.
    pub fn ingest_tick(&self) -> IngestReport {
        let mut report = IngestReport::default();
        for category in Category::ALL {
            self.ingest_category(category, &mut report);
        }
        if report.ingested > 0 {
            info!(ingested = report.ingested, "ingested readings");
        }
        report
    }

    fn ingest_category(&self, category: Category, report: &mut IngestReport) {
        let mut source = self.sources.lock(category);
        loop {
            let reading = match source.peek() {
                Ok(Some(r)) => r,
                Ok(None) => return,
                Err(e) => {
                    warn!(category = %category, error = %e, "event source unavailable");
                    report.error = Some(e.to_string());
                    return;
                }
            };
            if !self.buffer.accepts(category) {
                debug!(category = %category, "buffer full, leaving reading in source");
                report.buffer_full = true;
                return;
            }
            if category == Category::Vitals && !self.governor.try_consume(Activity::Sample) {
                report.quota_limited = true;
                return;
            }
            let captured_at = reading.captured_or(self.clock.now());
            match self.buffer.enqueue(category, reading.payload, captured_at) {
                Ok(event) => {
                    debug!(category = %category, sequence_id = event.sequence_id, "event buffered");
                    report.ingested += 1;
                }
                Err(BufferError::BufferFull { .. }) => {
                    report.buffer_full = true;
                    return;
                }
                Err(e) => {
                    error!(category = %category, error = %e, "failed to buffer event");
                    report.error = Some(e.to_string());
                    return;
                }
            }
            if let Err(e) = source.advance() {
                // Already buffered; the same reading is read again next tick.
                error!(category = %category, error = %e, "failed to record source position");
                report.error = Some(e.to_string());
                return;
            }
        }
    }

    /// Offer each category one upload attempt, rotating which goes first.
    pub async fn upload_tick(&self) -> UploadReport {
        let mut report = UploadReport::default();
        let first = self.first_category.fetch_add(1, Ordering::Relaxed);
        let order = Category::ALL
            .into_iter()
            .cycle()
            .skip(first % Category::ALL.len())
            .take(Category::ALL.len());
        for category in order {
            self.upload_category(category, &mut report).await;
        }
        self.write_status();
        report
    }

    async fn upload_category(&self, category: Category, report: &mut UploadReport) {
        let batch = match self.batcher.build_next_batch(category) {
            NextBatch::Ready(batch) => batch,
            NextBatch::NoBatchReady(reason) => {
                if reason == NotReady::QuotaExceeded {
                    debug!(category = %category, "upload quota exhausted");
                }
                report.not_ready.push((category, reason));
                return;
            }
        };
        let batch_id = batch.batch_id().to_string();

        match self.uploader.upload(&batch).await {
            UploadOutcome::Success(_) => {
                self.batcher.clear_retry(category);
                match self.buffer.commit(category, batch.last_sequence_id()) {
                    Ok(removed) => {
                        info!(batch_id = %batch_id, events = removed, "batch uploaded");
                        report.uploaded.push(batch_id);
                    }
                    Err(e) => {
                        error!(batch_id = %batch_id, error = %e, "uploaded batch could not be committed");
                        report.errors.push(e.to_string());
                    }
                }
            }
            UploadOutcome::PermanentFailure(_) => {
                self.batcher.clear_retry(category);
                if let Err(e) = self.buffer.commit(category, batch.last_sequence_id()) {
                    error!(batch_id = %batch_id, error = %e, "rejected batch could not be discarded");
                    report.errors.push(e.to_string());
                }
                report.rejected.push(batch_id);
            }
            UploadOutcome::TransientFailure(_) => {
                self.batcher.mark_retry(&batch);
                let events = batch.into_events();
                if let Err(e) = self.buffer.requeue(category, events) {
                    error!(batch_id = %batch_id, error = %e, "failed to requeue batch");
                    report.errors.push(e.to_string());
                }
                report.retrying.push(batch_id);
            }
        }
    }

    pub async fn ping_tick(&self) -> PingResult {
        let result = self.monitor.tick().await;
        self.write_status();
        result
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    /// Run the three loops until `shutdown` is cancelled. A tick already in
    /// progress finishes before its loop exits.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            device_id = %self.config.device_id,
            ingest_secs = self.config.ingest_interval().as_secs_f64(),
            upload_secs = self.config.upload_interval().as_secs_f64(),
            ping_secs = self.config.ping_interval().as_secs_f64(),
            "agent started"
        );

        let ingest = tokio::spawn(run_loop(
            "ingest",
            self.config.ingest_interval(),
            shutdown.clone(),
            {
                let agent = self.clone();
                move || {
                    let agent = agent.clone();
                    async move {
                        match tokio::task::spawn_blocking(move || agent.ingest_tick()).await {
                            Ok(report) => report.outcome(),
                            Err(e) => {
                                error!(error = %e, "ingest task panicked");
                                TickOutcome::TransientFailure
                            }
                        }
                    }
                }
            },
        ));
        let upload = tokio::spawn(run_loop(
            "upload",
            self.config.upload_interval(),
            shutdown.clone(),
            {
                let agent = self.clone();
                move || {
                    let agent = agent.clone();
                    async move { agent.upload_tick().await.outcome() }
                }
            },
        ));
        let ping = tokio::spawn(run_loop(
            "ping",
            self.config.ping_interval(),
            shutdown.clone(),
            {
                let agent = self.clone();
                move || {
                    let agent = agent.clone();
                    async move { ping_outcome(&agent.ping_tick().await) }
                }
            },
        ));

        for (name, handle) in [("ingest", ingest), ("upload", upload), ("ping", ping)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "loop task failed");
            }
        }
        self.write_status();
        info!("agent stopped");
    }
}

/// Drive `tick` every `period` until `shutdown` fires.
async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = TickOutcome>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut control = LoopControl::new(name);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if control.begin_tick() {
                    let outcome = tick().await;
                    control.end_tick(outcome);
                    if control.state() == LoopState::Backoff {
                        debug!(task = name, "entering backoff");
                    }
                }
            }
        }
    }
    debug!(task = name, "loop stopped");
}
