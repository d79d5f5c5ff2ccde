//! The worker's polling engine.
//!
//! Startup connects to every configured broker and registers with the
//! reachable ones. The main loop then polls the available brokers in
//! round-robin order, re-probes all of them on a fixed interval, and
//! reconnects from scratch after too many consecutive poll failures or
//! when no broker is left.

use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::backoff::Backoff;
use relay_core::job::JobView;
use relay_core::protocol::RegisterWorker;
use tokio_util::sync::CancellationToken;

use crate::backend::ProcessingBackend;
use crate::client::{BrokerClient, Timeouts};
use crate::config::WorkerConfig;
use crate::pool::BrokerPool;
use crate::runner::{JobOutcome, JobRunner, RunnerSettings};

/// Empty polls between idle log lines once past `max_empty_polls`.
const IDLE_LOG_EVERY: u64 = 10;

/// Loop timing and thresholds.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub health_check_interval: Duration,
    pub max_consecutive_failures: u32,
    pub connection_retry_delay: Duration,
    /// `0` retries forever.
    pub max_startup_attempts: u32,
    pub max_empty_polls: u64,
}

/// Startup gave up before reaching any broker.
#[derive(Debug, thiserror::Error)]
#[error("No broker reachable after {attempts} attempts")]
pub struct StartupError {
    pub attempts: u32,
}

/// Result of one round over the available brokers.
#[derive(Debug)]
pub enum PollOutcome {
    Claimed { broker: usize, job: JobView },
    Empty,
    NoBrokers,
}

/// Counters kept for status logging.
#[derive(Debug, Clone, Default)]
pub struct PollerStats {
    pub polls: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_abandoned: u64,
    pub reports_failed: u64,
    pub uploads: u64,
    pub reconnects: u64,
}

pub struct Poller {
    settings: PollerSettings,
    pool: BrokerPool,
    backend: Arc<dyn ProcessingBackend>,
    runner: JobRunner,
    registration: RegisterWorker,
    stats: PollerStats,
    consecutive_failures: u32,
    consecutive_empty: u64,
    started_at: Instant,
}

impl Poller {
    pub fn new(
        settings: PollerSettings,
        pool: BrokerPool,
        backend: Arc<dyn ProcessingBackend>,
        runner: JobRunner,
        registration: RegisterWorker,
    ) -> Self {
        Self {
            settings,
            pool,
            backend,
            runner,
            registration,
            stats: PollerStats::default(),
            consecutive_failures: 0,
            consecutive_empty: 0,
            started_at: Instant::now(),
        }
    }

    /// Wire a poller from configuration. All brokers share one HTTP
    /// connection pool.
    pub fn from_config(config: &WorkerConfig, backend: Arc<dyn ProcessingBackend>) -> Self {
        let http = reqwest::Client::new();
        let timeouts = Timeouts {
            request: config.http_timeout,
            poll: config.poll_timeout,
            health: config.health_timeout,
        };
        let clients = config
            .brokers
            .iter()
            .map(|url| BrokerClient::with_client(http.clone(), url.clone(), timeouts))
            .collect();

        let runner = JobRunner::new(
            RunnerSettings {
                worker_id: config.worker_id.clone(),
                work_dir: config.work_dir.clone(),
                estimator: config.estimator(),
                extra_buffer: config.processing_extra_buffer,
                file_check_interval: config.file_check_interval,
                output_wait: config.output_wait,
            },
            Arc::clone(&backend),
        );

        Self::new(
            PollerSettings {
                poll_interval: config.poll_interval,
                health_check_interval: config.health_check_interval,
                max_consecutive_failures: config.max_consecutive_failures,
                connection_retry_delay: config.connection_retry_delay,
                max_startup_attempts: config.max_startup_attempts,
                max_empty_polls: config.max_empty_polls,
            },
            BrokerPool::new(clients),
            backend,
            runner,
            RegisterWorker {
                worker_id: config.worker_id.clone(),
                capabilities: config.capabilities.clone(),
                local_port: config.local_port,
            },
        )
    }

    pub fn pool(&self) -> &BrokerPool {
        &self.pool
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Probe every broker and the backend, then register with the
    /// reachable brokers. Returns `true` when at least one registration
    /// succeeded and the backend answered.
    ///
    /// Brokers stay out of the rotation until a later `connect` succeeds
    /// whenever the backend is down, so the main loop keeps reconnecting
    /// instead of claiming jobs it cannot process.
    pub async fn connect(&mut self) -> bool {
        for index in 0..self.pool.len() {
            self.probe_broker(index).await;
        }
        let available = self.pool.available_count();
        if available == 0 {
            tracing::warn!(brokers = self.pool.len(), "No broker reachable");
            return false;
        }

        if let Err(e) = self.backend.probe().await {
            tracing::warn!(error = %e, "Processing backend unreachable");
            for index in 0..self.pool.len() {
                self.pool
                    .mark_unavailable(index, format!("processing backend unreachable: {e}"));
            }
            return false;
        }

        self.register_all().await > 0
    }

    /// Retry [`connect`](Self::connect) at a fixed delay until it
    /// succeeds, the attempt budget runs out, or `cancel` fires.
    ///
    /// Returns `Ok(false)` when cancelled before connecting.
    pub async fn startup(&mut self, cancel: &CancellationToken) -> Result<bool, StartupError> {
        let mut policy = Backoff::fixed(self.settings.connection_retry_delay);
        if self.settings.max_startup_attempts > 0 {
            policy = policy.with_max_attempts(self.settings.max_startup_attempts);
        }

        let mut attempt = 0u32;
        let mut delay = policy.initial_delay;
        loop {
            attempt += 1;
            if self.connect().await {
                tracing::info!(
                    attempt,
                    available = self.pool.available_count(),
                    brokers = self.pool.len(),
                    "Connected to brokers"
                );
                return Ok(true);
            }

            if policy.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(StartupError { attempts: attempt });
            }

            tracing::info!(attempt, delay_secs = delay.as_secs_f64(), "Retrying broker connection");
            if !sleep_or_cancel(delay, cancel).await {
                return Ok(false);
            }
            delay = policy.next_delay(delay);
        }
    }

    /// Startup followed by the main loop until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PollerStats, StartupError> {
        if !self.startup(&cancel).await? {
            return Ok(self.stats);
        }

        let mut last_health_check = Instant::now();
        while !cancel.is_cancelled() {
            if last_health_check.elapsed() >= self.settings.health_check_interval {
                self.health_check().await;
                last_health_check = Instant::now();
            }

            match self.poll_once().await {
                PollOutcome::Claimed { broker, job } => self.handle_job(broker, job).await,
                PollOutcome::Empty => {}
                PollOutcome::NoBrokers => {
                    tracing::warn!("No available brokers, reconnecting");
                    if !sleep_or_cancel(self.settings.connection_retry_delay, &cancel).await {
                        break;
                    }
                    self.reconnect().await;
                    continue;
                }
            }

            if self.consecutive_failures >= self.settings.max_consecutive_failures {
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "Too many consecutive poll failures, reconnecting"
                );
                if !sleep_or_cancel(self.settings.connection_retry_delay, &cancel).await {
                    break;
                }
                self.reconnect().await;
                self.consecutive_failures = 0;
            }

            if !sleep_or_cancel(self.settings.poll_interval, &cancel).await {
                break;
            }
        }

        self.log_status("Worker stopped");
        Ok(self.stats)
    }

    /// Try each available broker once, starting at the round-robin cursor,
    /// and stop at the first one with a job.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let round = self.pool.round();
        if round.is_empty() {
            return PollOutcome::NoBrokers;
        }
        self.stats.polls += 1;

        let worker_id = self.registration.worker_id.clone();
        for &index in &round {
            match self.pool.client(index).next_job(&worker_id).await {
                Ok(Some(job)) => {
                    self.pool.record_job(index);
                    self.pool.finish_round(&round, Some(index));
                    self.consecutive_failures = 0;
                    self.consecutive_empty = 0;
                    self.stats.jobs_claimed += 1;
                    tracing::info!(
                        job_id = %job.id,
                        broker = %self.pool.client(index).base_url(),
                        "Claimed job"
                    );
                    return PollOutcome::Claimed { broker: index, job };
                }
                Ok(None) => {}
                Err(e) => {
                    if e.is_transient() {
                        self.consecutive_failures += 1;
                    }
                    self.pool.mark_unavailable(index, e.to_string());
                }
            }
        }

        self.pool.finish_round(&round, None);
        self.consecutive_empty += 1;
        if self.consecutive_empty > self.settings.max_empty_polls
            && self.consecutive_empty % IDLE_LOG_EVERY == 0
        {
            tracing::info!(empty_polls = self.consecutive_empty, "No jobs available");
        }
        PollOutcome::Empty
    }

    /// Re-probe every broker. Recovered brokers are re-registered before
    /// they rejoin the rotation, and only while the backend answers.
    pub async fn health_check(&mut self) {
        let mut backend_up = None;
        for index in 0..self.pool.len() {
            let was_available = self.pool.entries()[index].available;
            if !self.probe_broker(index).await || was_available {
                continue;
            }

            if backend_up.is_none() {
                backend_up = Some(self.backend.probe().await.map_err(|e| e.to_string()));
            }
            if let Some(Err(reason)) = &backend_up {
                self.pool
                    .mark_unavailable(index, format!("processing backend unreachable: {reason}"));
                continue;
            }

            tracing::info!(broker = %self.pool.client(index).base_url(), "Broker recovered");
            self.register_with(index).await;
        }
        self.log_status("Health check");
    }

    async fn handle_job(&mut self, broker: usize, job: JobView) {
        let client = self.pool.client(broker).clone();
        match self.runner.run(&client, job).await {
            JobOutcome::Abandoned => self.stats.jobs_abandoned += 1,
            JobOutcome::Reported { success, uploaded } => {
                if success {
                    self.stats.jobs_succeeded += 1;
                } else {
                    self.stats.jobs_failed += 1;
                }
                if uploaded {
                    self.stats.uploads += 1;
                }
            }
            JobOutcome::ReportFailed { .. } => self.stats.reports_failed += 1,
        }
    }

    /// A failed reconnect leaves the pool empty, so the next poll reports
    /// [`PollOutcome::NoBrokers`] and the loop retries after the delay.
    async fn reconnect(&mut self) {
        self.stats.reconnects += 1;
        if self.connect().await {
            tracing::info!(available = self.pool.available_count(), "Reconnected to brokers");
        } else {
            tracing::warn!(reconnects = self.stats.reconnects, "Reconnect failed");
        }
    }

    /// Health-check one broker and update its availability.
    async fn probe_broker(&mut self, index: usize) -> bool {
        match self.pool.client(index).health().await {
            Ok(_) => {
                self.pool.mark_available(index);
                true
            }
            Err(e) => {
                self.pool.mark_unavailable(index, e.to_string());
                false
            }
        }
    }

    async fn register_all(&mut self) -> usize {
        let mut registered = 0;
        for index in self.pool.available() {
            if self.register_with(index).await {
                registered += 1;
            }
        }
        registered
    }

    async fn register_with(&mut self, index: usize) -> bool {
        match self.pool.client(index).register(&self.registration).await {
            Ok(_) => {
                tracing::info!(
                    broker = %self.pool.client(index).base_url(),
                    worker_id = %self.registration.worker_id,
                    "Registered with broker"
                );
                true
            }
            Err(e) => {
                self.pool.mark_unavailable(index, format!("registration failed: {e}"));
                false
            }
        }
    }

    fn log_status(&self, context: &str) {
        let s = &self.stats;
        tracing::info!(
            uptime_secs = self.started_at.elapsed().as_secs(),
            available = self.pool.available_count(),
            brokers = self.pool.len(),
            polls = s.polls,
            claimed = s.jobs_claimed,
            succeeded = s.jobs_succeeded,
            failed = s.jobs_failed,
            abandoned = s.jobs_abandoned,
            uploads = s.uploads,
            "{context}: {}",
            self.pool.summary()
        );
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` on
/// cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
