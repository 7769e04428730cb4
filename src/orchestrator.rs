//! Worker pool executing AI requests against prioritized providers.
//!
//! Tasks enter a bounded queue and are pulled by a fixed set of executors. Each task walks
//! the provider list in priority order: unhealthy providers are skipped, providers without a
//! free rate-limit slot are deferred to the end of the walk, transient failures are retried
//! with exponential backoff on the same provider and everything else fails over at once.
//! Provider stats are recorded once per provider per task.
//!
//! Health is judged on a rolling window of recent outcomes. A provider over the failure
//! ceiling is skipped until it has been quiet for `health_cooldown`, then a single task may
//! try it again; a successful trial clears the window.

use crate::config::OrchestratorConfig;
use crate::error::{CoreError, CoreResult};
use crate::providers::{AiProvider, ProviderFailure};
use crate::types::{AiResponse, ProviderStats, WorkerRequest, WorkerStatus, WorkerTask};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Running,
    Paused,
    Stopped,
}

/// Minimum interval between two requests to one provider
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    /// Claim the slot if it is free right now
    fn try_acquire(&self) -> bool {
        let Ok(mut last) = self.last_request.try_lock() else {
            return false;
        };
        match *last {
            Some(t) if t.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Wait until the slot frees up, then claim it
    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        *last = Some(Instant::now());
    }
}

struct ProviderSlot {
    provider: Arc<dyn AiProvider>,
    limiter: RateLimiter,
    stats: std::sync::Mutex<ProviderStats>,
    /// Set while one task is trying an unhealthy provider
    trial: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    /// Unhealthy, but this task holds the single trial call
    Trial,
    Skip,
}

impl ProviderSlot {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn record(&self, elapsed: Duration, error: Option<&str>) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(elapsed, error);
        }
    }

    /// Outcome of a trial call: success clears the window, either way the trial ends
    fn finish_trial(&self, succeeded: bool) {
        if succeeded {
            if let Ok(mut stats) = self.stats.lock() {
                stats.reset_window();
            }
            info!("Provider {} recovered", self.name());
        }
        self.trial.store(false, Ordering::SeqCst);
    }

    fn snapshot(&self) -> ProviderStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| ProviderStats::new(self.name()))
    }
}

/// Provider registration: the adapter plus its minimum request interval
pub struct ProviderRegistration {
    pub provider: Arc<dyn AiProvider>,
    pub min_interval: Duration,
}

impl ProviderRegistration {
    pub fn new(provider: Arc<dyn AiProvider>, min_interval: Duration) -> Self {
        Self { provider, min_interval }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicU64,
    stop_checks: AtomicU64,
    stop_check_total_ns: AtomicU64,
    stop_check_max_ns: AtomicU64,
}

/// Pool snapshot returned by [`WorkerOrchestrator::status`]
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub name: String,
    pub state: PoolState,
    pub executors: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stopped: u64,
    pub stop_checks: u64,
    pub stop_check_total_ns: u64,
    pub stop_check_max_ns: u64,
}

struct Job {
    task: WorkerTask,
    /// Stop epoch at submission; a later stop cancels the job
    epoch: u64,
    reply: oneshot::Sender<CoreResult<AiResponse>>,
}

/// Handle to a submitted task
pub struct TaskHandle {
    pub task_id: u64,
    receiver: oneshot::Receiver<CoreResult<AiResponse>>,
}

impl TaskHandle {
    pub async fn wait(self) -> CoreResult<AiResponse> {
        self.receiver.await.unwrap_or(Err(CoreError::WorkerStopped))
    }
}

struct Shared {
    name: String,
    config: OrchestratorConfig,
    slots: Vec<ProviderSlot>,
    counters: Counters,
    /// Bumped by every stop
    stop_epoch: AtomicU64,
}

pub struct WorkerOrchestrator {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Job>,
    state: watch::Sender<PoolState>,
    next_id: AtomicU64,
}

impl WorkerOrchestrator {
    /// Build the pool and spawn its executors on the current runtime
    pub fn start(
        name: impl Into<String>,
        config: OrchestratorConfig,
        providers: Vec<ProviderRegistration>,
    ) -> Arc<Self> {
        let name = name.into();
        let slots = providers
            .into_iter()
            .map(|reg| ProviderSlot {
                stats: std::sync::Mutex::new(ProviderStats::with_window(
                    reg.provider.name(),
                    config.health_window,
                )),
                limiter: RateLimiter::new(reg.min_interval),
                trial: AtomicBool::new(false),
                provider: reg.provider,
            })
            .collect::<Vec<_>>();

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(PoolState::Running);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = config.workers.max(1);

        info!(
            "Starting orchestrator '{}' with {} executors and {} providers",
            name,
            workers,
            slots.len()
        );

        let shared = Arc::new(Shared {
            name,
            config,
            slots,
            counters: Counters::default(),
            stop_epoch: AtomicU64::new(0),
        });

        for _ in 0..workers {
            tokio::spawn(run_executor(
                shared.clone(),
                receiver.clone(),
                state.subscribe(),
            ));
        }

        Arc::new(Self {
            shared,
            sender,
            state,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a request. A full queue is reported as `Busy`.
    pub fn submit(&self, request: WorkerRequest) -> CoreResult<TaskHandle> {
        // Epoch is read first: a stop landing after this point still cancels the job
        let epoch = self.shared.stop_epoch.load(Ordering::SeqCst);
        if *self.state.borrow() == PoolState::Stopped {
            return Err(CoreError::WorkerStopped);
        }
        let task = WorkerTask::new(self.next_id.fetch_add(1, Ordering::SeqCst), request);
        let task_id = task.id;
        let (reply, receiver) = oneshot::channel();

        // Count before sending so an executor never decrements below zero
        self.shared.counters.queued.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(Job { task, epoch, reply }) {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::SeqCst);
                Ok(TaskHandle { task_id, receiver })
            }
            Err(e) => {
                self.shared.counters.queued.fetch_sub(1, Ordering::SeqCst);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(CoreError::Busy),
                    mpsc::error::TrySendError::Closed(_) => Err(CoreError::WorkerStopped),
                }
            }
        }
    }

    /// Submit and wait for the outcome, giving up after `timeout`
    pub async fn execute(&self, request: WorkerRequest, timeout: Duration) -> CoreResult<AiResponse> {
        let handle = self.submit(request)?;
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ProviderTimeout {
                provider: self.shared.name.clone(),
            }),
        }
    }

    pub fn pause(&self) {
        info!("Pausing orchestrator '{}'", self.shared.name);
        self.state.send_replace(PoolState::Paused);
    }

    /// Every task queued before this call is marked stopped, even after a resume
    pub fn stop(&self) {
        info!("Stopping orchestrator '{}'", self.shared.name);
        self.state.send_replace(PoolState::Stopped);
        self.shared.stop_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("Resuming orchestrator '{}'", self.shared.name);
        self.state.send_replace(PoolState::Running);
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let c = &self.shared.counters;
        OrchestratorStatus {
            name: self.shared.name.clone(),
            state: self.state(),
            executors: self.shared.config.workers.max(1),
            queue_depth: c.queued.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            submitted: c.submitted.load(Ordering::SeqCst),
            succeeded: c.succeeded.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            stopped: c.stopped.load(Ordering::SeqCst),
            stop_checks: c.stop_checks.load(Ordering::SeqCst),
            stop_check_total_ns: c.stop_check_total_ns.load(Ordering::SeqCst),
            stop_check_max_ns: c.stop_check_max_ns.load(Ordering::SeqCst),
        }
    }

    pub fn stats(&self, provider: &str) -> CoreResult<ProviderStats> {
        self.shared
            .slots
            .iter()
            .find(|s| s.name() == provider)
            .map(ProviderSlot::snapshot)
            .ok_or_else(|| CoreError::NotFound(format!("provider {}", provider)))
    }

    /// Stats for every provider, in priority order
    pub fn all_stats(&self) -> Vec<ProviderStats> {
        self.shared.slots.iter().map(ProviderSlot::snapshot).collect()
    }
}

async fn run_executor(
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut state: watch::Receiver<PoolState>,
) {
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(Job { mut task, epoch, reply }) = job else {
            debug!("Orchestrator '{}' queue closed, executor exiting", shared.name);
            return;
        };
        shared.counters.queued.fetch_sub(1, Ordering::SeqCst);

        let held = shared.hold_while_paused(&mut state).await;
        if held == PoolState::Stopped || epoch < shared.stop_epoch.load(Ordering::SeqCst) {
            task.status = WorkerStatus::Stopped;
            shared.counters.stopped.fetch_add(1, Ordering::SeqCst);
            debug!("Task {} stopped before start", task.id);
            let _ = reply.send(Err(CoreError::WorkerStopped));
            continue;
        }

        shared.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        task.status = WorkerStatus::Running;
        task.started_at = Some(Utc::now());
        let started = Instant::now();

        let result = shared.process(&mut task, &mut state).await;

        task.duration = Some(started.elapsed());
        shared.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(resp) => {
                task.status = WorkerStatus::Succeeded;
                shared.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Task {} succeeded on {} after {} retries in {:?}",
                    task.id, resp.provider, task.retry_count, task.duration
                );
            }
            Err(e) => {
                task.status = WorkerStatus::Failed;
                shared.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Task {} failed: {}", task.id, e);
            }
        }
        // The caller may have given up waiting
        let _ = reply.send(result);
    }
}

impl Shared {
    /// Read the pool state, recording how long the check took
    fn check_state(&self, state: &watch::Receiver<PoolState>) -> PoolState {
        let start = Instant::now();
        let current = *state.borrow();
        let ns = start.elapsed().as_nanos() as u64;
        let c = &self.counters;
        c.stop_checks.fetch_add(1, Ordering::Relaxed);
        c.stop_check_total_ns.fetch_add(ns, Ordering::Relaxed);
        c.stop_check_max_ns.fetch_max(ns, Ordering::Relaxed);
        current
    }

    /// Block while paused; returns the state that ended the wait
    async fn hold_while_paused(&self, state: &mut watch::Receiver<PoolState>) -> PoolState {
        loop {
            match self.check_state(state) {
                PoolState::Paused => {
                    if state.changed().await.is_err() {
                        return PoolState::Stopped;
                    }
                }
                other => return other,
            }
        }
    }

    /// Sleep in poll-interval slices so a pause takes hold inside long backoffs
    async fn sleep_observing(&self, total: Duration, state: &mut watch::Receiver<PoolState>) {
        let poll = self.config.stop_poll_interval.max(Duration::from_millis(1));
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep((deadline - now).min(poll)).await;
            self.hold_while_paused(state).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    fn health(&self, slot: &ProviderSlot) -> Health {
        let stats = slot.snapshot();
        if (stats.window_samples() as u64) < self.config.min_samples_for_health
            || stats.failure_rate <= self.config.failure_rate_ceiling
        {
            return Health::Healthy;
        }
        let cooled = stats
            .since_last_outcome()
            .map_or(true, |quiet| quiet >= self.config.health_cooldown);
        if cooled
            && slot
                .trial
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Health::Trial;
        }
        Health::Skip
    }

    /// `attempt` plus trial bookkeeping
    async fn attempt_with_health(
        &self,
        slot: &ProviderSlot,
        trial: bool,
        task: &mut WorkerTask,
        deadline: Instant,
        state: &mut watch::Receiver<PoolState>,
    ) -> CoreResult<AiResponse> {
        if trial {
            info!("Trying unhealthy provider {} after cooldown", slot.name());
        }
        let result = self.attempt(slot, task, deadline, state).await;
        if trial {
            slot.finish_trial(result.is_ok());
        }
        result
    }

    async fn process(
        &self,
        task: &mut WorkerTask,
        state: &mut watch::Receiver<PoolState>,
    ) -> CoreResult<AiResponse> {
        let deadline = Instant::now() + self.config.task_timeout;
        let mut deferred = Vec::new();
        let mut last_error: Option<CoreError> = None;

        for slot in &self.slots {
            let trial = match self.health(slot) {
                Health::Skip => {
                    debug!("Skipping unhealthy provider {}", slot.name());
                    continue;
                }
                Health::Trial => true,
                Health::Healthy => false,
            };
            if !slot.limiter.try_acquire() {
                deferred.push((slot, trial));
                continue;
            }
            match self.attempt_with_health(slot, trial, task, deadline, state).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_error = Some(e),
            }
        }

        // Rate-limited providers get a blocking turn, bounded by the task deadline
        for (slot, trial) in deferred {
            self.hold_while_paused(state).await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, slot.limiter.wait()).await.is_err() {
                if trial {
                    slot.finish_trial(false);
                }
                last_error = Some(CoreError::ProviderTimeout {
                    provider: slot.name().to_string(),
                });
                continue;
            }
            match self.attempt_with_health(slot, trial, task, deadline, state).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_error = Some(e),
            }
        }

        Err(CoreError::AllProvidersExhausted {
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no healthy provider available".to_string()),
        })
    }

    /// Run one provider to a final outcome, retrying transient failures in place
    async fn attempt(
        &self,
        slot: &ProviderSlot,
        task: &mut WorkerTask,
        deadline: Instant,
        state: &mut watch::Receiver<PoolState>,
    ) -> CoreResult<AiResponse> {
        let started = Instant::now();
        let mut retries = 0u32;
        task.provider = Some(slot.name().to_string());

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = if remaining.is_zero() {
                Err(ProviderFailure::Timeout)
            } else {
                tokio::time::timeout(remaining, slot.provider.invoke(&task.payload))
                    .await
                    .unwrap_or(Err(ProviderFailure::Timeout))
            };

            let err = match outcome {
                Ok(mut resp) => {
                    slot.record(started.elapsed(), None);
                    if resp.provider.is_empty() {
                        resp.provider = slot.name().to_string();
                    }
                    return Ok(resp);
                }
                Err(failure) => failure.into_error(slot.name()),
            };

            let delay = self.backoff(retries);
            let time_left = Instant::now() + delay < deadline;
            if err.is_retryable() && retries < self.config.max_retries && time_left {
                debug!(
                    "Provider {} transient failure ({}), retry {} in {:?}",
                    slot.name(),
                    err,
                    retries + 1,
                    delay
                );
                retries += 1;
                task.retry_count += 1;
                self.sleep_observing(delay, state).await;
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = tokio::time::timeout(remaining, slot.limiter.wait()).await;
                continue;
            }

            warn!("Provider {} failed for task {}: {}", slot.name(), task.id, err);
            slot.record(started.elapsed(), Some(&err.to_string()));
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            workers: 2,
            queue_capacity: 8,
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            task_timeout: Duration::from_secs(5),
            stop_poll_interval: Duration::from_millis(5),
            ..OrchestratorConfig::default()
        }
    }

    fn reg(provider: Arc<ScriptedProvider>) -> ProviderRegistration {
        ProviderRegistration::new(provider, Duration::ZERO)
    }

    async fn run_once(orch: &WorkerOrchestrator) -> CoreResult<AiResponse> {
        orch.execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
    }

    #[tokio::test]
    async fn test_auth_error_fails_over_without_retry() {
        let bad = Arc::new(ScriptedProvider::failing("bad", ProviderFailure::Auth("401".into())));
        let good = Arc::new(ScriptedProvider::answering("good", "ok", 0.9));
        let orch = WorkerOrchestrator::start(
            "test",
            fast_config(),
            vec![reg(bad.clone()), reg(good.clone())],
        );

        let resp = orch
            .execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(resp.provider, "good");
        assert_eq!(bad.calls(), 1);
        let stats = orch.stats("bad").unwrap();
        assert_eq!(stats.requests_failed, 1);
        assert_eq!(stats.requests_total, 1);
        assert_eq!(orch.stats("good").unwrap().requests_success, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_on_same_provider() {
        let flaky = Arc::new(
            ScriptedProvider::answering("flaky", "ok", 0.8).with_script(vec![
                Err(ProviderFailure::Server("500".into())),
                Err(ProviderFailure::RateLimited("429".into())),
            ]),
        );
        let orch = WorkerOrchestrator::start("test", fast_config(), vec![reg(flaky.clone())]);

        let resp = orch
            .execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(resp.label, "ok");
        assert_eq!(flaky.calls(), 3);
        let stats = orch.stats("flaky").unwrap();
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.requests_success, 1);
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let a = Arc::new(ScriptedProvider::failing("a", ProviderFailure::Server("down".into())));
        let b = Arc::new(ScriptedProvider::failing("b", ProviderFailure::Client("bad".into())));
        let orch = WorkerOrchestrator::start("test", fast_config(), vec![reg(a.clone()), reg(b.clone())]);

        let err = orch
            .execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::AllProvidersExhausted { .. }));
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
        assert_eq!(orch.stats("a").unwrap().requests_failed, 1);
        assert_eq!(orch.stats("b").unwrap().requests_failed, 1);
        assert_eq!(orch.status().failed, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_provider_skipped_after_min_samples() {
        let mut config = fast_config();
        config.min_samples_for_health = 2;
        config.failure_rate_ceiling = 0.5;
        config.max_retries = 0;
        let bad = Arc::new(ScriptedProvider::failing("bad", ProviderFailure::Server("x".into())));
        let good = Arc::new(ScriptedProvider::answering("good", "ok", 0.9));
        let orch = WorkerOrchestrator::start("test", config, vec![reg(bad.clone()), reg(good.clone())]);

        for _ in 0..4 {
            orch.execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
                .await
                .unwrap();
        }

        assert_eq!(bad.calls(), 2);
        assert_eq!(good.calls(), 4);
    }

    #[tokio::test]
    async fn test_unhealthy_provider_recovers_after_cooldown() {
        let mut config = fast_config();
        config.min_samples_for_health = 2;
        config.failure_rate_ceiling = 0.5;
        config.max_retries = 0;
        config.health_cooldown = Duration::from_millis(30);
        let flaky = Arc::new(ScriptedProvider::answering("p", "ok", 0.9).with_script(vec![
            Err(ProviderFailure::Server("down".into())),
            Err(ProviderFailure::Server("down".into())),
        ]));
        let orch = WorkerOrchestrator::start("test", config, vec![reg(flaky.clone())]);

        assert_err!(run_once(&orch).await);
        assert_err!(run_once(&orch).await);
        let skipped = assert_err!(run_once(&orch).await);
        assert!(skipped.to_string().contains("no healthy provider"));
        assert_eq!(flaky.calls(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let resp = assert_ok!(run_once(&orch).await);
        assert_eq!(resp.label, "ok");
        assert_eq!(flaky.calls(), 3);

        for _ in 0..3 {
            assert_ok!(run_once(&orch).await);
        }
        assert_eq!(flaky.calls(), 6);
        let stats = orch.stats("p").unwrap();
        assert_eq!(stats.failure_rate, 0.0);
        assert_eq!(stats.requests_failed, 2);
    }

    #[tokio::test]
    async fn test_failed_trial_keeps_provider_skipped() {
        let mut config = fast_config();
        config.min_samples_for_health = 1;
        config.failure_rate_ceiling = 0.5;
        config.max_retries = 0;
        config.health_cooldown = Duration::from_millis(30);
        let bad = Arc::new(ScriptedProvider::failing("bad", ProviderFailure::Server("x".into())));
        let good = Arc::new(ScriptedProvider::answering("good", "ok", 0.9));
        let orch = WorkerOrchestrator::start("test", config, vec![reg(bad.clone()), reg(good.clone())]);

        assert_ok!(run_once(&orch).await);
        assert_ok!(run_once(&orch).await);
        assert_eq!(bad.calls(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_ok!(run_once(&orch).await);
        assert_ok!(run_once(&orch).await);
        assert_eq!(bad.calls(), 2);
        assert_eq!(good.calls(), 4);
    }

    #[tokio::test]
    async fn test_rate_limited_provider_is_deferred() {
        let slow = Arc::new(ScriptedProvider::answering("slow", "a", 0.9));
        let fast = Arc::new(ScriptedProvider::answering("fast", "b", 0.9));
        let mut config = fast_config();
        config.workers = 1;
        let orch = WorkerOrchestrator::start(
            "test",
            config,
            vec![
                ProviderRegistration::new(slow.clone(), Duration::from_secs(60)),
                reg(fast.clone()),
            ],
        );

        let first = orch
            .execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
            .unwrap();
        let second = orch
            .execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(first.provider, "slow");
        assert_eq!(second.provider, "fast");
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_is_busy() {
        let slow = Arc::new(
            ScriptedProvider::answering("slow", "a", 0.9).with_delay(Duration::from_millis(200)),
        );
        let mut config = fast_config();
        config.workers = 1;
        config.queue_capacity = 1;
        let orch = WorkerOrchestrator::start("test", config, vec![reg(slow)]);
        orch.pause();

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(orch.submit(WorkerRequest::correction("x", false)));
        }

        assert!(results.iter().any(|r| matches!(r, Err(CoreError::Busy))));
        orch.resume();
    }

    #[tokio::test]
    async fn test_stop_marks_queued_tasks_stopped_and_resume_recovers() {
        let provider = Arc::new(ScriptedProvider::answering("p", "a", 0.9));
        let orch = WorkerOrchestrator::start("test", fast_config(), vec![reg(provider.clone())]);

        orch.pause();
        let handle = orch.submit(WorkerRequest::correction("x", false)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        orch.stop();

        assert_eq!(handle.wait().await.unwrap_err(), CoreError::WorkerStopped);
        assert_eq!(provider.calls(), 0);
        assert!(matches!(
            orch.submit(WorkerRequest::correction("x", false)),
            Err(CoreError::WorkerStopped)
        ));

        orch.resume();
        let resp = orch
            .execute(WorkerRequest::correction("x", false), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.label, "a");

        let status = orch.status();
        assert_eq!(status.state, PoolState::Running);
        assert_eq!(status.stopped, 1);
        assert!(status.stop_checks >= 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_task_even_after_quick_resume() {
        let slow = Arc::new(
            ScriptedProvider::answering("slow", "a", 0.9).with_delay(Duration::from_millis(300)),
        );
        let mut config = fast_config();
        config.workers = 1;
        let orch = WorkerOrchestrator::start("test", config, vec![reg(slow.clone())]);

        let in_flight = orch.submit(WorkerRequest::correction("a", false)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = orch.submit(WorkerRequest::correction("b", false)).unwrap();
        orch.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        orch.resume();

        assert_ok!(in_flight.wait().await);
        assert_eq!(queued.wait().await.unwrap_err(), CoreError::WorkerStopped);
        assert_eq!(slow.calls(), 1);
        assert_eq!(orch.status().stopped, 1);

        // Work submitted after the resume runs normally
        let after = orch.submit(WorkerRequest::correction("c", false)).unwrap();
        assert_ok!(after.wait().await);
        assert_eq!(slow.calls(), 2);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let shared = Shared {
            name: "x".into(),
            config: fast_config(),
            slots: Vec::new(),
            counters: Counters::default(),
            stop_epoch: AtomicU64::new(0),
        };
        assert_eq!(shared.backoff(0), Duration::from_millis(1));
        assert_eq!(shared.backoff(1), Duration::from_millis(2));
        assert_eq!(shared.backoff(2), Duration::from_millis(4));
        assert_eq!(shared.backoff(10), Duration::from_millis(4));
    }
}
