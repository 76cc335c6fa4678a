use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{EngineError, Retryability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Sync,
    Classify,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Sync => "sync",
            Lane::Classify => "classify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    SyncAccount { account_id: i64 },
    ClassifyMessage { account_id: i64, message_id: i64 },
}

#[derive(Debug, Clone)]
struct Job {
    payload: JobPayload,
    attempt: u32,
}

/// A job that exhausted its retries or hit a non-retryable error.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub lane: Lane,
    pub payload: JobPayload,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub sync_concurrency: usize,
    pub classify_concurrency: usize,
    /// Token-bucket rate for the sync lane, tokens per minute.
    pub sync_rate_per_minute: u32,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub job_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sync_concurrency: 2,
            classify_concurrency: 5,
            sync_rate_per_minute: 30,
            max_attempts: 5,
            backoff_base_secs: 1,
            backoff_max_secs: 120,
            job_timeout_secs: 300,
        }
    }
}

/// Executes one job. Handlers must be idempotent: delivery is
/// at-least-once and a retried job may have partially run before.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &JobPayload) -> Result<(), EngineError>;
}

struct TokenBucket {
    state: parking_lot::Mutex<(f64, Instant)>,
    rate_per_sec: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(rate_per_minute: u32) -> Self {
        let capacity = (rate_per_minute as f64).max(1.0);
        Self {
            state: parking_lot::Mutex::new((capacity, Instant::now())),
            rate_per_sec: capacity / 60.0,
            capacity,
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let (ref mut tokens, ref mut last) = *state;
                let now = Instant::now();
                *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * self.rate_per_sec)
                    .min(self.capacity);
                *last = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(wait) => {
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
    dead_letters: parking_lot::Mutex<Vec<DeadLetter>>,
    sync_bucket: TokenBucket,
}

/// Durable-enough task queue with two independently tuned lanes. Sync
/// jobs additionally pass a token bucket so provider quotas survive burst
/// fan-outs. Shutdown cancels future scheduling and drains in-flight
/// work; running jobs are never cancelled mid-flight.
#[derive(Clone)]
pub struct JobQueue {
    sync_tx: UnboundedSender<Job>,
    classify_tx: UnboundedSender<Job>,
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn start(config: QueueConfig, handler: Arc<dyn JobHandler>) -> Self {
        let (sync_tx, sync_rx) = unbounded_channel();
        let (classify_tx, classify_rx) = unbounded_channel();
        let inner = Arc::new(QueueInner {
            sync_bucket: TokenBucket::new(config.sync_rate_per_minute),
            config,
            handler,
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            dead_letters: parking_lot::Mutex::new(Vec::new()),
        });

        let queue = Self {
            sync_tx: sync_tx.clone(),
            classify_tx: classify_tx.clone(),
            inner: inner.clone(),
        };

        tokio::spawn(dispatch_lane(
            Lane::Sync,
            sync_rx,
            sync_tx,
            inner.clone(),
            inner.config.sync_concurrency,
        ));
        tokio::spawn(dispatch_lane(
            Lane::Classify,
            classify_rx,
            classify_tx,
            inner.clone(),
            inner.config.classify_concurrency,
        ));

        queue
    }

    pub fn enqueue(&self, lane: Lane, payload: JobPayload) {
        if self.inner.cancel.is_cancelled() {
            warn!(lane = lane.as_str(), "queue shutting down, job dropped");
            return;
        }
        let job = Job {
            payload,
            attempt: 0,
        };
        let sender = match lane {
            Lane::Sync => &self.sync_tx,
            Lane::Classify => &self.classify_tx,
        };
        if sender.send(job).is_err() {
            error!(lane = lane.as_str(), "queue lane closed, job dropped");
        }
    }

    /// Recurring fixed-cadence tick. The cadence is a fixed schedule, not
    /// a relative timer, so due-checks survive restarts without drift;
    /// ticks missed while busy are skipped rather than bursted.
    pub fn spawn_ticker<F>(&self, period: Duration, mut on_tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => on_tick(),
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stops future scheduling and waits for in-flight jobs to finish,
    /// bounded by `drain_timeout`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.inner.cancel.cancel();
        let deadline = Instant::now() + drain_timeout;
        while self.in_flight() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.in_flight();
        if remaining > 0 {
            warn!(remaining, "queue drain timed out with jobs still running");
        } else {
            debug!("queue drained");
        }
    }
}

async fn dispatch_lane(
    lane: Lane,
    mut rx: UnboundedReceiver<Job>,
    retry_tx: UnboundedSender<Job>,
    inner: Arc<QueueInner>,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = inner.cancel.cancelled() => break,
        };

        if lane == Lane::Sync {
            inner.sync_bucket.acquire(&inner.cancel).await;
        }
        if inner.cancel.is_cancelled() {
            break;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = inner.clone();
        let retry_tx = retry_tx.clone();
        tokio::spawn(async move {
            run_job(lane, job, &inner, retry_tx).await;
            drop(permit);
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn run_job(lane: Lane, job: Job, inner: &Arc<QueueInner>, retry_tx: UnboundedSender<Job>) {
    let job_timeout = Duration::from_secs(inner.config.job_timeout_secs);
    let outcome = match timeout(job_timeout, inner.handler.handle(&job.payload)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Other(format!(
            "{} job timed out after {}s",
            lane.as_str(),
            inner.config.job_timeout_secs
        ))),
    };

    let err = match outcome {
        Ok(()) => return,
        Err(err) => err,
    };

    let attempt = job.attempt + 1;
    let retryable = err.retryability() == Retryability::Transient;
    if retryable && attempt < inner.config.max_attempts {
        let backoff = backoff_delay(
            attempt,
            inner.config.backoff_base_secs,
            inner.config.backoff_max_secs,
        );
        warn!(
            lane = lane.as_str(),
            attempt,
            backoff_secs = backoff.as_secs(),
            error = %err,
            "job failed, scheduling retry"
        );
        let cancel = inner.cancel.clone();
        let retry = Job {
            payload: job.payload,
            attempt,
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(backoff) => {
                    let _ = retry_tx.send(retry);
                }
                _ = cancel.cancelled() => {}
            }
        });
    } else {
        error!(
            lane = lane.as_str(),
            attempts = attempt,
            error = %err,
            "job moved to dead letter"
        );
        inner.dead_letters.lock().push(DeadLetter {
            lane,
            payload: job.payload,
            attempts: attempt,
            reason: err.to_string(),
        });
    }
}

fn backoff_delay(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let secs = base_secs.saturating_mul(1u64 << exp).min(max_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _payload: &JobPayload) -> Result<(), EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(EngineError::Other("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            sync_concurrency: 2,
            classify_concurrency: 2,
            sync_rate_per_minute: 60_000,
            max_attempts: 3,
            backoff_base_secs: 0,
            backoff_max_secs: 0,
            job_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn transient_failure_retries_until_success() {
        let handler = Arc::new(CountingHandler::new(2));
        let queue = JobQueue::start(test_config(), handler.clone());
        queue.enqueue(Lane::Classify, JobPayload::ClassifyMessage {
            account_id: 1,
            message_id: 1,
        });

        sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().is_empty());
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let handler = Arc::new(CountingHandler::new(100));
        let queue = JobQueue::start(test_config(), handler.clone());
        queue.enqueue(Lane::Classify, JobPayload::ClassifyMessage {
            account_id: 1,
            message_id: 7,
        });

        sleep(Duration::from_millis(600)).await;
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(matches!(
            dead[0].payload,
            JobPayload::ClassifyMessage { message_id: 7, .. }
        ));
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn lane_concurrency_is_capped() {
        let handler = Arc::new(CountingHandler::new(0));
        let queue = JobQueue::start(test_config(), handler.clone());
        for id in 0..10 {
            queue.enqueue(Lane::Classify, JobPayload::ClassifyMessage {
                account_id: 1,
                message_id: id,
            });
        }

        sleep(Duration::from_millis(600)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
        assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_jobs() {
        let handler = Arc::new(CountingHandler::new(0));
        let queue = JobQueue::start(test_config(), handler.clone());
        for id in 0..4 {
            queue.enqueue(Lane::Sync, JobPayload::SyncAccount { account_id: id });
        }
        sleep(Duration::from_millis(20)).await;
        queue.shutdown(Duration::from_secs(2)).await;
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_delay(1, 1, 120), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, 1, 120), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, 1, 120), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, 1, 120), Duration::from_secs(120));
    }
}
