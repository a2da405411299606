// Fixed-size pool of rate-loading workers.
// All workers read from one bounded intake queue, so at most `worker_count`
// vendor calls are in flight however many inbound requests are being served.
// Each job carries its own reply channel and cancellation token.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::join_all, FutureExt};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{calculate_backoff, PoolConfig, RetryConfig, ShutdownPolicy},
    error::{panic_message, AuthError, ConfigError, LoadError, RateFailure, VendorError},
    token::TokenClient,
    types::{RateInfo, RateRequest, Token},
    vendor::RateFetcher,
};

#[derive(Debug, Default)]
pub struct PoolStats {
    pub jobs_submitted: AtomicUsize,
    pub jobs_succeeded: AtomicUsize,
    pub jobs_failed: AtomicUsize,
    pub jobs_abandoned: AtomicUsize,
    pub token_failures: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub jobs_submitted: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub jobs_abandoned: usize,
    pub token_failures: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::SeqCst),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_abandoned: self.jobs_abandoned.load(Ordering::SeqCst),
            token_failures: self.token_failures.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    fn enter_fetch(&self) -> FetchGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        FetchGuard { stats: self }
    }
}

struct FetchGuard<'a> {
    stats: &'a PoolStats,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type Intake = Arc<Mutex<mpsc::Receiver<RateRequest>>>;

pub struct WorkerPool {
    intake: mpsc::Sender<RateRequest>,
    receiver: Intake,
    shutdown: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl WorkerPool {
    // Spawns exactly `config.worker_count` workers sharing one intake queue
    pub fn start(
        config: PoolConfig,
        tokens: TokenClient,
        fetcher: Arc<dyn RateFetcher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.intake_queue_capacity);
        let receiver: Intake = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let stats = Arc::new(PoolStats::default());

        let context = Arc::new(WorkerContext {
            tokens,
            fetcher,
            stats: stats.clone(),
            token_retry: config.token_retry.clone(),
            fetch_timeout: config.fetch_timeout(),
        });

        let workers = (0..config.worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    context.clone(),
                    shutdown.clone(),
                    config.shutdown_policy,
                ))
            })
            .collect();

        tracing::info!(
            workers = config.worker_count,
            capacity = config.intake_queue_capacity,
            policy = ?config.shutdown_policy,
            "worker pool started"
        );

        Ok(Self {
            intake: tx,
            receiver,
            shutdown,
            workers: parking_lot::Mutex::new(workers),
            stats,
            config,
        })
    }

    // Queues one job, waiting while the intake queue is full.
    // Fails with ShutdownInProgress once stop has been called.
    pub async fn submit(&self, job: RateRequest) -> Result<(), LoadError> {
        if self.shutdown.is_cancelled() {
            return Err(LoadError::ShutdownInProgress);
        }

        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(LoadError::ShutdownInProgress),
            permit = self.intake.reserve() => permit.map_err(|_| LoadError::ShutdownInProgress)?,
        };
        permit.send(job);
        self.stats.jobs_submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    // Signals every worker to stop and waits for all of them to exit.
    // Jobs still queued after that are answered with ShutdownInProgress.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("stopping worker pool");
        }
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task failed");
            }
        }

        let mut intake = self.receiver.lock().await;
        intake.close();
        let mut abandoned = 0;
        while let Some(job) = intake.recv().await {
            job.complete(Err(RateFailure::ShutdownInProgress));
            abandoned += 1;
        }
        if abandoned > 0 {
            self.stats
                .jobs_abandoned
                .fetch_add(abandoned, Ordering::SeqCst);
            tracing::warn!(abandoned, "answered queued jobs with shutdown failure");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // Jobs waiting in the intake queue
    pub fn queued(&self) -> usize {
        self.config.intake_queue_capacity - self.intake.capacity()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }
}

// Shared by all workers; read-only apart from the stats counters
struct WorkerContext {
    tokens: TokenClient,
    fetcher: Arc<dyn RateFetcher>,
    stats: Arc<PoolStats>,
    token_retry: RetryConfig,
    fetch_timeout: Option<Duration>,
}

async fn worker_loop(
    worker_id: usize,
    intake: Intake,
    context: Arc<WorkerContext>,
    shutdown: CancellationToken,
    policy: ShutdownPolicy,
) {
    tracing::trace!(worker_id, "worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => match policy {
                ShutdownPolicy::Drain => intake.lock().await.try_recv().ok(),
                ShutdownPolicy::Abandon => None,
            },
            job = next_job(&intake) => job,
        };

        let Some(job) = next else {
            break;
        };
        context.run(worker_id, job).await;
    }

    tracing::trace!(worker_id, "worker stopped");
}

async fn next_job(intake: &Intake) -> Option<RateRequest> {
    intake.lock().await.recv().await
}

impl WorkerContext {
    async fn run(&self, worker_id: usize, job: RateRequest) {
        let outcome = if job.cancel.is_cancelled() {
            Err(RateFailure::Cancelled)
        } else {
            let token = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => Err(RateFailure::Cancelled),
                token = self.acquire_token() => token.map_err(RateFailure::from),
            };
            match token {
                Ok(token) => self.fetch(&job, &token).await,
                Err(e) => Err(e),
            }
        };

        match &outcome {
            Ok(_) => {
                self.stats.jobs_succeeded.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(worker_id, hotel_id = %job.hotel_id(), "rate loaded");
            }
            Err(e) => {
                self.stats.jobs_failed.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(worker_id, hotel_id = %job.hotel_id(), error = %e, "rate failed");
            }
        }
        job.complete(outcome);
    }

    // Follows the configured retry policy; zero retries fails on the first error
    async fn acquire_token(&self) -> Result<Token, AuthError> {
        let mut attempt = 0;
        loop {
            match self.tokens.request_token().await {
                Ok(token) => return Ok(token),
                Err(AuthError::ProviderStopped) => return Err(AuthError::ProviderStopped),
                Err(e) if attempt < self.token_retry.max_retries => {
                    let backoff = calculate_backoff(attempt, &self.token_retry);
                    tracing::debug!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying token request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.stats.token_failures.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
    }

    async fn fetch(&self, job: &RateRequest, token: &Token) -> Result<RateInfo, RateFailure> {
        let _guard = self.stats.enter_fetch();

        // A panicking fetcher fails only this job; the worker keeps running
        let call = AssertUnwindSafe(self.fetcher.fetch(&job.query, token))
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(hotel_id = %job.hotel_id(), panic = %message, "rate fetcher panicked");
                    Err(VendorError::Panicked(message))
                })
            });
        let call = async {
            match self.fetch_timeout {
                Some(limit) => timeout(limit, call)
                    .await
                    .unwrap_or(Err(VendorError::Timeout(limit.as_millis() as u64))),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(RateFailure::Cancelled),
            result = call => result.map_err(RateFailure::from),
        }
    }
}
