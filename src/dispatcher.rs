//! Worker pool with cooperative, drain-on-stop cancellation.

use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::collector::{CollectorHandle, ResultCollector};
use crate::executor::{ExecutorConfig, StreamingExecutor};
use crate::outcome::TestRun;

/// Configuration for one load-test run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub executor: ExecutorConfig,
    /// Number of parallel workers
    pub concurrency: usize,
    /// Time before the stop signal is raised
    pub duration: Duration,
    /// Seed for prompt selection; worker `i` uses `seed + i`
    pub seed: Option<u64>,
}

/// Runs N workers against the endpoint until stopped, then drains them.
pub struct Dispatcher {
    config: RunConfig,
    prompts: Arc<[String]>,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(config: RunConfig, prompts: Vec<String>) -> Result<Self> {
        if prompts.is_empty() {
            anyhow::bail!("At least one prompt is required");
        }
        if config.concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }

        Ok(Self {
            config,
            prompts: prompts.into(),
        })
    }

    /// Run for the configured duration, then drain
    pub async fn run(&self) -> Result<TestRun> {
        self.run_until(tokio::time::sleep(self.config.duration))
            .await
    }

    /// Run until `stop` resolves, then drain.
    ///
    /// Workers only check the stop signal between requests, so a request
    /// that is already in flight always runs to its own conclusion. The
    /// returned run ends when the last worker has returned.
    pub async fn run_until<F>(&self, stop: F) -> Result<TestRun>
    where
        F: Future<Output = ()>,
    {
        let executors = (0..self.config.concurrency)
            .map(|_| StreamingExecutor::new(&self.config.executor))
            .collect::<Result<Vec<_>>>()?;

        let collector = ResultCollector::spawn();
        let (stop_tx, stop_rx) = watch::channel(false);

        let start_time = Utc::now();
        let started = Instant::now();

        tracing::info!(
            concurrency = self.config.concurrency,
            duration_secs = self.config.duration.as_secs_f64(),
            endpoint = executors[0].endpoint(),
            "Starting load test"
        );

        let mut handles = Vec::with_capacity(executors.len());
        for (id, executor) in executors.into_iter().enumerate() {
            let worker = Worker {
                id,
                executor,
                prompts: self.prompts.clone(),
                collector: collector.handle(),
                stop: stop_rx.clone(),
                rng: self.worker_rng(id),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(stop_rx);

        stop.await;
        stop_tx.send_replace(true);
        tracing::info!(
            issued = collector.issued(),
            "Stop signal raised, draining in-flight requests"
        );

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        let elapsed = started.elapsed();
        let outcomes = collector.finish().await;
        let end_time = start_time
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::info!(
            requests = outcomes.len(),
            elapsed_secs = elapsed.as_secs_f64(),
            "Load test finished"
        );

        Ok(TestRun {
            outcomes,
            start_time,
            end_time,
            requested_duration: self.config.duration,
            concurrency: self.config.concurrency,
        })
    }

    fn worker_rng(&self, id: usize) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        }
    }
}

struct Worker {
    id: usize,
    executor: StreamingExecutor,
    prompts: Arc<[String]>,
    collector: CollectorHandle,
    stop: watch::Receiver<bool>,
    rng: StdRng,
}

impl Worker {
    /// Loop until the stop signal is seen. Returns the number of requests
    /// issued by this worker.
    async fn run(mut self) -> u64 {
        let mut issued = 0u64;
        tracing::debug!(worker_id = self.id, "Worker started");

        while !self.stop_requested() {
            let Some(prompt) = self.prompts.choose(&mut self.rng) else {
                break;
            };
            let request_id = self.collector.next_request_id();
            let outcome = self.executor.execute(prompt, request_id).await;
            self.collector.submit(outcome);
            issued += 1;
        }

        tracing::debug!(worker_id = self.id, issued, "Worker stopped");
        issued
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}
