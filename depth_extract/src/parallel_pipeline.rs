// THEORY:
// Batches of one recording must run in order, but recordings are independent.
// The `ExtractionPool` exploits that: a fixed set of worker tasks, fed
// round-robin by a dispatcher, each run one recording at a time on tokio's
// blocking pool. The number of workers bounds how many recordings (and so how
// many encoder processes and frame stacks) are alive at once.
//
// Key architectural principles:
// 1.  **Independent State**: Each job builds its own pipeline, tracking state and
//     sinks. Nothing mutable is shared between workers.
// 2.  **Shared Inputs**: Background and ROI are shared read-only behind `Arc`.
// 3.  **Per-Job Results**: Every submitted job gets its own oneshot reply, so a
//     failing recording reports its error without affecting the others.

use crate::config::ExtractConfig;
use crate::error::ExtractError;
use crate::session::{ExtractionJob, RecordingSummary, extract_recording};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

pub struct ExtractionTask {
    pub job: ExtractionJob,
    pub result_sender: oneshot::Sender<Result<RecordingSummary, ExtractError>>,
}

pub struct ExtractionPool {
    task_sender: mpsc::UnboundedSender<ExtractionTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl ExtractionPool {
    /// Starts `max_workers` workers (default: one per CPU). Must be called from
    /// within a tokio runtime. The config is validated once, up front.
    pub fn new(config: ExtractConfig, max_workers: Option<usize>) -> Result<Self, ExtractError> {
        config.validate()?;
        let config = Arc::new(config);
        let worker_count = max_workers.unwrap_or_else(num_cpus::get).max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<ExtractionTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<ExtractionTask>())
            .unzip();

        // Spawn dispatcher
        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        // Spawn workers
        let workers = worker_receivers
            .into_iter()
            .enumerate()
            .map(|(id, mut worker_receiver)| {
                let worker_config = Arc::clone(&config);
                tokio::spawn(async move {
                    while let Some(ExtractionTask { job, result_sender }) = worker_receiver.recv().await {
                        debug!(worker = id, recording = %job.name, "worker picked up recording");
                        let config = Arc::clone(&worker_config);
                        let result = tokio::task::spawn_blocking(move || extract_recording(&job, &config))
                            .await
                            .unwrap_or_else(|e| Err(ExtractError::Worker(e.to_string())));
                        if let Err(e) = &result {
                            error!(worker = id, error = %e, "recording failed");
                        }
                        let _ = result_sender.send(result);
                    }
                })
            })
            .collect();

        Ok(Self { task_sender, workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Extracts one recording on the next worker.
    pub async fn extract(&self, job: ExtractionJob) -> Result<RecordingSummary, ExtractError> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(ExtractionTask { job, result_sender })
            .map_err(|_| ExtractError::Worker("extraction pool is shut down".to_string()))?;

        result_receiver
            .await
            .map_err(|_| ExtractError::Worker("worker dropped the recording".to_string()))?
    }

    /// Extracts every job concurrently; results come back in submission order.
    pub async fn extract_all(&self, jobs: Vec<ExtractionJob>) -> Vec<Result<RecordingSummary, ExtractError>> {
        join_all(jobs.into_iter().map(|job| self.extract(job))).await
    }

    /// Stops accepting jobs and waits for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
