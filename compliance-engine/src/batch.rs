//! Batch runner: many (contract, period) jobs over a fixed set of workers.
//!
//! Jobs are sharded by contract so one contract's periods run in order on
//! one worker. Cancellation is checked between jobs, never inside one.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{ComplianceEngine, EvaluationOutcome},
    error::{EngineError, EngineResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchJob {
    pub contract_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

#[derive(Debug)]
pub struct JobReport {
    pub job: BatchJob,
    pub result: EngineResult<EvaluationOutcome>,
}

impl JobReport {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(EngineError::Cancelled))
    }
}

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

fn worker_failed(job: BatchJob, worker: usize, reason: &str) -> JobReport {
    JobReport {
        job,
        result: Err(EngineError::WorkerFailed {
            worker,
            reason: reason.to_string(),
        }),
    }
}

pub struct BatchRunner {
    engine: Arc<ComplianceEngine>,
    workers: usize,
    queue_depth: usize,
}

impl BatchRunner {
    pub fn new(engine: Arc<ComplianceEngine>, workers: usize) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            queue_depth: 16,
        }
    }

    /// Runs every job; reports come back in submission order.
    pub async fn run(&self, jobs: Vec<BatchJob>, cancel: CancellationToken) -> Vec<JobReport> {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<(usize, BatchJob)>(self.queue_depth);
            txs.push(tx);
            let engine = Arc::clone(&self.engine);
            let cancel = cancel.clone();

            joins.push(tokio::spawn(async move {
                let mut done = Vec::new();
                while let Some((seq, job)) = rx.recv().await {
                    if cancel.is_cancelled() {
                        done.push((seq, JobReport { job, result: Err(EngineError::Cancelled) }));
                        continue;
                    }
                    tracing::debug!(worker, contract_id = %job.contract_id, "evaluation job started");
                    let result = engine.evaluate(&job.contract_id, job.period_start, job.period_end).await;
                    done.push((seq, JobReport { job, result }));
                }
                done
            }));
        }

        let mut reports: Vec<(usize, JobReport)> = Vec::with_capacity(jobs.len());
        // Jobs each worker accepted; reported as failed if the worker dies.
        let mut sent: Vec<Vec<(usize, BatchJob)>> = vec![Vec::new(); self.workers];
        for (seq, job) in jobs.into_iter().enumerate() {
            if cancel.is_cancelled() {
                reports.push((seq, JobReport { job, result: Err(EngineError::Cancelled) }));
                continue;
            }
            let idx = shard_index(&job.contract_id, self.workers);
            match txs[idx].send((seq, job.clone())).await {
                Ok(()) => sent[idx].push((seq, job)),
                Err(mpsc::error::SendError((seq, job))) => {
                    tracing::error!(worker = idx, contract_id = %job.contract_id, "batch worker channel closed");
                    reports.push((seq, worker_failed(job, idx, "worker stopped accepting jobs")));
                }
            }
        }
        drop(txs);

        for (idx, (j, accepted)) in joins.into_iter().zip(sent).enumerate() {
            match j.await {
                Ok(done) => reports.extend(done),
                Err(e) => {
                    tracing::error!(worker = idx, error = %e, lost = accepted.len(), "batch worker join error");
                    let reason = e.to_string();
                    reports.extend(
                        accepted
                            .into_iter()
                            .map(|(seq, job)| (seq, worker_failed(job, idx, &reason))),
                    );
                }
            }
        }

        reports.sort_by_key(|(seq, _)| *seq);
        let reports: Vec<JobReport> = reports.into_iter().map(|(_, r)| r).collect();

        let failed = reports.iter().filter(|r| r.result.is_err() && !r.is_cancelled()).count();
        let cancelled = reports.iter().filter(|r| r.is_cancelled()).count();
        tracing::info!(
            jobs = reports.len(),
            failed,
            cancelled,
            "batch run finished"
        );
        reports
    }
}
