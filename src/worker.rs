//! Bounded worker pools draining a [`JobQueue`].
//!
//! A pool polls its queue, runs at most `concurrency` jobs at once, and
//! settles each job through the queue before firing the handler's
//! completion or terminal-failure event. Events always observe the job in
//! its settled state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{SyncError, SyncResult};
use crate::queue::{FailOutcome, JobQueue, JobRecord};

/// Executes jobs of one queue and reacts to their settlement.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> SyncResult<()>;

    /// Called after the job was marked `completed`.
    async fn on_completed(&self, _job: &JobRecord) -> SyncResult<()> {
        Ok(())
    }

    /// Called after the job was marked `failed` with no attempts left.
    async fn on_failed(&self, _job: &JobRecord, _error: &SyncError) -> SyncResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { delay_ms: u64 },
    Failed,
}

/// Run one claimed job to settlement and fire the matching event.
///
/// Event handler errors are logged, not propagated: the job itself is
/// already settled.
pub async fn run_job(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: JobRecord,
) -> SyncResult<JobOutcome> {
    let span = tracing::info_span!(
        "job",
        queue = queue.name().as_str(),
        job_id = %job.id,
        process_id = %job.process_id,
        knowledge_group_id = %job.knowledge_group_id,
        attempt = job.attempts,
    );

    async {
        match handler.handle(&job).await {
            Ok(()) => {
                queue.complete(&job.id).await?;
                debug!("job completed");
                if let Err(e) = handler.on_completed(&job).await {
                    error!(error = %e, "completion handler failed");
                }
                Ok(JobOutcome::Completed)
            }
            Err(err) => match queue.fail(&job, &err).await? {
                FailOutcome::Retrying { delay_ms } => {
                    warn!(error = %err, delay_ms, "job failed, retry scheduled");
                    Ok(JobOutcome::Retrying { delay_ms })
                }
                FailOutcome::Exhausted => {
                    error!(error = %err, "job failed permanently");
                    if let Err(e) = handler.on_failed(&job, &err).await {
                        error!(error = %e, "failure handler failed");
                    }
                    Ok(JobOutcome::Failed)
                }
            },
        }
    }
    .instrument(span)
    .await
}

/// Claim and run jobs one at a time until none is due. Returns how many ran.
pub async fn drain(queue: &JobQueue, handler: &dyn JobHandler) -> SyncResult<usize> {
    let mut ran = 0;
    while let Some(job) = queue.claim().await? {
        run_job(queue, handler, job).await?;
        ran += 1;
    }
    Ok(ran)
}

/// Spawn a polling pool for `queue` until `shutdown` fires.
///
/// On shutdown the pool stops claiming and waits for in-flight jobs.
pub fn spawn_pool(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(concurrency));
        info!(
            queue = queue.name().as_str(),
            concurrency, "worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let job = match queue.claim().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => continue,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = queue.name().as_str(), error = %e, "claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => continue,
                    }
                }
            };

            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = run_job(&queue, handler.as_ref(), job).await {
                    error!(queue = queue.name().as_str(), error = %e, "job settlement failed");
                }
                drop(permit);
            });
        }

        // Wait for in-flight jobs.
        if let Ok(all) = permits.acquire_many(concurrency as u32).await {
            drop(all);
        }
        info!(queue = queue.name().as_str(), "worker pool stopped");
    })
}
