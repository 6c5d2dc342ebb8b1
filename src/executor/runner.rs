/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! The per-job runner.
//!
//! One instance drives one claimed job to a terminal state: claim, open the
//! job log, walk the enabled steps in (`jstname`, `jstid`) order applying
//! each step's on-error policy, close the log, release the claim. Whatever
//! happens, an opened log row is closed exactly once before the runner lets
//! go of the job, and the logging session always goes back to the pool.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::dal::JobDal;
use crate::database::{ConnectionPool, PooledSession};
use crate::executor::step::{run_batch_step, run_sql_step};
use crate::models::{RunStatus, StepKind};

/// Runs one claimed job on a dedicated logging session.
pub struct JobRunner {
    pool: Arc<ConnectionPool>,
    session: PooledSession,
    backend_pid: i32,
    job_id: i32,
}

impl JobRunner {
    pub fn new(
        pool: Arc<ConnectionPool>,
        session: PooledSession,
        backend_pid: i32,
        job_id: i32,
    ) -> Self {
        Self {
            pool,
            session,
            backend_pid,
            job_id,
        }
    }

    /// Claims and executes the job, then returns the logging session to the
    /// pool. A lost claim race is a silent no-op.
    pub async fn run(self) {
        let JobRunner {
            pool,
            session,
            backend_pid,
            job_id,
        } = self;

        debug!("Starting job: {}", job_id);

        let dal = JobDal::new(&session);
        match dal.claim(backend_pid, job_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Another agent won the race between the poll and our claim.
                debug!("Job {} was claimed by another agent", job_id);
                pool.release(session).await;
                return;
            }
            Err(e) => {
                warn!("Failed to claim job {}: {}", job_id, e);
                pool.release(session).await;
                return;
            }
        }

        let log_id = match dal.open_job_log(job_id).await {
            Ok(id) => id,
            Err(e) => {
                // Claimed but unable to leave a trace; hand the job back.
                warn!("Failed to open the job log for job {}: {}", job_id, e);
                if let Err(e) = dal.release_job(job_id).await {
                    warn!("Failed to release job {}: {}", job_id, e);
                }
                pool.release(session).await;
                return;
            }
        };

        let status = execute_steps(&dal, &pool, job_id, log_id).await;

        if let Err(e) = dal.close_job_log(log_id, status).await {
            warn!("Failed to close the job log for job {}: {}", job_id, e);
        }
        if let Err(e) = dal.release_job(job_id).await {
            warn!("Failed to release job {}: {}", job_id, e);
        }

        pool.release(session).await;
        debug!("Completed job: {}", job_id);
    }
}

/// Walks the job's enabled steps and computes the job's terminal status.
async fn execute_steps(
    dal: &JobDal<'_>,
    pool: &ConnectionPool,
    job_id: i32,
    log_id: i32,
) -> RunStatus {
    let steps = match dal.enabled_steps(job_id).await {
        Ok(steps) => steps,
        Err(e) => {
            warn!("Failed to query the steps of job {}: {}", job_id, e);
            return RunStatus::InternalError;
        }
    };

    if steps.is_empty() {
        warn!("Job {} has no enabled steps", job_id);
        return RunStatus::InternalError;
    }

    for step in steps {
        let step_log_id = match dal.open_step_log(log_id, step.id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!(
                    "Step {} of job {} vanished before its log could open",
                    step.id, job_id
                );
                return RunStatus::InternalError;
            }
            Err(e) => {
                warn!(
                    "Failed to open the step log for step {} of job {}: {}",
                    step.id, job_id, e
                );
                return RunStatus::InternalError;
            }
        };

        let outcome = match step.kind() {
            Some(StepKind::Sql) => run_sql_step(pool, job_id, &step).await,
            Some(StepKind::Batch) => run_batch_step(job_id, &step).await,
            None => {
                warn!(
                    "Invalid step type '{}' on step {} of job {}",
                    step.kind_code, step.id, job_id
                );
                // Close the log we just opened before abandoning the job.
                if let Err(e) = dal
                    .close_step_log(
                        step_log_id,
                        RunStatus::InternalError.code(),
                        -1,
                        "Invalid step type!",
                    )
                    .await
                {
                    warn!(
                        "Failed to close the step log for step {} of job {}: {}",
                        step.id, job_id, e
                    );
                }
                return RunStatus::InternalError;
            }
        };

        let step_status = if outcome.succeeded {
            RunStatus::Succeeded.code()
        } else {
            step.on_error.status_code()
        };

        let updated = match dal
            .close_step_log(step_log_id, step_status, outcome.result_code, &outcome.output)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "Failed to close the step log for step {} of job {}: {}",
                    step.id, job_id, e
                );
                0
            }
        };

        if updated != 1 || step_status == RunStatus::Failed.code() {
            return RunStatus::Failed;
        }
    }

    RunStatus::Succeeded
}
