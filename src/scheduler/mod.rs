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

//! The scheduler: two nested loops.
//!
//! The outer loop owns the primary connection. It connects, runs the
//! startup sequence, and hands control to the poll loop; when the poll loop
//! fails (the primary session is broken) or the connect itself fails, every
//! pooled session is discarded and the whole thing restarts, up to
//! [`MAX_ATTEMPTS`] consecutive failures.
//!
//! The poll loop claims due jobs once per tick and hands each to a detached
//! worker holding a semaphore permit. Workers never block the tick: when the
//! permits run out, the remaining due jobs simply wait for a later tick, and
//! a tick that found nothing to do sweeps idle pooled sessions.

pub mod startup;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::dal::JobDal;
use crate::database::{ConnectionPool, PooledSession};
use crate::error::{AgentError, Result};
use crate::executor::JobRunner;
use crate::logging::STARTUP_TARGET;
use crate::settings::Settings;

/// Consecutive primary-connection failures tolerated before giving up.
const MAX_ATTEMPTS: u32 = 10;

/// Cooperative shutdown flag shared between the signal handler, the
/// scheduler's waits, and anything else that needs to stop politely.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless shutdown arrives first. Returns whether
    /// shutdown was requested.
    pub async fn wait(&self, duration: Duration) -> bool {
        if self.is_signalled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_signalled(),
            _ = self.notify.notified() => true,
        }
    }
}

/// The agent's scheduling engine.
pub struct Scheduler {
    settings: Settings,
    hostname: String,
    pool: Arc<ConnectionPool>,
    shutdown: Arc<ShutdownSignal>,
}

impl Scheduler {
    pub fn new(settings: Settings, hostname: String) -> Self {
        Self {
            settings,
            hostname,
            pool: ConnectionPool::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle for requesting shutdown from outside the scheduler (signal
    /// handlers, service control).
    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    /// Runs the agent until shutdown or a fatal error.
    pub async fn run(&self) -> Result<()> {
        let mut attempt: u32 = 1;

        loop {
            if self.shutdown.is_signalled() {
                return Ok(());
            }

            debug!("Creating primary connection");
            match self.pool.init_primary(self.settings.connect_string()).await {
                Ok(primary) => {
                    // The connection itself succeeded; the failure count
                    // starts over.
                    attempt = 1;

                    let outcome = self.serve(&primary).await;
                    drop(primary);
                    self.pool.sweep(true);

                    match outcome {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(
                                target: STARTUP_TARGET,
                                "Lost the primary connection (attempt {}): {}", attempt, e
                            );
                        }
                    }
                }
                Err(e @ AgentError::InvalidConnectionString(_)) => {
                    // Retrying a parse error cannot succeed.
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        target: STARTUP_TARGET,
                        "Couldn't create the primary connection (attempt {}): {}", attempt, e
                    );
                    self.pool.sweep(true);
                }
            }

            if attempt >= MAX_ATTEMPTS {
                return Err(AgentError::RetriesExhausted(MAX_ATTEMPTS));
            }
            attempt += 1;

            if self.shutdown.wait(self.settings.retry_interval()).await {
                return Ok(());
            }
        }
    }

    /// One primary-connection incarnation: startup checks, then polling.
    async fn serve(&self, primary: &PooledSession) -> Result<()> {
        let backend_pid = startup::initialize(primary, &self.hostname).await?;
        self.poll_loop(primary, backend_pid).await
    }

    /// Claims due jobs once per tick until shutdown; any query failure on
    /// the primary session escalates to the outer loop.
    async fn poll_loop(&self, primary: &PooledSession, backend_pid: i32) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_jobs()));
        let service_db = self.pool.service_dbname().unwrap_or_default();
        let dal = JobDal::new(primary);

        loop {
            if self.shutdown.is_signalled() {
                return Ok(());
            }

            debug!("Checking for jobs to run");
            let jobs = dal.due_jobs(&self.hostname).await?;

            let mut found_work = false;
            for job_id in jobs {
                match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => {
                        found_work = true;
                        let pool = self.pool.clone();
                        let service_db = service_db.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            run_job(pool, backend_pid, job_id, &service_db).await;
                        });
                    }
                    Err(_) => {
                        debug!("All job slots busy, deferring the remaining due jobs");
                        break;
                    }
                }
            }

            debug!("Sleeping...");
            if self.shutdown.wait(self.settings.poll_interval()).await {
                return Ok(());
            }

            if !found_work {
                self.pool.sweep(false);
            }
        }
    }
}

/// Worker body: acquire a logging session and drive a runner for one job.
async fn run_job(pool: Arc<ConnectionPool>, backend_pid: i32, job_id: i32, service_db: &str) {
    let session = match pool.acquire("", service_db).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                target: STARTUP_TARGET,
                "Failed to create a logging connection for job {}: {}", job_id, e
            );
            return;
        }
    };

    JobRunner::new(pool, session, backend_pid, job_id).run().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_interrupts_a_wait() {
        let shutdown = ShutdownSignal::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.signal();

        let interrupted = handle.await.unwrap();
        assert!(interrupted);
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn wait_runs_to_completion_without_shutdown() {
        let shutdown = ShutdownSignal::new();
        let interrupted = shutdown.wait(Duration::from_millis(10)).await;
        assert!(!interrupted);
    }

    #[tokio::test]
    async fn wait_returns_immediately_after_shutdown() {
        let shutdown = ShutdownSignal::new();
        shutdown.signal();

        let start = std::time::Instant::now();
        assert!(shutdown.wait(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
