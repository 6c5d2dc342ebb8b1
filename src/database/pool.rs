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

//! Process-wide connection pool.
//!
//! Sessions are keyed by their canonical connection string. Every worker
//! needs two concurrent sessions (one logging to the agent's own database,
//! one running SQL against the step's target), and reusing them avoids the
//! per-step connect cost; `RESET ALL` at release makes reuse safe across
//! unrelated jobs.
//!
//! Locking contract: the single mutex is held for slot-list manipulation
//! only. Connects and `RESET ALL` are network I/O and always run outside the
//! lock, so a slow open never blocks unrelated acquisitions. No two callers
//! ever observe the same session in use.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::conninfo::ConnectionInfo;
use super::session::Session;
use crate::error::{AgentError, Result};

/// A session checked out of the pool. Dereferences to [`Session`]; hand it
/// back with [`ConnectionPool::release`].
#[derive(Debug)]
pub struct PooledSession {
    session: Arc<Session>,
}

impl std::ops::Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

struct PoolSlot {
    in_use: bool,
    session: Arc<Session>,
}

#[derive(Default)]
struct PoolInner {
    base: Option<ConnectionInfo>,
    slots: Vec<PoolSlot>,
}

/// The agent's session pool. One instance per process, shared by the
/// scheduler and every worker.
#[derive(Default)]
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens the primary session and stores the base connection info
    /// process-wide. Called once per primary-connection incarnation; a
    /// failed open is [`AgentError::PrimaryConnectFailed`].
    pub async fn init_primary(&self, connect_string: &str) -> Result<PooledSession> {
        let info = ConnectionInfo::parse(connect_string)?;
        let dbname = info.effective_dbname().unwrap_or_default().to_string();
        let full = info.connect_string(None);

        let session = Session::connect(&full, &dbname)
            .await
            .map_err(AgentError::PrimaryConnectFailed)?;
        let session = Arc::new(session);

        let mut inner = self.inner.lock().unwrap();
        inner.base = Some(info);
        inner.slots.push(PoolSlot {
            in_use: true,
            session: session.clone(),
        });

        Ok(PooledSession { session })
    }

    /// The database the primary session lands in; workers log there.
    pub fn service_dbname(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .base
            .as_ref()
            .and_then(|b| b.effective_dbname().map(str::to_string))
    }

    /// Checks out a session for `connect_string`/`dbname`.
    ///
    /// A non-empty `connect_string` is parsed, canonicalized and used as
    /// given (its own `dbname` included; the separate `dbname` argument is
    /// ignored). An empty `connect_string` targets the agent's base
    /// connection with `dbname` substituted; leaving both empty is
    /// [`AgentError::InvalidArguments`]. A free pooled session whose
    /// canonical string matches is reused; otherwise a new session is opened
    /// and appended. Open failures are [`AgentError::AcquireFailed`].
    pub async fn acquire(&self, connect_string: &str, dbname: &str) -> Result<PooledSession> {
        if connect_string.is_empty() && dbname.is_empty() {
            return Err(AgentError::InvalidArguments);
        }

        let (target, label) = self.resolve_target(connect_string, dbname)?;

        if let Some(session) = self.take_free(&target) {
            debug!("Allocating existing connection to database {}", label);
            return Ok(PooledSession { session });
        }

        let session = Session::connect(&target, &label)
            .await
            .map_err(AgentError::AcquireFailed)?;
        let session = Arc::new(session);

        debug!("Allocating new connection to database {}", label);
        self.inner.lock().unwrap().slots.push(PoolSlot {
            in_use: true,
            session: session.clone(),
        });

        Ok(PooledSession { session })
    }

    /// Returns a session to the pool: discards session state with
    /// `RESET ALL`, clears the recorded error, and frees the slot.
    pub async fn release(&self, handle: PooledSession) {
        handle.session.reset().await;
        handle.session.clear_last_error();

        debug!(
            "Returning connection to database {}",
            handle.session.dbname()
        );

        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|s| Arc::ptr_eq(&s.session, &handle.session))
        {
            slot.in_use = false;
        }
    }

    /// Drops pooled sessions: the free ones, or every session including the
    /// primary when `all` is set (used while restarting the primary
    /// connection).
    pub fn sweep(&self, all: bool) {
        if all {
            debug!("Clearing all connections");
        } else {
            debug!("Clearing inactive connections");
        }

        let mut inner = self.inner.lock().unwrap();
        let total = inner.slots.len();
        let free = inner.slots.iter().filter(|s| !s.in_use).count();
        inner.slots.retain(|s| s.in_use && !all);
        let dropped = total - inner.slots.len();

        debug!(
            "Connection stats: total - {}, free - {}, deleted - {}",
            total, free, dropped
        );
    }

    /// Computes the canonical connect string a request resolves to, plus the
    /// database label used in log messages.
    fn resolve_target(&self, connect_string: &str, dbname: &str) -> Result<(String, String)> {
        if !connect_string.is_empty() {
            // A given connection string is authoritative, dbname included;
            // the separate dbname argument applies only to base-connection
            // requests.
            let info = ConnectionInfo::parse(connect_string)?;
            let label = info.effective_dbname().unwrap_or_default().to_string();
            return Ok((info.connect_string(None), label));
        }

        let inner = self.inner.lock().unwrap();
        let base = inner.base.as_ref().ok_or(AgentError::InvalidArguments)?;
        let db = if dbname.is_empty() { None } else { Some(dbname) };
        let label = db
            .or(base.effective_dbname())
            .unwrap_or_default()
            .to_string();
        Ok((base.connect_string(db), label))
    }

    /// Flips the first free slot matching `target` to in-use and returns its
    /// session.
    fn take_free(&self, target: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| !s.in_use && s.session.connstr() == target)?;
        slot.in_use = true;
        Some(slot.session.clone())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ConnectionPool")
            .field("sessions", &inner.slots.len())
            .field(
                "free",
                &inner.slots.iter().filter(|s| !s.in_use).count(),
            )
            .finish()
    }
}
