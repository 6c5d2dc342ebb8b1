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

//! A single pooled database session.
//!
//! Each session owns a `tokio_postgres::Client` and the spawned task driving
//! its connection. The session records the outcome of the last command (ok
//! flag and server error text) so the step executor can report SQL failures
//! without threading error values through every call, and caches the server
//! version for the version-dependent SQL in the zombie sweep.
//!
//! Two execution paths exist on purpose:
//! - [`Session::run_batch`] sends raw, possibly multi-statement SQL through
//!   the simple-query protocol (step bodies, the zombie sweep).
//! - [`Session::query`] / [`Session::execute`] use server-side parameter
//!   binding for every statement that carries values.

use std::str::FromStr;
use std::sync::Mutex;

use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Row, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Rows and the affected-row count collected from a completed simple-query
/// batch.
///
/// Getters are forgiving: an out-of-range row or unknown column yields an
/// empty string rather than an error. Result memory is released when the
/// value drops.
#[derive(Debug)]
pub struct SimpleRows {
    rows: Vec<SimpleQueryRow>,
    rows_affected: i64,
}

impl SimpleRows {
    fn from_messages(messages: Vec<SimpleQueryMessage>) -> Self {
        let mut rows = Vec::new();
        let mut rows_affected = 0;
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => rows.push(row),
                SimpleQueryMessage::CommandComplete(n) => rows_affected = n as i64,
                _ => {}
            }
        }
        Self {
            rows,
            rows_affected,
        }
    }

    /// The result of a failed batch: no rows, affected count -1.
    fn failed() -> Self {
        Self {
            rows: Vec::new(),
            rows_affected: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Affected-row count of the final statement in the batch, -1 on
    /// failure.
    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    /// Value at (`row`, `col`), or `""` when either is out of range.
    pub fn get(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.try_get(col).ok().flatten())
            .unwrap_or("")
    }

    /// Value of the named column in `row`, or `""` when the row or column
    /// does not exist.
    pub fn get_named(&self, row: usize, name: &str) -> &str {
        let Some(r) = self.rows.get(row) else {
            return "";
        };
        let Some(col) = r.columns().iter().position(|c| c.name() == name) else {
            return "";
        };
        r.try_get(col).ok().flatten().unwrap_or("")
    }
}

#[derive(Debug, Default)]
struct SessionState {
    last_ok: bool,
    last_error: Option<String>,
    server_version_num: Option<i32>,
}

/// One database session: client, connection driver, and last-command state.
pub struct Session {
    client: Client,
    connstr: String,
    dbname: String,
    state: Mutex<SessionState>,
}

impl Session {
    /// Opens a new session for `connstr` (a canonical connection string).
    ///
    /// `dbname` is carried for log messages only; the connect string is the
    /// authority on where the session lands.
    pub async fn connect(
        connstr: &str,
        dbname: &str,
    ) -> std::result::Result<Self, tokio_postgres::Error> {
        debug!("Creating DB connection to database {}", dbname);

        let config = Config::from_str(connstr)?;
        let (client, connection) = config.connect(NoTls).await?;

        let driver_dbname = dbname.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection to database {} closed: {}", driver_dbname, e);
            }
        });

        Ok(Self {
            client,
            connstr: connstr.to_string(),
            dbname: dbname.to_string(),
            state: Mutex::new(SessionState {
                last_ok: true,
                ..Default::default()
            }),
        })
    }

    /// The canonical connection string this session was opened with; the
    /// pool's lookup key.
    pub fn connstr(&self) -> &str {
        &self.connstr
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Runs raw SQL (one or more statements) through the simple-query
    /// protocol, recording the outcome on the session.
    ///
    /// Never fails at the call site: a server error yields
    /// [`SimpleRows::rows_affected`] of -1 with the error text available via
    /// [`Session::last_error`].
    pub async fn run_batch(&self, sql: &str) -> SimpleRows {
        match self.client.simple_query(sql).await {
            Ok(messages) => {
                self.record_ok();
                SimpleRows::from_messages(messages)
            }
            Err(e) => {
                let text = error_text(&e);
                warn!("Query error: {}", text);
                self.record_error(text);
                SimpleRows::failed()
            }
        }
    }

    /// Parameter-bound query returning all rows.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        match self.client.query(sql, params).await {
            Ok(rows) => {
                self.record_ok();
                Ok(rows)
            }
            Err(e) => {
                self.record_error(error_text(&e));
                Err(AgentError::QueryFailed(e))
            }
        }
    }

    /// Parameter-bound query expecting exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        match self.client.query_one(sql, params).await {
            Ok(row) => {
                self.record_ok();
                Ok(row)
            }
            Err(e) => {
                self.record_error(error_text(&e));
                Err(AgentError::QueryFailed(e))
            }
        }
    }

    /// Parameter-bound statement returning its affected-row count.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        match self.client.execute(sql, params).await {
            Ok(n) => {
                self.record_ok();
                Ok(n)
            }
            Err(e) => {
                self.record_error(error_text(&e));
                Err(AgentError::QueryFailed(e))
            }
        }
    }

    /// Whether the last command on this session completed without a server
    /// error.
    pub fn last_command_ok(&self) -> bool {
        self.state.lock().unwrap().last_ok
    }

    /// The last server error text, trailing line ends trimmed; empty when
    /// the last command succeeded.
    pub fn last_error(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .last_error
            .clone()
            .unwrap_or_default()
    }

    pub(crate) fn clear_last_error(&self) {
        self.state.lock().unwrap().last_error = None;
    }

    /// Discards session state (`RESET ALL`) before the session goes back to
    /// the pool. Failure is logged and otherwise ignored; a session that
    /// cannot reset will fail its next query and be swept.
    pub async fn reset(&self) {
        if let Err(e) = self.client.batch_execute("RESET ALL").await {
            warn!(
                "RESET ALL failed on connection to database {}: {}",
                self.dbname,
                error_text(&e)
            );
        }
    }

    /// The server's `server_version_num`, cached after the first successful
    /// read; 0 when it cannot be determined.
    pub async fn server_version_num(&self) -> i32 {
        if let Some(cached) = self.state.lock().unwrap().server_version_num {
            return cached;
        }

        let rows = self
            .run_batch("SELECT current_setting('server_version_num')")
            .await;
        let num = rows.get(0, 0).parse::<i32>().unwrap_or(0);

        if num > 0 {
            self.state.lock().unwrap().server_version_num = Some(num);
        }
        num
    }

    /// Whether the server is at least `major.minor`.
    pub async fn backend_minimum_version(&self, major: i32, minor: i32) -> bool {
        self.server_version_num().await >= major * 10_000 + minor * 100
    }

    fn record_ok(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_ok = true;
        state.last_error = None;
    }

    fn record_error(&self, text: String) {
        let mut state = self.state.lock().unwrap();
        state.last_ok = false;
        state.last_error = Some(text);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dbname", &self.dbname)
            .finish_non_exhaustive()
    }
}

/// Extracts the server's message from a driver error, falling back to the
/// error's own rendering, with trailing line ends trimmed.
fn error_text(e: &tokio_postgres::Error) -> String {
    let text = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    text.trim_end_matches(['\r', '\n']).to_string()
}
