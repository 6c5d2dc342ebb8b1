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

//! pgsteward - a PostgreSQL job scheduling agent.
//!
//! The agent polls the `pgagent` schema for enabled, due jobs, claims each
//! one atomically through a conditional UPDATE, and executes the job's
//! ordered steps - SQL run in-database, scripts run as child processes -
//! recording job and step history back into the same schema. One agent runs
//! per host; many agents may share a database, each claiming only jobs
//! addressed to it (or to no host in particular). Agents identify themselves
//! by the backend pid of their primary session, so a crashed agent is
//! recognized by its pid vanishing from `pg_stat_activity` and its in-flight
//! work is reclassified by the next agent's zombie sweep.
//!
//! The crate splits along those lines:
//!
//! - [`database`] - connection-string normalization, sessions, and the
//!   process-wide pool feeding both the scheduler and the step executor
//! - [`dal`] - every SQL statement the agent runs against the schema
//! - [`executor`] - the per-job runner, the two step dialects, and the
//!   script workspace
//! - [`scheduler`] - the restartable outer loop, the poll tick, and the
//!   startup/recovery sequence
//!
//! The schema itself is owned by an external installer; this crate assumes
//! it exists at the version in [`scheduler::startup::SCHEMA_VERSION`].

pub mod dal;
pub mod database;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod settings;

pub use error::{AgentError, Result};
pub use scheduler::{Scheduler, ShutdownSignal};
pub use settings::{LogVerbosity, Settings};
