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

//! Error types for the agent.
//!
//! Failures scoped to a single step never appear here: the step executor
//! turns them into a failed step outcome and the job carries on according to
//! the step's on-error policy. `AgentError` covers everything the scheduler
//! and pool have to react to.

use thiserror::Error;

/// Errors surfaced by the scheduler engine and connection pool.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The connection string failed to parse or used an unknown keyword.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// The primary session could not be opened. Counted against the
    /// scheduler's retry budget.
    #[error("couldn't create the primary connection: {0}")]
    PrimaryConnectFailed(#[source] tokio_postgres::Error),

    /// A pooled worker session could not be opened. Fails the current step
    /// only; not counted against retries.
    #[error("couldn't create a new connection: {0}")]
    AcquireFailed(#[source] tokio_postgres::Error),

    /// A query failed on an established session. On the primary session
    /// during polling this escalates to an outer-loop restart.
    #[error("query failed: {0}")]
    QueryFailed(#[from] tokio_postgres::Error),

    /// `pgagent.pga_job` does not exist in the target database.
    #[error("could not find the table 'pgagent.pga_job' - has pgagent.sql been run on this database?")]
    SchemaMissing,

    /// `pgagent.pgagent_schema_version()` is absent from the schema.
    #[error("couldn't find the function 'pgagent_schema_version' - please run pgagent_upgrade.sql")]
    SchemaVersionFunctionMissing,

    /// The installed schema version does not match this build.
    #[error("unsupported schema version: {found}. Version {required} is required - please run pgagent_upgrade.sql")]
    SchemaVersionMismatch { found: i16, required: i16 },

    /// The startup zombie sweep failed. Logged at warning; another agent
    /// will eventually sweep.
    #[error("zombie sweep failed: {0}")]
    ZombieSweepFailed(String),

    /// Neither a connection string nor a database name was supplied to the
    /// pool.
    #[error("cannot allocate connection - no database or connection string specified")]
    InvalidArguments,

    /// The primary connection could not be established within the retry
    /// budget.
    #[error("couldn't establish the primary connection with the database server after {0} attempts")]
    RetriesExhausted(u32),
}

impl AgentError {
    /// Whether retrying the primary connection could possibly help. Schema
    /// problems and bad arguments stay broken no matter how often the agent
    /// reconnects.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidConnectionString(_)
                | AgentError::SchemaMissing
                | AgentError::SchemaVersionFunctionMissing
                | AgentError::SchemaVersionMismatch { .. }
                | AgentError::RetriesExhausted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_problems_are_fatal() {
        assert!(AgentError::SchemaMissing.is_fatal());
        assert!(AgentError::SchemaVersionFunctionMissing.is_fatal());
        assert!(AgentError::SchemaVersionMismatch {
            found: 3,
            required: 4
        }
        .is_fatal());
        assert!(AgentError::InvalidConnectionString("x".into()).is_fatal());
    }

    #[test]
    fn transient_failures_are_not_fatal() {
        assert!(!AgentError::InvalidArguments.is_fatal());
        assert!(!AgentError::ZombieSweepFailed("gone".into()).is_fatal());
    }

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let message = AgentError::SchemaVersionMismatch {
            found: 3,
            required: 4,
        }
        .to_string();
        assert!(message.contains('3'));
        assert!(message.contains('4'));
    }
}
