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

//! Startup sequence for one primary-connection incarnation.
//!
//! Runs on the primary session before the poll loop: schema sanity, schema
//! version, zombie recovery, self-registration. The backend pid captured
//! here is the agent's identity everywhere - in the claim, in its
//! `pga_jobagent` row, and to other agents' sweeps.

use tracing::{debug, warn};

use crate::dal::AgentDal;
use crate::database::Session;
use crate::error::{AgentError, Result};

/// The `pgagent` schema major version this agent understands.
pub const SCHEMA_VERSION: i16 = 4;

/// Validates the schema, sweeps zombies, and registers this agent.
///
/// Returns the primary session's backend pid. Schema problems are fatal; a
/// failed zombie sweep only warns - some other agent will eventually sweep.
pub async fn initialize(session: &Session, hostname: &str) -> Result<i32> {
    let dal = AgentDal::new(session);

    debug!("Database sanity check");
    let backend_pid = dal.sanity_check().await?;

    if !dal.schema_version_function_exists().await? {
        return Err(AgentError::SchemaVersionFunctionMissing);
    }
    let found = dal.schema_version().await?;
    if found != SCHEMA_VERSION {
        return Err(AgentError::SchemaVersionMismatch {
            found,
            required: SCHEMA_VERSION,
        });
    }

    debug!("Clearing zombies");
    if let Err(e) = dal.sweep_zombies().await {
        warn!("{}", e);
    }

    dal.register(hostname).await?;
    debug!(
        "Agent registered with pid {} for station {}",
        backend_pid, hostname
    );

    Ok(backend_pid)
}
