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

//! Agent-level access: schema sanity, schema version, zombie recovery, and
//! self-registration. All of it runs on the primary session.

use crate::database::Session;
use crate::error::{AgentError, Result};

/// Data access for `pga_jobagent` and the startup checks.
pub struct AgentDal<'a> {
    session: &'a Session,
}

impl<'a> AgentDal<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Verifies `pgagent.pga_job` exists and captures this session's
    /// backend pid - the agent's identity for its whole lifetime.
    pub async fn sanity_check(&self) -> Result<i32> {
        let row = self
            .session
            .query_one(
                "SELECT count(*) AS count, pg_backend_pid() AS pid \
                   FROM pg_class cl JOIN pg_namespace ns ON ns.oid = cl.relnamespace \
                  WHERE relname = 'pga_job' AND nspname = 'pgagent'",
                &[],
            )
            .await?;

        let count: i64 = row.try_get("count")?;
        if count == 0 {
            return Err(AgentError::SchemaMissing);
        }
        row.try_get("pid").map_err(AgentError::QueryFailed)
    }

    /// Whether `pgagent.pgagent_schema_version()` exists with the expected
    /// signature (no arguments, returns int2).
    pub async fn schema_version_function_exists(&self) -> Result<bool> {
        let row = self
            .session
            .query_one(
                "SELECT count(*) AS count \
                   FROM pg_proc \
                  WHERE proname = 'pgagent_schema_version' \
                    AND pronamespace = (SELECT oid FROM pg_namespace WHERE nspname = 'pgagent') \
                    AND prorettype = (SELECT oid FROM pg_type WHERE typname = 'int2') \
                    AND proargtypes = ''",
                &[],
            )
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count == 1)
    }

    /// The installed schema's version number.
    pub async fn schema_version(&self) -> Result<i16> {
        let row = self
            .session
            .query_one("SELECT pgagent.pgagent_schema_version() AS version", &[])
            .await?;
        row.try_get("version").map_err(AgentError::QueryFailed)
    }

    /// Reclassifies work abandoned by dead agents.
    ///
    /// In one transaction: collect the pids registered in `pga_jobagent`
    /// whose backing session no longer appears in `pg_stat_activity`, mark
    /// their running job logs and step logs aborted, unclaim their jobs, and
    /// delete the stale agent rows. Idempotent - a second run finds nothing
    /// left to change.
    pub async fn sweep_zombies(&self) -> Result<()> {
        // pg_stat_activity renamed procpid to pid in 9.2.
        let pid_column = if self.session.backend_minimum_version(9, 2).await {
            "pid"
        } else {
            "procpid"
        };

        let sql = format!(
            "BEGIN;\n\
             CREATE TEMP TABLE pga_tmp_zombies(jagpid int4);\n\
             INSERT INTO pga_tmp_zombies (jagpid) \
             SELECT jagpid \
               FROM pgagent.pga_jobagent AG \
               LEFT JOIN pg_stat_activity PA ON jagpid = {pid} \
              WHERE {pid} IS NULL;\n\
             UPDATE pgagent.pga_joblog SET jlgstatus = 'd' WHERE jlgid IN (\
             SELECT jlgid \
               FROM pga_tmp_zombies z, pgagent.pga_job j, pgagent.pga_joblog l \
              WHERE z.jagpid = j.jobagentid AND j.jobid = l.jlgjobid AND l.jlgstatus = 'r');\n\
             UPDATE pgagent.pga_jobsteplog SET jslstatus = 'd' WHERE jslid IN (\
             SELECT jslid \
               FROM pga_tmp_zombies z, pgagent.pga_job j, pgagent.pga_joblog l, \
                    pgagent.pga_jobsteplog s \
              WHERE z.jagpid = j.jobagentid AND j.jobid = l.jlgjobid \
                AND l.jlgid = s.jsljlgid AND s.jslstatus = 'r');\n\
             UPDATE pgagent.pga_job SET jobagentid = NULL, jobnextrun = NULL \
              WHERE jobagentid IN (SELECT jagpid FROM pga_tmp_zombies);\n\
             DELETE FROM pgagent.pga_jobagent \
              WHERE jagpid IN (SELECT jagpid FROM pga_tmp_zombies);\n\
             DROP TABLE pga_tmp_zombies;\n\
             COMMIT",
            pid = pid_column
        );

        self.session.run_batch(&sql).await;
        if !self.session.last_command_ok() {
            let error = self.session.last_error();
            // Leave the primary session usable for the poll loop.
            self.session.run_batch("ROLLBACK").await;
            return Err(AgentError::ZombieSweepFailed(error));
        }
        Ok(())
    }

    /// Registers this agent under its backend pid and station name.
    pub async fn register(&self, hostname: &str) -> Result<()> {
        self.session
            .execute(
                "INSERT INTO pgagent.pga_jobagent (jagpid, jagstation) \
                 SELECT pg_backend_pid(), $1",
                &[&hostname],
            )
            .await?;
        Ok(())
    }
}
