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

//! Job, job-log and step-log access.
//!
//! Everything the runner writes goes through parameter binding; the claim is
//! the conditional UPDATE whose affected-row count is the authoritative race
//! result between agents.

use crate::database::Session;
use crate::error::Result;
use crate::models::{JobStep, OnErrorPolicy, RunStatus};

/// Data access for `pga_job`, `pga_joblog` and `pga_jobsteplog`, scoped to
/// one session.
pub struct JobDal<'a> {
    session: &'a Session,
}

impl<'a> JobDal<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Jobs that are enabled, unclaimed, due, and addressed to this host
    /// (or to no host), oldest first.
    pub async fn due_jobs(&self, hostname: &str) -> Result<Vec<i32>> {
        let rows = self
            .session
            .query(
                "SELECT J.jobid \
                   FROM pgagent.pga_job J \
                  WHERE jobenabled \
                    AND jobagentid IS NULL \
                    AND jobnextrun <= now() \
                    AND (jobhostagent = '' OR jobhostagent = $1) \
                  ORDER BY jobnextrun",
                &[&hostname],
            )
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get(0)?);
        }
        Ok(ids)
    }

    /// Attempts the atomic claim. True when this agent won the job; false
    /// when another agent got there first.
    pub async fn claim(&self, backend_pid: i32, job_id: i32) -> Result<bool> {
        let n = self
            .session
            .execute(
                "UPDATE pgagent.pga_job \
                    SET jobagentid = $1, joblastrun = now() \
                  WHERE jobagentid IS NULL AND jobid = $2",
                &[&backend_pid, &job_id],
            )
            .await?;
        Ok(n == 1)
    }

    /// Allocates a job-log id and opens the row with status `r`.
    pub async fn open_job_log(&self, job_id: i32) -> Result<i32> {
        let row = self
            .session
            .query_one(
                "SELECT nextval('pgagent.pga_joblog_jlgid_seq')::int4 AS id",
                &[],
            )
            .await?;
        let log_id: i32 = row.try_get("id")?;

        self.session
            .execute(
                "INSERT INTO pgagent.pga_joblog (jlgid, jlgjobid, jlgstatus) \
                 VALUES ($1, $2, 'r')",
                &[&log_id, &job_id],
            )
            .await?;

        Ok(log_id)
    }

    /// Writes the job log's terminal status and duration.
    pub async fn close_job_log(&self, log_id: i32, status: RunStatus) -> Result<u64> {
        self.session
            .execute(
                "UPDATE pgagent.pga_joblog \
                    SET jlgstatus = $1, jlgduration = now() - jlgstart \
                  WHERE jlgid = $2",
                &[&status.code(), &log_id],
            )
            .await
    }

    /// Clears the claim and the consumed next-run instant; the schema's
    /// trigger recomputes the schedule from here.
    pub async fn release_job(&self, job_id: i32) -> Result<u64> {
        self.session
            .execute(
                "UPDATE pgagent.pga_job \
                    SET jobagentid = NULL, jobnextrun = NULL \
                  WHERE jobid = $1",
                &[&job_id],
            )
            .await
    }

    /// The job's enabled steps in execution order (`jstname`, then `jstid`).
    pub async fn enabled_steps(&self, job_id: i32) -> Result<Vec<JobStep>> {
        let rows = self
            .session
            .query(
                "SELECT jstid, jstname, jstkind, jstcode, jstconnstr, jstdbname, jstonerror \
                   FROM pgagent.pga_jobstep \
                  WHERE jstenabled AND jstjobid = $1 \
                  ORDER BY jstname, jstid",
                &[&job_id],
            )
            .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let on_error: String = row.try_get("jstonerror")?;
            // jstconnstr and jstdbname are null when the step doesn't
            // override the agent's connection.
            let connstr: Option<String> = row.try_get("jstconnstr")?;
            let dbname: Option<String> = row.try_get("jstdbname")?;
            steps.push(JobStep {
                id: row.try_get("jstid")?,
                name: row.try_get("jstname")?,
                kind_code: row.try_get("jstkind")?,
                code: row.try_get("jstcode")?,
                connstr: connstr.unwrap_or_default(),
                dbname: dbname.unwrap_or_default(),
                on_error: OnErrorPolicy::new(on_error),
            });
        }
        Ok(steps)
    }

    /// Allocates a step-log id and opens the row with status `r`, keyed on
    /// the step row so a concurrently deleted step opens nothing.
    ///
    /// Returns the new id, or `None` when the insert did not affect exactly
    /// one row.
    pub async fn open_step_log(&self, log_id: i32, step_id: i32) -> Result<Option<i32>> {
        let row = self
            .session
            .query_one(
                "SELECT nextval('pgagent.pga_jobsteplog_jslid_seq')::int4 AS id",
                &[],
            )
            .await?;
        let step_log_id: i32 = row.try_get("id")?;

        let n = self
            .session
            .execute(
                "INSERT INTO pgagent.pga_jobsteplog (jslid, jsljlgid, jsljstid, jslstatus) \
                 SELECT $1, $2, $3, 'r' \
                   FROM pgagent.pga_jobstep WHERE jstid = $3",
                &[&step_log_id, &log_id, &step_id],
            )
            .await?;

        Ok((n == 1).then_some(step_log_id))
    }

    /// Writes the step log's terminal status, duration, numeric result, and
    /// captured output. Returns the affected-row count; anything but 1 means
    /// the row vanished underneath the runner.
    pub async fn close_step_log(
        &self,
        step_log_id: i32,
        status: &str,
        result: i64,
        output: &str,
    ) -> Result<u64> {
        let result = result.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        self.session
            .execute(
                "UPDATE pgagent.pga_jobsteplog \
                    SET jslduration = now() - jslstart, \
                        jslresult = $1, jslstatus = $2, jsloutput = $3 \
                  WHERE jslid = $4",
                &[&result, &status, &output, &step_log_id],
            )
            .await
    }
}
