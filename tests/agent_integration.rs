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

//! Live-database integration tests.
//!
//! These run against a real PostgreSQL with the pgagent schema (version 4)
//! installed, named by the `PGSTEWARD_TEST_DSN` environment variable, e.g.
//!
//! ```text
//! PGSTEWARD_TEST_DSN="host=localhost user=postgres dbname=pgagent_test" \
//!     cargo test -- --ignored
//! ```
//!
//! They are `#[ignore]`d so a plain `cargo test` stays database-free, and
//! serialized because they share schema state.

use std::sync::Arc;

use serial_test::serial;

use pgsteward::dal::{AgentDal, JobDal};
use pgsteward::database::{ConnectionPool, PooledSession, Session};
use pgsteward::executor::JobRunner;

struct Fixture {
    pool: Arc<ConnectionPool>,
    primary: PooledSession,
    backend_pid: i32,
}

async fn fixture() -> Fixture {
    let dsn = std::env::var("PGSTEWARD_TEST_DSN")
        .expect("set PGSTEWARD_TEST_DSN to a database with the pgagent schema installed");

    let pool = ConnectionPool::new();
    let primary = pool
        .init_primary(&dsn)
        .await
        .expect("failed to open the primary connection");

    let backend_pid = AgentDal::new(&primary)
        .sanity_check()
        .await
        .expect("pgagent schema missing from the test database");

    Fixture {
        pool,
        primary,
        backend_pid,
    }
}

/// Inserts a due, enabled job and returns its id.
async fn create_job(session: &Session, name: &str, host_agent: &str) -> i32 {
    let row = session
        .query_one(
            "INSERT INTO pgagent.pga_job \
                 (jobjclid, jobname, jobhostagent, jobenabled, jobnextrun) \
             VALUES (1, $1, $2, true, now() - interval '1 minute') \
             RETURNING jobid",
            &[&name, &host_agent],
        )
        .await
        .expect("failed to insert test job");
    row.get(0)
}

async fn create_step(session: &Session, job_id: i32, name: &str, kind: &str, code: &str) -> i32 {
    let row = session
        .query_one(
            "INSERT INTO pgagent.pga_jobstep \
                 (jstjobid, jstname, jstenabled, jstkind, jstcode, jstonerror) \
             VALUES ($1, $2, true, $3, $4, 'f') \
             RETURNING jstid",
            &[&job_id, &name, &kind, &code],
        )
        .await
        .expect("failed to insert test step");
    row.get(0)
}

/// Removes the job and, through the schema's cascades, its steps and logs.
async fn drop_job(session: &Session, job_id: i32) {
    session
        .execute("DELETE FROM pgagent.pga_job WHERE jobid = $1", &[&job_id])
        .await
        .expect("failed to delete test job");
}

async fn job_log_statuses(session: &Session, job_id: i32) -> Vec<String> {
    let rows = session
        .query(
            "SELECT jlgstatus FROM pgagent.pga_joblog WHERE jlgjobid = $1 ORDER BY jlgid",
            &[&job_id],
        )
        .await
        .unwrap();
    rows.iter().map(|r| r.get::<_, String>(0)).collect()
}

async fn step_logs(session: &Session, job_id: i32) -> Vec<(String, i32, String)> {
    let rows = session
        .query(
            "SELECT s.jslstatus, s.jslresult, s.jsloutput \
               FROM pgagent.pga_jobsteplog s \
               JOIN pgagent.pga_joblog l ON l.jlgid = s.jsljlgid \
              WHERE l.jlgjobid = $1 \
              ORDER BY s.jslid",
            &[&job_id],
        )
        .await
        .unwrap();
    rows.iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect()
}

async fn run_job(fixture: &Fixture, job_id: i32) {
    let service_db = fixture.pool.service_dbname().unwrap_or_default();
    let session = fixture
        .pool
        .acquire("", &service_db)
        .await
        .expect("failed to acquire a logging session");
    JobRunner::new(fixture.pool.clone(), session, fixture.backend_pid, job_id)
        .run()
        .await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn happy_sql_job_leaves_success_logs() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-happy", "").await;
    create_step(&fx.primary, job_id, "only", "s", "SELECT 1").await;

    run_job(&fx, job_id).await;

    assert_eq!(job_log_statuses(&fx.primary, job_id).await, vec!["s"]);
    let steps = step_logs(&fx.primary, job_id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0], ("s".to_string(), 1, String::new()));

    // The claim was released on the way out.
    let row = fx
        .primary
        .query_one(
            "SELECT jobagentid IS NULL AS released FROM pgagent.pga_job WHERE jobid = $1",
            &[&job_id],
        )
        .await
        .unwrap();
    assert!(row.get::<_, bool>("released"));

    drop_job(&fx.primary, job_id).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn failing_sql_step_fails_the_job() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-div0", "").await;
    create_step(&fx.primary, job_id, "bad", "s", "SELECT 1/0").await;

    run_job(&fx, job_id).await;

    assert_eq!(job_log_statuses(&fx.primary, job_id).await, vec!["f"]);
    let steps = step_logs(&fx.primary, job_id).await;
    assert_eq!(steps.len(), 1);
    let (status, result, output) = &steps[0];
    assert_eq!(status, "f");
    assert_eq!(*result, -1);
    assert!(output.contains("division by zero"));

    drop_job(&fx.primary, job_id).await;
}

#[cfg(unix)]
#[tokio::test]
#[serial]
#[ignore]
async fn batch_then_sql_steps_run_in_name_order() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-batch", "").await;
    // Named so the script sorts first.
    create_step(&fx.primary, job_id, "a-script", "b", "echo hello\nexit 0\n").await;
    create_step(&fx.primary, job_id, "b-sql", "s", "SELECT 1").await;

    run_job(&fx, job_id).await;

    assert_eq!(job_log_statuses(&fx.primary, job_id).await, vec!["s"]);
    let steps = step_logs(&fx.primary, job_id).await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0], ("s".to_string(), 0, "hello\n".to_string()));
    assert_eq!(steps[1].0, "s");

    drop_job(&fx.primary, job_id).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn jobs_addressed_to_another_host_are_left_alone() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-host", "some-other-host").await;

    let due = JobDal::new(&fx.primary)
        .due_jobs("this-host")
        .await
        .unwrap();
    assert!(!due.contains(&job_id));

    // No claim, no log rows.
    assert!(job_log_statuses(&fx.primary, job_id).await.is_empty());

    drop_job(&fx.primary, job_id).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn claim_is_won_exactly_once() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-claim", "").await;

    let dal = JobDal::new(&fx.primary);
    assert!(dal.claim(fx.backend_pid, job_id).await.unwrap());
    // The second conditional UPDATE finds jobagentid already set.
    assert!(!dal.claim(fx.backend_pid, job_id).await.unwrap());

    dal.release_job(job_id).await.unwrap();
    drop_job(&fx.primary, job_id).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn zombie_sweep_reclassifies_abandoned_work_and_is_idempotent() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-zombie", "").await;

    // A dead agent: registered pid with no backing session.
    let zombie_pid: i32 = 999_999;
    fx.primary
        .execute(
            "INSERT INTO pgagent.pga_jobagent (jagpid, jagstation) VALUES ($1, 'ghost')",
            &[&zombie_pid],
        )
        .await
        .unwrap();
    fx.primary
        .execute(
            "UPDATE pgagent.pga_job SET jobagentid = $1 WHERE jobid = $2",
            &[&zombie_pid, &job_id],
        )
        .await
        .unwrap();
    fx.primary
        .execute(
            "INSERT INTO pgagent.pga_joblog (jlgid, jlgjobid, jlgstatus) \
             VALUES (nextval('pgagent.pga_joblog_jlgid_seq')::int4, $1, 'r')",
            &[&job_id],
        )
        .await
        .unwrap();

    let dal = AgentDal::new(&fx.primary);
    dal.sweep_zombies().await.unwrap();

    assert_eq!(job_log_statuses(&fx.primary, job_id).await, vec!["d"]);
    let row = fx
        .primary
        .query_one(
            "SELECT count(*) AS n FROM pgagent.pga_jobagent WHERE jagpid = $1",
            &[&zombie_pid],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, i64>("n"), 0);

    // Running the sweep again changes nothing further.
    dal.sweep_zombies().await.unwrap();
    assert_eq!(job_log_statuses(&fx.primary, job_id).await, vec!["d"]);

    drop_job(&fx.primary, job_id).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn released_sessions_are_reused_by_identity() {
    let fx = fixture().await;
    let service_db = fx.pool.service_dbname().unwrap_or_default();

    let first = fx.pool.acquire("", &service_db).await.unwrap();
    let first_ptr = &*first as *const Session as usize;
    fx.pool.release(first).await;

    let second = fx.pool.acquire("", &service_db).await.unwrap();
    let second_ptr = &*second as *const Session as usize;

    assert_eq!(first_ptr, second_ptr);
    fx.pool.release(second).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn reset_all_discards_session_state_across_reuse() {
    let fx = fixture().await;
    let service_db = fx.pool.service_dbname().unwrap_or_default();

    let session = fx.pool.acquire("", &service_db).await.unwrap();
    session.run_batch("SET search_path TO pg_temp").await;
    assert!(session.last_command_ok());
    fx.pool.release(session).await;

    let session = fx.pool.acquire("", &service_db).await.unwrap();
    let rows = session.run_batch("SHOW search_path").await;
    assert_ne!(rows.get(0, 0), "pg_temp");
    fx.pool.release(session).await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn steps_are_returned_in_name_then_id_order() {
    let fx = fixture().await;
    let job_id = create_job(&fx.primary, "pgsteward-test-order", "").await;
    create_step(&fx.primary, job_id, "zz", "s", "SELECT 1").await;
    create_step(&fx.primary, job_id, "aa", "s", "SELECT 2").await;
    create_step(&fx.primary, job_id, "aa", "s", "SELECT 3").await;

    let steps = JobDal::new(&fx.primary).enabled_steps(job_id).await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["aa", "aa", "zz"]);
    // Equal names fall back to id order.
    assert!(steps[0].id < steps[1].id);

    drop_job(&fx.primary, job_id).await;
}
