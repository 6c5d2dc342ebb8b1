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

//! Step execution: the two step dialects.
//!
//! A SQL step runs in-database on a pooled session; a batch step is written
//! to a per-step workspace and run as a child process with its stdout piped
//! back and its stderr captured to a file. Failures here are data, not
//! control flow: every path produces a [`StepOutcome`] and the job runner
//! applies the step's on-error policy to it.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::database::ConnectionPool;
use crate::executor::workspace::StepWorkspace;
use crate::models::JobStep;

#[cfg(windows)]
const SCRIPT_EXT: &str = "bat";
#[cfg(not(windows))]
const SCRIPT_EXT: &str = "scr";

/// What one step execution produced.
#[derive(Debug)]
pub struct StepOutcome {
    pub succeeded: bool,
    /// Affected-row count of the final SQL statement, or the script's exit
    /// status; -1 on failure to execute at all.
    pub result_code: i64,
    /// Captured output: the server error text for SQL, stdout (plus any
    /// stderr capture) for scripts.
    pub output: String,
}

impl StepOutcome {
    fn failed(output: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            result_code: -1,
            output: output.into(),
        }
    }
}

/// Runs a SQL step on a session matching the step's connection string and
/// database (empty connection string means the agent's base connection with
/// the step's database substituted).
pub async fn run_sql_step(pool: &ConnectionPool, job_id: i32, step: &JobStep) -> StepOutcome {
    let session = match pool.acquire(&step.connstr, &step.dbname).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                "Failed to allocate a connection for step {} of job {}: {}",
                step.id, job_id, e
            );
            return StepOutcome::failed("Couldn't get a connection to the database!");
        }
    };

    debug!("Executing SQL step {} (part of job {})", step.id, job_id);
    let rows = session.run_batch(&step.code).await;

    let outcome = StepOutcome {
        succeeded: session.last_command_ok(),
        result_code: rows.rows_affected(),
        output: session.last_error(),
    };

    pool.release(session).await;
    outcome
}

/// Runs a batch step: writes the script into a fresh workspace, spawns it
/// through the platform shell with stderr captured to a file, and reads its
/// stdout in full.
pub async fn run_batch_step(job_id: i32, step: &JobStep) -> StepOutcome {
    debug!("Executing batch step {} (part of job {})", step.id, job_id);

    let workspace = match StepWorkspace::create(&format!("pga_{}_{}_", job_id, step.id)) {
        Ok(workspace) => workspace,
        Err(e) => {
            warn!("Couldn't create temporary directory: {}", e);
            return StepOutcome::failed("Couldn't create temporary directory!");
        }
    };

    let script_path = workspace
        .path()
        .join(format!("{}_{}.{}", job_id, step.id, SCRIPT_EXT));
    let error_path = workspace
        .path()
        .join(format!("{}_{}_error.txt", job_id, step.id));

    let code = normalize_line_endings(&step.code);
    if let Err(e) = tokio::fs::write(&script_path, code.as_bytes()).await {
        warn!(
            "Couldn't open temporary script file {}: {}",
            script_path.display(),
            e
        );
        workspace.cleanup();
        return StepOutcome::failed("Couldn't write the temporary script file!");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o700))
        {
            debug!(
                "Error setting executable permission on {}: {}",
                script_path.display(),
                e
            );
        }
    }

    let error_file = match std::fs::File::create(&error_path) {
        Ok(file) => file,
        Err(e) => {
            warn!(
                "Couldn't open the script error file {}: {}",
                error_path.display(),
                e
            );
            workspace.cleanup();
            return StepOutcome::failed("Couldn't open the script error file!");
        }
    };

    debug!("Executing script file: {}", script_path.display());

    #[cfg(not(windows))]
    let mut command = {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&script_path);
        command
    };
    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("cmd");
        command.arg("/c").arg(&script_path);
        command
    };

    let mut child = match command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(error_file))
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(
                "Couldn't execute script {}: {}",
                script_path.display(),
                e
            );
            workspace.cleanup();
            return StepOutcome::failed(format!("Couldn't execute script: {}", e));
        }
    };

    // Drain stdout fully before reaping the child; scripts may produce far
    // more than a pipe buffer.
    let mut raw_output = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        if let Err(e) = stdout.read_to_end(&mut raw_output).await {
            warn!("Error reading script output: {}", e);
        }
    }

    let result_code = match child.wait().await {
        Ok(status) => status.code().map(i64::from).unwrap_or(-1),
        Err(e) => {
            warn!("Couldn't fetch the script's exit status: {}", e);
            -1
        }
    };

    debug!("Script return code: {}", result_code);
    let mut output = String::from_utf8_lossy(&raw_output).into_owned();

    // The script may have said nothing on stdout and everything on stderr.
    match tokio::fs::read(&error_path).await {
        Ok(bytes) => {
            let error_text = String::from_utf8_lossy(&bytes);
            if !error_text.trim().is_empty() {
                warn!("Script Error:\n{}", error_text);
                output.push_str("\nScript Error:\n");
                output.push_str(&error_text);
                output.push('\n');
            }
        }
        Err(e) => warn!(
            "Couldn't read the script error file {}: {}",
            error_path.display(),
            e
        ),
    }

    workspace.cleanup();

    StepOutcome {
        succeeded: result_code == 0,
        result_code,
        output,
    }
}

/// Collapses every CRLF to LF; on Windows the result is re-expanded so the
/// interpreter sees its native line ends.
fn normalize_line_endings(code: &str) -> String {
    let unix = code.replace("\r\n", "\n");
    if cfg!(windows) {
        unix.replace('\n', "\r\n")
    } else {
        unix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OnErrorPolicy;
    use serial_test::serial;

    fn batch_step(id: i32, code: &str) -> JobStep {
        JobStep {
            id,
            name: format!("step-{}", id),
            kind_code: "b".to_string(),
            code: code.to_string(),
            connstr: String::new(),
            dbname: String::new(),
            on_error: OnErrorPolicy::new("f"),
        }
    }

    fn sql_step(id: i32, connstr: &str, dbname: &str, code: &str) -> JobStep {
        JobStep {
            id,
            name: format!("step-{}", id),
            kind_code: "s".to_string(),
            code: code.to_string(),
            connstr: connstr.to_string(),
            dbname: dbname.to_string(),
            on_error: OnErrorPolicy::new("f"),
        }
    }

    #[tokio::test]
    async fn sql_step_with_no_target_fails_cleanly() {
        // No primary connection and nothing on the step itself to connect
        // with; the step fails without touching the job.
        let pool = ConnectionPool::new();
        let step = sql_step(10, "", "", "SELECT 1");

        let outcome = run_sql_step(&pool, 100, &step).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.result_code, -1);
        assert_eq!(outcome.output, "Couldn't get a connection to the database!");
    }

    #[tokio::test]
    async fn sql_step_with_malformed_connstr_fails_cleanly() {
        let pool = ConnectionPool::new();
        let step = sql_step(11, "not-a-connection-string", "", "SELECT 1");

        let outcome = run_sql_step(&pool, 100, &step).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.result_code, -1);
        assert_eq!(outcome.output, "Couldn't get a connection to the database!");
    }

    #[tokio::test]
    async fn sql_step_against_unreachable_server_fails_cleanly() {
        // Port 1 on loopback refuses immediately; the open error surfaces
        // as a failed step, not an error.
        let pool = ConnectionPool::new();
        let step = sql_step(
            12,
            "user=nobody host=127.0.0.1 port=1 connect_timeout=1",
            "",
            "SELECT 1",
        );

        let outcome = run_sql_step(&pool, 100, &step).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.result_code, -1);
        assert_eq!(outcome.output, "Couldn't get a connection to the database!");
    }

    #[test]
    #[cfg(not(windows))]
    fn line_endings_collapse_to_lf() {
        assert_eq!(normalize_line_endings("a\r\nb\r\nc"), "a\nb\nc");
        assert_eq!(normalize_line_endings("a\nb"), "a\nb");
        assert_eq!(normalize_line_endings(""), "");
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn script_stdout_is_captured() {
        let step = batch_step(1, "echo hello\nexit 0\n");
        let outcome = run_batch_step(100, &step).await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.result_code, 0);
        assert_eq!(outcome.output, "hello\n");
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn nonzero_exit_with_stderr_is_a_failure_with_capture() {
        let step = batch_step(2, "echo boom >&2\nexit 3\n");
        let outcome = run_batch_step(100, &step).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.result_code, 3);
        assert!(outcome.output.contains("Script Error:\n"));
        assert!(outcome.output.contains("boom"));
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn silent_failure_still_reports_exit_code() {
        let step = batch_step(3, "exit 7\n");
        let outcome = run_batch_step(100, &step).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.result_code, 7);
        assert_eq!(outcome.output, "");
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn large_stdout_is_fully_captured() {
        // Well past any pipe buffer.
        let step = batch_step(4, "seq 1 200000\n");
        let outcome = run_batch_step(100, &step).await;

        assert!(outcome.succeeded);
        assert!(outcome.output.len() > 1_000_000);
        assert!(outcome.output.ends_with("200000\n"));
    }

    #[tokio::test]
    #[serial]
    #[cfg(unix)]
    async fn crlf_script_bodies_run_unmodified() {
        let step = batch_step(5, "echo first\r\necho second\r\n");
        let outcome = run_batch_step(100, &step).await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.output, "first\nsecond\n");
    }
}
