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

//! Row types for `pga_jobstep` and the step alphabets.
//!
//! The agent only reads these tables; their shape is owned by the external
//! schema installer.

/// The two step dialects the executor understands.
///
/// Any other `jstkind` letter is a structural error: the runner records the
/// job as internal-error and aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// `s` - the step body is SQL executed in-database.
    Sql,
    /// `b` - the step body is a batch/shell script run out of process.
    Batch,
}

impl StepKind {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" => Some(StepKind::Sql),
            "b" => Some(StepKind::Batch),
            _ => None,
        }
    }
}

/// A step's on-error policy, carried as the raw letter from `jstonerror`.
///
/// Only `f` fails the job. Any other letter marks the failed step with that
/// letter and the job continues; `s` treats the failure as success, `i`
/// records it as ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnErrorPolicy {
    code: String,
}

impl OnErrorPolicy {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            // An absent policy fails the job; pessimism is the safe default.
            code: if code.is_empty() {
                "f".to_string()
            } else {
                code
            },
        }
    }

    /// The status letter recorded on the step log when the step fails.
    pub fn status_code(&self) -> &str {
        &self.code
    }

    /// Whether a failure under this policy fails the whole job.
    pub fn fails_job(&self) -> bool {
        self.code == "f"
    }
}

/// One enabled row of `pga_jobstep`, in execution order.
#[derive(Debug, Clone)]
pub struct JobStep {
    /// `jstid`
    pub id: i32,
    /// `jstname`; steps execute ordered by (`jstname`, `jstid`).
    pub name: String,
    /// Raw `jstkind` letter; parse with [`JobStep::kind`].
    pub kind_code: String,
    /// `jstcode` - the SQL text or script body.
    pub code: String,
    /// `jstconnstr` - optional connection string for SQL steps; empty means
    /// the agent's base connection.
    pub connstr: String,
    /// `jstdbname` - optional database for SQL steps.
    pub dbname: String,
    /// `jstonerror`
    pub on_error: OnErrorPolicy,
}

impl JobStep {
    pub fn kind(&self) -> Option<StepKind> {
        StepKind::from_code(&self.kind_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_kind_letters() {
        assert_eq!(StepKind::from_code("s"), Some(StepKind::Sql));
        assert_eq!(StepKind::from_code("b"), Some(StepKind::Batch));
        assert_eq!(StepKind::from_code("x"), None);
        assert_eq!(StepKind::from_code(""), None);
    }

    #[test]
    fn only_f_fails_the_job() {
        assert!(OnErrorPolicy::new("f").fails_job());
        assert!(!OnErrorPolicy::new("s").fails_job());
        assert!(!OnErrorPolicy::new("i").fails_job());
        // Unknown letters continue the job, marked with that letter.
        assert!(!OnErrorPolicy::new("x").fails_job());
        assert_eq!(OnErrorPolicy::new("x").status_code(), "x");
    }

    #[test]
    fn empty_policy_defaults_to_fail() {
        let policy = OnErrorPolicy::new("");
        assert!(policy.fails_job());
        assert_eq!(policy.status_code(), "f");
    }
}
