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

//! The run-status alphabet shared by `pga_joblog` and `pga_jobsteplog`.
//!
//! The alphabet is closed: the agent never writes any other letter. `d`
//! (aborted) is written only by the zombie sweep, never by a live runner.

/// Status letters recorded in the log tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// `r` - the log row is open; the owning agent is still working.
    Running,
    /// `s` - completed successfully.
    Succeeded,
    /// `f` - a step failed with a fatal on-error policy.
    Failed,
    /// `i` - structural error: invalid step kind, log bookkeeping failure,
    /// or a job with no enabled steps.
    InternalError,
    /// `d` - reclassified by a zombie sweep after its agent vanished.
    Aborted,
}

impl RunStatus {
    /// The single-letter form written to the database.
    pub fn code(&self) -> &'static str {
        match self {
            RunStatus::Running => "r",
            RunStatus::Succeeded => "s",
            RunStatus::Failed => "f",
            RunStatus::InternalError => "i",
            RunStatus::Aborted => "d",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "r" => Some(RunStatus::Running),
            "s" => Some(RunStatus::Succeeded),
            "f" => Some(RunStatus::Failed),
            "i" => Some(RunStatus::InternalError),
            "d" => Some(RunStatus::Aborted),
            _ => None,
        }
    }

    /// Whether this is a terminal status (anything but `r`).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for status in [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::InternalError,
            RunStatus::Aborted,
        ] {
            assert_eq!(RunStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(RunStatus::from_code("x"), None);
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::InternalError.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }
}
