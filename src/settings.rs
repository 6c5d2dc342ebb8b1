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

//! Runtime settings for the agent.
//!
//! Everything here is written once at startup and read-only afterwards; the
//! scheduler and workers only ever see an immutable [`Settings`].

use std::path::PathBuf;
use std::time::Duration;

/// Log verbosity selected on the command line (`-l 0|1|2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogVerbosity {
    /// Errors only (the default).
    #[default]
    Error,
    /// Errors and warnings.
    Warning,
    /// Everything.
    Debug,
}

impl LogVerbosity {
    /// Maps the numeric CLI level to a verbosity, rejecting out-of-range
    /// values.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(LogVerbosity::Error),
            1 => Some(LogVerbosity::Warning),
            2 => Some(LogVerbosity::Debug),
            _ => None,
        }
    }
}

/// Immutable agent configuration.
///
/// Built through [`Settings::builder`]; the builder validates the interval
/// bounds the CLI documents (`-t` > 0, `-r` >= 10).
#[derive(Debug, Clone)]
pub struct Settings {
    connect_string: String,
    poll_interval: Duration,
    retry_interval: Duration,
    verbosity: LogVerbosity,
    log_file: Option<PathBuf>,
    foreground: bool,
    max_concurrent_jobs: usize,
}

impl Settings {
    pub fn builder(connect_string: impl Into<String>) -> SettingsBuilder {
        SettingsBuilder::new(connect_string)
    }

    /// The raw keyword=value connection string handed to the pool.
    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }

    /// Sleep between poll ticks (`-t`).
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Sleep between primary-connection attempts (`-r`).
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn verbosity(&self) -> LogVerbosity {
        self.verbosity
    }

    /// Log file path; messages go to stdout when unset.
    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    /// Whether `-f` was given. Daemonization is delegated to the service
    /// manager either way; the flag is accepted for compatibility.
    pub fn foreground(&self) -> bool {
        self.foreground
    }

    /// Ceiling on concurrently running jobs.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }
}

/// Validation failures from [`SettingsBuilder::build`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("poll interval must be greater than zero")]
    PollIntervalOutOfRange,

    #[error("retry interval must be at least 10 seconds")]
    RetryIntervalOutOfRange,

    #[error("no connection string specified")]
    MissingConnectString,

    #[error("the maximum number of concurrent jobs must be greater than zero")]
    WorkerCeilingOutOfRange,
}

/// Builder for [`Settings`].
#[derive(Debug, Clone)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    fn new(connect_string: impl Into<String>) -> Self {
        Self {
            settings: Settings {
                connect_string: connect_string.into(),
                poll_interval: Duration::from_secs(5),
                retry_interval: Duration::from_secs(30),
                verbosity: LogVerbosity::Error,
                log_file: None,
                foreground: false,
                max_concurrent_jobs: 16,
            },
        }
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.settings.poll_interval = value;
        self
    }

    pub fn retry_interval(mut self, value: Duration) -> Self {
        self.settings.retry_interval = value;
        self
    }

    pub fn verbosity(mut self, value: LogVerbosity) -> Self {
        self.settings.verbosity = value;
        self
    }

    pub fn log_file(mut self, value: Option<PathBuf>) -> Self {
        self.settings.log_file = value;
        self
    }

    pub fn foreground(mut self, value: bool) -> Self {
        self.settings.foreground = value;
        self
    }

    pub fn max_concurrent_jobs(mut self, value: usize) -> Self {
        self.settings.max_concurrent_jobs = value;
        self
    }

    pub fn build(self) -> Result<Settings, SettingsError> {
        let s = &self.settings;
        if s.connect_string.trim().is_empty() {
            return Err(SettingsError::MissingConnectString);
        }
        if s.poll_interval.is_zero() {
            return Err(SettingsError::PollIntervalOutOfRange);
        }
        if s.retry_interval < Duration::from_secs(10) {
            return Err(SettingsError::RetryIntervalOutOfRange);
        }
        if s.max_concurrent_jobs == 0 {
            return Err(SettingsError::WorkerCeilingOutOfRange);
        }
        Ok(self.settings)
    }
}
