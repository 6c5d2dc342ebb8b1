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

//! The pgsteward binary: CLI parsing, logging setup, and the fatal-error
//! exit path. Daemonization is delegated to the service manager.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, warn};

use pgsteward::logging::{self, STARTUP_TARGET};
use pgsteward::settings::{LogVerbosity, Settings};
use pgsteward::{AgentError, Scheduler};

#[derive(Parser)]
#[command(
    name = "pgsteward",
    disable_version_flag = true,
    about = "PostgreSQL job scheduling agent",
    long_about = "Polls the pgagent schema for due jobs and runs their SQL and script steps, \
                  recording execution history back into the database."
)]
struct Cli {
    /// Display version info and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Run in the foreground (daemonization is delegated to the service
    /// manager; the flag is accepted for compatibility)
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Poll time interval in seconds (must be > 0)
    #[arg(short = 't', long = "poll-interval", value_name = "SECS", default_value_t = 5)]
    poll_interval: u64,

    /// Retry period after connection abort in seconds (must be >= 10)
    #[arg(short = 'r', long = "retry-interval", value_name = "SECS", default_value_t = 30)]
    retry_interval: u64,

    /// Log file (messages are logged to stdout if not specified)
    #[arg(short = 's', long = "log-file", value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Logging verbosity (ERROR=0, WARNING=1, DEBUG=2)
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", default_value_t = 0)]
    log_level: u8,

    /// Maximum number of concurrently running jobs
    #[arg(long = "max-jobs", value_name = "N", default_value_t = 16)]
    max_jobs: usize,

    /// keyword=value connection string for the database carrying the
    /// pgagent schema
    #[arg(value_name = "CONNECT-STRING", trailing_var_arg = true)]
    connect_string: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("PostgreSQL Scheduling Agent");
        println!("Version: {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let settings = match build_settings(&cli) {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("pgsteward: {}", message);
            eprintln!("Try 'pgsteward --help' for usage.");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&settings) {
        eprintln!("Can not open the logfile: {}", e);
        return ExitCode::FAILURE;
    }

    match run_agent(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_settings(cli: &Cli) -> Result<Settings, String> {
    let verbosity = LogVerbosity::from_level(cli.log_level)
        .ok_or_else(|| format!("invalid log level {} (expected 0, 1 or 2)", cli.log_level))?;

    // The connection string may arrive as several shell words.
    let connect_string = cli.connect_string.join(" ");

    Settings::builder(connect_string)
        .poll_interval(Duration::from_secs(cli.poll_interval))
        .retry_interval(Duration::from_secs(cli.retry_interval))
        .verbosity(verbosity)
        .log_file(cli.log_file.clone())
        .foreground(cli.foreground)
        .max_concurrent_jobs(cli.max_jobs)
        .build()
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn run_agent(settings: Settings) -> Result<(), AgentError> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    let scheduler = Scheduler::new(settings, hostname);
    let shutdown = scheduler.shutdown_signal();

    tokio::spawn(async move {
        shutdown_requested().await;
        warn!(target: STARTUP_TARGET, "Shutdown requested, stopping the scheduler");
        shutdown.signal();
    });

    scheduler.run().await
}

/// Resolves when the process is asked to stop (SIGINT/SIGTERM on POSIX,
/// ctrl-c elsewhere).
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
