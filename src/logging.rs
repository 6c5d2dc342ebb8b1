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

//! Log sink initialization and the agent's line format.
//!
//! Every record is a single line:
//!
//! ```text
//! <weekday> <month> <day> <hh:mm:ss> <year> <LEVEL>: <message>
//! ```
//!
//! with level one of DEBUG, WARNING or ERROR. Messages emitted under the
//! [`STARTUP_TARGET`] are admitted at WARNING regardless of the configured
//! verbosity, so connection-retry notices stay visible even at the default
//! errors-only level.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

use crate::settings::{LogVerbosity, Settings};

/// Target for messages that must reach the log even when the verbosity
/// filter would normally drop warnings.
pub const STARTUP_TARGET: &str = "startup";

/// Event formatter producing the agent's one-line record layout.
struct AgentFormat;

impl<S, N> FormatEvent<S, N> for AgentFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARNING",
            _ => "DEBUG",
        };

        write!(
            writer,
            "{} {}: ",
            chrono::Local::now().format("%a %b %e %H:%M:%S %Y"),
            level
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn level_filter(verbosity: LogVerbosity) -> LevelFilter {
    match verbosity {
        LogVerbosity::Error => LevelFilter::ERROR,
        LogVerbosity::Warning => LevelFilter::WARN,
        LogVerbosity::Debug => LevelFilter::DEBUG,
    }
}

fn make_writer(log_file: Option<&Path>) -> std::io::Result<BoxMakeWriter> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BoxMakeWriter::new(std::sync::Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
    }
}

/// Installs the global subscriber according to the settings.
///
/// Fails only when the `-s` log file cannot be opened.
pub fn init(settings: &Settings) -> std::io::Result<()> {
    let filter = Targets::new()
        .with_default(level_filter(settings.verbosity()))
        .with_target(STARTUP_TARGET, LevelFilter::WARN);

    let writer = make_writer(settings.log_file().map(|p| p.as_path()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(AgentFormat)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
