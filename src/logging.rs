//! Tracing setup shared by both binaries: detailed logs go to a rolling
//! daily file (or stderr), and a clean colorized layer writes to stdout
//! unless quiet mode is on.

use anyhow::Result;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// The entire log line is colored according to its severity, without extra
/// metadata like timestamps or level tags, to keep user-facing output clean.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
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
        // Buffer the formatted fields so color applies to the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{colored_output}")
    }
}

/// Map a configured level name to a filter; unknown names fall back to info
pub fn level_from_str(level: &str) -> LevelFilter {
    match level {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Map `-v` occurrence counts to a filter
pub fn level_from_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Initialize the global subscriber.
///
/// `log_file` may be a path, the special value `stderr`, or `None` for the
/// default daily-rotated file next to the process. The returned guard must be
/// kept alive for the life of the program or file logging stops.
pub fn init(
    level: LevelFilter,
    quiet: bool,
    log_file: Option<&str>,
    default_file: &str,
) -> Result<Option<WorkerGuard>> {
    let guard;
    let detailed_layer;

    if let Some("stderr") = log_file {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(level)
            .boxed();
        guard = None;
    } else {
        let appender = match log_file {
            Some(path_str) => {
                let path = std::path::Path::new(path_str);
                let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let name = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new(default_file));
                tracing_appender::rolling::daily(dir, name)
            }
            None => tracing_appender::rolling::daily(".", default_file),
        };
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_layer = if quiet {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(level),
        )
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}
