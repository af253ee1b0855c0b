//! Logging configuration and initialization.
//!
//! Sets up the tracing subscriber from the `logging` configuration section.
//! Output goes to stdout, stderr or an append-only file through a
//! non-blocking writer.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Dependency targets kept at `warn` unless dependency tracing is requested.
const NOISY_TARGETS: &[&str] = &["pingora_core", "pingora_proxy", "h2", "hyper", "rustls"];

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// `RUST_LOG`, when set, takes precedence over both `config.level` and
/// `level_override`.
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<String>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = parse_level(level_override.as_deref().unwrap_or(&config.level));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level, trace_deps)));

    let (writer, guard) = match config.output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_appender::non_blocking(file)
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(config, BoxMakeWriter::new(writer)))
        .init();

    Ok(guard)
}

/// Builds the formatting layer for the configured format, honouring
/// `timestamps` and `include_target` for every format.
pub fn format_layer<S>(
    config: &LoggingConfig,
    writer: BoxMakeWriter,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let target = config.include_target;
    match (config.format, config.timestamps) {
        (LogFormat::Json, true) => fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(target)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Json, false) => fmt::layer()
            .json()
            .without_time()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(target)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Compact, true) => fmt::layer()
            .compact()
            .with_target(target)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Compact, false) => fmt::layer()
            .compact()
            .without_time()
            .with_target(target)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Pretty, true) => fmt::layer()
            .pretty()
            .with_target(target)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Pretty, false) => fmt::layer()
            .pretty()
            .without_time()
            .with_target(target)
            .with_writer(writer)
            .boxed(),
    }
}

/// Builds the default filter directives for `level`.
pub fn filter_directives(level: Level, trace_deps: bool) -> String {
    let level = level.to_string().to_lowercase();
    if trace_deps {
        return level;
    }

    let mut directives = level;
    for target in NOISY_TARGETS {
        directives.push_str(&format!(",{target}=warn"));
    }
    directives
}

/// Parses a log level string to a tracing Level.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
