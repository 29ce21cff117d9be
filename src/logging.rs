//! Logging setup on tracing + tracing-subscriber
//!
//! Console output (compact or JSON), an optional rolling log file written
//! through a non-blocking appender, and `RUST_LOG` directives on top.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Keeps the file writer alive; drop it last to flush buffered lines
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = determine_level(settings, verbose, quiet);
    let env_filter = build_env_filter(level)?;
    let console_layer = build_console_layer(settings.json_format);

    let (file_layer, file_guard) = match settings.file.as_deref() {
        Some(log_file) => {
            let (layer, guard) = build_file_layer(
                log_file,
                settings.max_file_size_mb,
                settings.max_files,
                settings.json_format,
            )?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {e}")))?;

    tracing::debug!(
        level = %level,
        file = ?settings.file,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// `-q` wins over `-v`; otherwise `-v`/`-vv` raise the configured level
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn directive(text: &str) -> Result<Directive> {
    text.parse()
        .map_err(|e| Error::Config(format!("Invalid log directive '{text}': {e}")))
}

/// Base level from flags/config, `RUST_LOG` if set, quiet WebSocket internals
fn build_env_filter(level: Level) -> Result<EnvFilter> {
    let base = level.to_string().to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&base))
        .add_directive(directive(&format!("collab_coordinator={base}"))?)
        .add_directive(directive("tokio_tungstenite=warn")?)
        .add_directive(directive("tungstenite=warn")?);

    Ok(filter)
}

fn build_console_layer<S>(json_format: bool) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false)
                .with_writer(std::io::stderr),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
    }
}

/// Rolling file layer; small size limits rotate hourly, otherwise daily
fn build_file_layer<S>(
    log_file: &str,
    max_size_mb: u64,
    max_files: u32,
    json_format: bool,
) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory).map_err(|source| Error::IoWrite {
        path: directory.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("collab");

    let rotation = if max_size_mb > 0 && max_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    };

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file_name)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to create log file appender: {e}")))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer: BoxedLayer<S> = if json_format {
        Box::new(fmt::layer().json().with_writer(writer).with_ansi(false))
    } else {
        Box::new(
            fmt::layer()
                .with_writer(writer)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(false),
        )
    };

    Ok((layer, guard))
}

/// Minimal console logging for short-lived commands
pub fn init_simple(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(level.to_string().to_lowercase()))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {e}")))
}
