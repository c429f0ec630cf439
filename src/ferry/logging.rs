use std::{io, path::PathBuf, str::FromStr};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ferry::config;

/// Libraries whose debug output drowns the tunnel's own; they stay at
/// `warn` unless `trace` is asked for.
const CHATTY_DEPS: &[&str] = &["quinn", "quinn_proto", "rustls", "tokio_yamux", "hyper"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => anyhow::bail!("logging: unknown format {other:?} (expected json|text)"),
        }
    }
}

/// Where log lines go.
///
/// `daily:<dir>` rotates `ferry.log` in `<dir>` at midnight UTC; anything
/// else that is not a stream name is a file appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
    Daily(PathBuf),
}

impl LogOutput {
    fn is_terminal_stream(&self) -> bool {
        matches!(self, LogOutput::Stderr | LogOutput::Stdout)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        Ok(match s {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            _ => match s.strip_prefix("daily:") {
                Some(dir) if dir.trim().is_empty() => {
                    anyhow::bail!("logging: daily output needs a directory")
                }
                Some(dir) => LogOutput::Daily(PathBuf::from(dir.trim())),
                None => LogOutput::File(PathBuf::from(s)),
            },
        })
    }
}

/// Default filter when `RUST_LOG` is unset.
pub fn default_directive(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "warn" | "error") => l.to_string(),
        _ => "info".to_string(),
    };
    if level == "trace" || level == "warn" || level == "error" {
        return level;
    }
    let mut d = level;
    for dep in CHATTY_DEPS {
        d.push_str(&format!(",{dep}=warn"));
    }
    d
}

/// Keeps the background writer alive; dropping it flushes queued lines.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let format: LogFormat = logging.format.parse()?;
    let output: LogOutput = logging.output.parse()?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(default_directive(&logging.level))
            .context("logging: init filter")?,
    };

    let ansi = format == LogFormat::Text && output.is_terminal_stream();
    let (writer, guard) = make_writer(&output)?;
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Text => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(output: &LogOutput) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    Ok(match output {
        LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
        LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
        LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
        LogOutput::Daily(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("logging: mkdir {}", dir.display()))?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "ferry.log"))
        }
        LogOutput::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
    })
}
