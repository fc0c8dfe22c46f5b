//! Set up `tracing` output for the proxy.
//!
//! There are two layers: a console layer that's always present, and an
//! optional rotating logfile layer. Both log at the same filter level
//! unless overridden; matched line contents are wrapped in
//! [`safelog::sensitive`] at the call site (see [`crate::session`]) so they
//! only appear when `logging.log_sensitive_information` has disabled safe
//! logging for the process.

use std::str::FromStr;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, registry, Layer};

use crate::cfg::LoggingConfig;

/// Resources that must stay alive for the lifetime of the process for
/// logging to keep working; drop order matters, so keep this alive in
/// `main` until shutdown.
#[must_use]
pub struct LogGuard {
    #[allow(dead_code)]
    file_guard: Option<WorkerGuard>,
    #[allow(dead_code)]
    safelog_guard: Option<safelog::Guard>,
}

/// Install the global `tracing` subscriber per `config`.
///
/// `cli_level`, if given (from `-l`/`--log-level`), overrides
/// `config.console` for the console layer only.
pub fn setup(config: &LoggingConfig, cli_level: Option<&str>) -> Result<LogGuard> {
    let console_filter = Targets::from_str(cli_level.unwrap_or(&config.console))
        .with_context(|| "invalid logging filter directive")?;
    let console_layer = fmt::Layer::default()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let registry = registry().with(console_layer);

    let (file_layer, file_guard) = match &config.file {
        Some(path) => {
            let (layer, guard) = file_layer(path, &config.console)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let registry = registry.with(file_layer);
    registry.init();

    let safelog_guard = if config.log_sensitive_information {
        match safelog::disable_safe_logging() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("unable to disable safe logging: {e}");
                None
            }
        }
    } else {
        None
    };

    Ok(LogGuard {
        file_guard,
        safelog_guard,
    })
}

/// Build the rotating-logfile layer and its flush guard.
fn file_layer<S>(
    path: &std::path::Path,
    filter_directives: &str,
) -> Result<(impl Layer<S> + Send + Sync, WorkerGuard)>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("logging.file has no file name: {}", path.display()))?;
    let appender = tracing_appender::rolling::daily(dir.unwrap_or_else(|| std::path::Path::new(".")), file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let filter = Targets::from_str(filter_directives).with_context(|| "invalid logging filter directive")?;
    let layer = fmt::Layer::default()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(filter);
    Ok((layer, guard))
}
