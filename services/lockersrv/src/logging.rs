//! Logging setup for the locker service
//!
//! Console and the optional daily rolling file share one line format. ANSI
//! styling only touches the field names on the console.

use chrono::SecondsFormat;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;
use crate::error::{LockerError, Result};

/// One line per event: `timestamp [LEVEL] target: message fields`
///
/// `2026-03-02T00:50:44.809123Z [INFO] lockersrv::session: Connected to controller 10.0.0.7:4001`
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{} [{}] {}: ",
            chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            metadata.level().as_str(),
            metadata.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directive: `RUST_LOG` wins, then the explicit override, then the config level
fn filter_directive(config: &LoggingConfig, level_override: Option<&str>) -> String {
    if let Ok(env_str) = std::env::var("RUST_LOG") {
        if !env_str.trim().is_empty() {
            return env_str;
        }
    }
    level_override.unwrap_or(&config.level).to_string()
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the lifetime of the process.
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<&str>,
    ansi: bool,
) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(config, level_override);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| LockerError::config(format!("Invalid log level '{}': {}", directive, e)))?;

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_ansi(ansi)
            .event_format(LineFormat)
            .boxed()
    });

    let (file_layer, guard) = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.file_prefix));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(LineFormat)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LockerError::config(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}
