//! tracing subscriber setup.

use std::io::IsTerminal;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSection};

static REQFORGE_LOG_ENV_VAR: &str = "REQFORGE_LOG";

/// Install the global subscriber. Safe to call more than once; only the first
/// call has an effect. Hold the returned guard for the life of the process
/// when file logging is enabled, or buffered lines are lost on exit.
pub fn init(config: &LoggingSection) -> Option<WorkerGuard> {
    static INIT: Once = Once::new();
    let mut guard = None;
    INIT.call_once(|| {
        let (file_layer, file_guard) = match &config.dir {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "reqforge.log");
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false);
                (Some(layer), Some(file_guard))
            }
            None => (None, None),
        };
        guard = file_guard;

        let stderr_layer = match config.format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .boxed(),
        };

        let (filter, level) = env_filter_and_log_level();
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        tracing::debug!("log level: {}", level);
    });
    guard
}

/// `RUST_LOG` directives win; otherwise `REQFORGE_LOG` (default `info`)
/// sets the level for this crate while dependencies stay at `warn`.
fn env_filter_and_log_level() -> (EnvFilter, String) {
    let level = std::env::var(REQFORGE_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

    let builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    let mut filter = builder.parse_lossy(&directives);
    if !directives.contains("reqforge=")
        && let Ok(directive) = format!("reqforge={}", level).parse()
    {
        filter = filter.add_directive(directive);
    }
    (filter, level)
}
