//! tracing subscriber setup.
//!
//! Every invocation appends to a daily-rolled file under `<planning-dir>/logs/`.
//! `--verbose` adds a plain stderr layer; it carries no ANSI codes or
//! timestamps so callers parsing the final `<category>: <message>` line can
//! still pick it out.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FILE_PREFIX: &str = "tasker.log";

/// Build the filter, falling back to `warn` when the directive does not parse.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber.
///
/// Returns the file writer's guard, which must be held until exit so buffered
/// lines get flushed. `None` means the log directory could not be created; in
/// that case only the stderr layer (if requested) is installed.
pub fn init(log_dir: &Path, level: &str, verbose: bool) -> Option<WorkerGuard> {
    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_filter(filter_for(level))
    });

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter_for(level));
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    // A second init in the same process (tests) is not an error.
    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();

    guard
}
