use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

use crate::Error;
use crate::Result;

/// Log file written under the directory passed to [`init_observability`]
pub const LOG_FILE_NAME: &str = "fanout.log";

/// Installs the global subscriber writing to `<log_dir>/fanout.log`, filtered by
/// `RUST_LOG`. Keep the returned guard alive or buffered lines are lost.
pub fn init_observability(log_dir: &Path) -> Result<WorkerGuard> {
    let log_file = open_file_for_append(&log_dir.join(LOG_FILE_NAME))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(base_subscriber)
        .try_init()
        .map_err(|e| Error::Fatal(format!("failed to install tracing subscriber: {e}")))?;

    Ok(guard)
}

pub(crate) fn open_file_for_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    Ok(file)
}
