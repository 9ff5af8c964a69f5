//! Per-site log file
//!
//! Mutating actions append everything they log, including captured
//! subprocess output, to `<data_dir>/logs/<slug>.log`. The file is written
//! through a non-rotating `tracing-appender` and read back by the deploy-log
//! query.

use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

/// Returned by the deploy-log query before a site has logged anything
pub const WAITING_FOR_DEPLOY: &str = "Waiting for deployment to start...";

/// Directory holding the per-site logs
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Path of a site's log file
pub fn log_path(data_dir: &Path, slug: &str) -> PathBuf {
    log_dir(data_dir).join(format!("{}.log", slug))
}

/// Open a site's log for appending.
///
/// Lines are written on a background thread; drop the guard to flush them.
pub fn writer(data_dir: &Path, slug: &str) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(format!("{}.log", slug))
        .build(log_dir(data_dir))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Contents of a site's log, or `None` if it has never been written
pub fn read(data_dir: &Path, slug: &str) -> io::Result<Option<String>> {
    match std::fs::read_to_string(log_path(data_dir, slug)) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
