//! Process-wide tracing setup.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::errors::{ProvisionError, ProvisionResult};
use crate::runtime::constants::filenames;
use crate::runtime::layout::FilesystemLayout;

/// Keeps the background log writer alive for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install a subscriber writing to a daily rolling file under `<home>/logs`.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Only the first call
/// in a process installs anything. If the embedding application already set
/// a global subscriber, that one is left in place.
pub fn init_logging_for(layout: &FilesystemLayout) -> ProvisionResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        ProvisionError::Internal(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let appender = tracing_appender::rolling::daily(&logs_dir, filenames::LOG_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        let _ = LOG_GUARD.set(guard);
        tracing::info!(logs_dir = %logs_dir.display(), "Logging initialized");
    }
    Ok(())
}
