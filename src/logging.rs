//! Logging setup.
//!
//! Progress is always echoed to stderr. On Linux the events also go to
//! systemd-journald when it is reachable; otherwise they are appended to a
//! daily rolling file under the given log directory.
//!
//! The level is read from `HARVEST_LOG` (e.g. `HARVEST_LOG=debug`), default
//! `info`.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("HARVEST_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber. Call once at startup.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(console)
                .with(journald_layer)
                .try_init()?;

            tracing::debug!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taxon-harvest")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "taxon-harvest.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The worker flushes on drop, so it has to outlive main.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::debug!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
