use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize console logging, plus file logging when `log_file` is set.
///
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging(log_file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let Some(log_path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    truncate_if_needed(log_path)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(io::stdout).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!("Logging to file: {}", log_path.display());
    Ok(Some(guard))
}

/// Start over once the log file grows past MAX_LOG_SIZE
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        File::create(log_path)?;
    }
    Ok(())
}
