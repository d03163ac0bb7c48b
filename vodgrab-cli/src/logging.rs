use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::error::AppError;

/// Installs the global subscriber. Keep the returned guard alive until exit,
/// it flushes the file writer.
pub fn init_logging(
    verbose: bool,
    quiet: bool,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, AppError> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path.file_name().ok_or_else(|| {
                AppError::InvalidInput(format!("invalid log file path {}", path.display()))
            })?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;

    #[test]
    fn log_file_receives_events_and_init_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("vodgrab.log");

        let guard = init_logging(false, false, Some(&path)).unwrap();
        assert!(guard.is_some());
        info!("chunk writer ready");
        drop(guard);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("chunk writer ready"), "{content}");
        assert!(matches!(
            init_logging(false, false, None),
            Err(AppError::Logging(_))
        ));
    }

    #[test]
    fn log_file_needs_a_file_name() {
        assert!(matches!(
            init_logging(false, false, Some(Path::new("/"))),
            Err(AppError::InvalidInput(_))
        ));
    }
}
