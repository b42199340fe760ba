use crate::{config::LoggingConfig, DmsError, Result};
use std::path::Path;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging for the control plane.
///
/// Console output goes to stderr; the rolling file log carries the same
/// events, optionally as JSON. The returned guard must be held for the
/// process lifetime or buffered log lines are lost.
pub fn init_tracing(config: &LoggingConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = Path::new(&config.file);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DmsError::FileSystem {
            path: parent.display().to_string(),
            message: format!("Failed to create log directory: {}", e),
        })?;
    }

    let file_appender = rolling::daily(
        log_path.parent().unwrap_or_else(|| Path::new(".")),
        log_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("dms.log"),
    );

    let (non_blocking, guard) = non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true),
    );

    if config.json_format {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true),
            )
            .init();
    } else {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true),
            )
            .init();
    }

    tracing::info!(
        component = "logging",
        level = %config.level,
        json = config.json_format,
        "structured logging initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_logging_initialization() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("test-dms.log");

        let config = LoggingConfig {
            level: "info".to_string(),
            file: log_file.display().to_string(),
            json_format: true,
        };

        // A second init in the same process fails because a global
        // subscriber may already be set; only the directory handling and
        // appender setup are asserted here.
        let result = init_tracing(&config);
        if result.is_ok() {
            tracing::info!("logging test entry");
        }
        assert!(log_file.parent().unwrap().exists());
    }
}
