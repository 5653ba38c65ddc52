use crate::infrastructure::error::InfraError;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::info;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "dosecurve";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();

struct LoggingState {
    level: &'static str,
    log_dir: PathBuf,
    _logger: LoggerHandle,
}

pub fn init_logging(level: &str, log_dir: &Path) -> Result<(), InfraError> {
    let level = normalize_level(level)?;
    if !log_dir.is_absolute() {
        return Err(InfraError::InvalidConfig(format!(
            "log directory must be absolute, got `{}`",
            log_dir.display()
        )));
    }

    let state = LOGGING_STATE.get_or_try_init(|| -> Result<LoggingState, InfraError> {
        std::fs::create_dir_all(log_dir)?;
        let logger = Logger::try_with_str(level)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid log level `{level}`: {error}")))?
            .log_to_file(
                FileSpec::default()
                    .directory(log_dir)
                    .basename(LOG_FILE_BASENAME),
            )
            .rotate(
                Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(MAX_LOG_FILES),
            )
            .write_mode(WriteMode::BufferAndFlush)
            .append()
            .format_for_files(flexi_logger::detailed_format)
            .start()
            .map_err(|error| InfraError::InvalidConfig(format!("failed to start logger: {error}")))?;

        info!(
            "event=logging_init module=logging status=ok level={} log_dir={} version={}",
            level,
            log_dir.display(),
            env!("CARGO_PKG_VERSION")
        );

        Ok(LoggingState {
            level,
            log_dir: log_dir.to_path_buf(),
            _logger: logger,
        })
    })?;

    if state.log_dir != log_dir {
        return Err(InfraError::InvalidConfig(format!(
            "logging already initialized at `{}`; refusing to switch to `{}`",
            state.log_dir.display(),
            log_dir.display()
        )));
    }
    if state.level != level {
        return Err(InfraError::InvalidConfig(format!(
            "logging already initialized with level `{}`; refusing to switch to `{level}`",
            state.level
        )));
    }
    Ok(())
}

pub fn logging_status() -> Option<(&'static str, PathBuf)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.level, state.log_dir.clone()))
}

pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

pub(crate) fn normalize_level(level: &str) -> Result<&'static str, InfraError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(InfraError::InvalidConfig(format!(
            "unsupported log level `{other}`; expected trace|debug|info|warn|error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_level_accepts_known_values() {
        assert_eq!(normalize_level(" WARNING ").expect("warning"), "warn");
        assert_eq!(normalize_level("Info").expect("info"), "info");
        assert!(normalize_level("verbose").is_err());
    }

    #[test]
    fn relative_directories_are_rejected() {
        let error = init_logging("info", Path::new("logs")).expect_err("relative");
        assert!(error.to_string().contains("absolute"));
    }

    #[test]
    fn init_is_idempotent_and_rejects_conflicts() {
        let root = tempfile::tempdir().expect("tempdir").keep();
        let log_dir = root.join("logs");
        let other = root.join("other-logs");

        if init_logging("info", &log_dir).is_err() {
            // Another test in this process already owns the logger.
            let (_, active_dir) = logging_status().expect("logger active");
            assert_ne!(active_dir, log_dir);
            return;
        }

        init_logging("info", &log_dir).expect("same config");
        assert!(init_logging("debug", &log_dir).is_err());
        assert!(init_logging("info", &other).is_err());
        assert_eq!(logging_status(), Some(("info", log_dir)));
    }
}
