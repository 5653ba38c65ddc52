use crate::infrastructure::config::{ensure_default_configs, load_configs, ConfigBundle};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::storage::initialize_database;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "dosecurve.sqlite";

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub database_path: PathBuf,
    pub logs_dir: PathBuf,
    pub config: ConfigBundle,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let workspace_root = if workspace_root.is_absolute() {
        workspace_root.to_path_buf()
    } else {
        std::env::current_dir()?.join(workspace_root)
    };
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_configs(&config_dir)?;
    if let Err(error) = init_logging(&config.app.log_level, &logs_dir) {
        warn!("event=bootstrap module=bootstrap status=logging_skipped error={error}");
    }
    initialize_database(&database_path)?;

    info!(
        "event=bootstrap module=bootstrap status=ok workspace={} database={}",
        workspace_root.display(),
        database_path.display()
    );
    Ok(BootstrapResult {
        workspace_root,
        config_dir,
        database_path,
        logs_dir,
        config,
    })
}
