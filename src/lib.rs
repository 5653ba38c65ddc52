pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::AppState;
pub use application::projection::{ChartSeries, FutureHorizon, SeriesOptions};
pub use application::refresh::{RefreshController, RefreshOutcome, RefreshTrigger};
pub use domain::models::{Dose, Medication, Schedule, Settings};
pub use infrastructure::error::InfraError;

use application::bootstrap::bootstrap_workspace;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    pub workspace_root: String,
    pub database_path: String,
    pub logs_dir: String,
}

fn workspace_root(root: Option<String>) -> Result<PathBuf, String> {
    match root {
        Some(path) => Ok(PathBuf::from(path)),
        None => std::env::current_dir().map_err(|error| error.to_string()),
    }
}

pub fn bootstrap(root: Option<String>) -> Result<BootstrapResponse, String> {
    let result = bootstrap_workspace(&workspace_root(root)?).map_err(|error| error.to_string())?;
    Ok(BootstrapResponse {
        workspace_root: result.workspace_root.display().to_string(),
        database_path: result.database_path.display().to_string(),
        logs_dir: result.logs_dir.display().to_string(),
    })
}

pub async fn open(root: Option<String>) -> Result<AppState, String> {
    AppState::open(workspace_root(root)?)
        .await
        .map_err(|error| error.to_string())
}
