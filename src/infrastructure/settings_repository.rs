use crate::domain::models::Settings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::with_connection;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn load(&self) -> Result<Option<Settings>, InfraError>;
    async fn save(&self, settings: &Settings) -> Result<(), InfraError>;

    async fn load_or(&self, fallback: Settings) -> Result<Settings, InfraError> {
        Ok(self.load().await?.unwrap_or(fallback))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsRepository {
    db_path: PathBuf,
}

impl SqliteSettingsRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn load(&self) -> Result<Option<Settings>, InfraError> {
        with_connection(&self.db_path, |connection| {
            let settings = connection
                .query_row(
                    "SELECT default_timezone, chart_sample_minutes, default_lookback_days,
                            default_future_days
                     FROM settings WHERE id = 'singleton'",
                    [],
                    |row| {
                        Ok(Settings {
                            default_timezone: row.get(0)?,
                            chart_sample_minutes: row.get(1)?,
                            default_lookback_days: row.get(2)?,
                            default_future_days: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(settings)
        })
        .await
    }

    async fn save(&self, settings: &Settings) -> Result<(), InfraError> {
        let settings = settings.clone();
        with_connection(&self.db_path, move |connection| {
            connection.execute(
                "INSERT INTO settings (
                   id, default_timezone, chart_sample_minutes, default_lookback_days,
                   default_future_days
                 ) VALUES ('singleton', ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   default_timezone = excluded.default_timezone,
                   chart_sample_minutes = excluded.chart_sample_minutes,
                   default_lookback_days = excluded.default_lookback_days,
                   default_future_days = excluded.default_future_days",
                params![
                    settings.default_timezone,
                    settings.chart_sample_minutes,
                    settings.default_lookback_days,
                    settings.default_future_days,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettingsRepository {
    settings: Mutex<Option<Settings>>,
}

impl InMemorySettingsRepository {
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(Some(settings)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Settings>>, InfraError> {
        self.settings
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("settings lock poisoned: {error}")))
    }
}

#[async_trait]
impl SettingsRepository for InMemorySettingsRepository {
    async fn load(&self) -> Result<Option<Settings>, InfraError> {
        Ok(self.lock()?.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<(), InfraError> {
        *self.lock()? = Some(settings.clone());
        Ok(())
    }
}
