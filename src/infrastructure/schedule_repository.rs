use crate::domain::models::{Schedule, ScheduleFrequency};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{parse_timestamp, with_connection};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SELECT_SCHEDULE_COLUMNS: &str = "SELECT id, medication_id, start_datetime_iso, timezone, dose_mg,
        frequency, interval_days, enabled, created_at, updated_at FROM schedules";

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Schedule>, InfraError>;
    async fn get(&self, schedule_id: &str) -> Result<Option<Schedule>, InfraError>;
    async fn upsert(&self, schedule: &Schedule) -> Result<(), InfraError>;
    async fn delete(&self, schedule_id: &str) -> Result<bool, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteScheduleRepository {
    db_path: PathBuf,
}

impl SqliteScheduleRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

struct ScheduleRow {
    id: String,
    medication_id: String,
    start_datetime_iso: String,
    timezone: String,
    dose_mg: f64,
    frequency: String,
    interval_days: i32,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            medication_id: row.get(1)?,
            start_datetime_iso: row.get(2)?,
            timezone: row.get(3)?,
            dose_mg: row.get(4)?,
            frequency: row.get(5)?,
            interval_days: row.get(6)?,
            enabled: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_schedule(self) -> Result<Schedule, InfraError> {
        let frequency = ScheduleFrequency::parse(&self.frequency).ok_or_else(|| {
            InfraError::InvalidRecord(format!(
                "unknown schedules.frequency '{}' on {}",
                self.frequency, self.id
            ))
        })?;
        Ok(Schedule {
            created_at: parse_timestamp(&self.created_at, "schedules.created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "schedules.updated_at")?,
            id: self.id,
            medication_id: self.medication_id,
            start_datetime_iso: self.start_datetime_iso,
            timezone: self.timezone,
            dose_mg: self.dose_mg,
            frequency,
            interval: self.interval_days,
            enabled: self.enabled,
        })
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn list(&self) -> Result<Vec<Schedule>, InfraError> {
        with_connection(&self.db_path, |connection| {
            let mut statement =
                connection.prepare(&format!("{SELECT_SCHEDULE_COLUMNS} ORDER BY created_at, id"))?;
            let rows = statement
                .query_map([], ScheduleRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ScheduleRow::into_schedule).collect()
        })
        .await
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<Schedule>, InfraError> {
        let schedule_id = schedule_id.to_string();
        with_connection(&self.db_path, move |connection| {
            connection
                .query_row(
                    &format!("{SELECT_SCHEDULE_COLUMNS} WHERE id = ?1"),
                    params![schedule_id],
                    ScheduleRow::read,
                )
                .optional()?
                .map(ScheduleRow::into_schedule)
                .transpose()
        })
        .await
    }

    async fn upsert(&self, schedule: &Schedule) -> Result<(), InfraError> {
        let schedule = schedule.clone();
        with_connection(&self.db_path, move |connection| {
            connection.execute(
                "INSERT INTO schedules (
                   id, medication_id, start_datetime_iso, timezone, dose_mg, frequency,
                   interval_days, enabled, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                   medication_id = excluded.medication_id,
                   start_datetime_iso = excluded.start_datetime_iso,
                   timezone = excluded.timezone,
                   dose_mg = excluded.dose_mg,
                   frequency = excluded.frequency,
                   interval_days = excluded.interval_days,
                   enabled = excluded.enabled,
                   updated_at = excluded.updated_at",
                params![
                    schedule.id,
                    schedule.medication_id,
                    schedule.start_datetime_iso,
                    schedule.timezone,
                    schedule.dose_mg,
                    schedule.frequency.as_str(),
                    schedule.interval,
                    schedule.enabled,
                    schedule.created_at.to_rfc3339(),
                    schedule.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, schedule_id: &str) -> Result<bool, InfraError> {
        let schedule_id = schedule_id.to_string();
        with_connection(&self.db_path, move |connection| {
            let removed =
                connection.execute("DELETE FROM schedules WHERE id = ?1", params![schedule_id])?;
            Ok(removed > 0)
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryScheduleRepository {
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl InMemoryScheduleRepository {
    pub fn with_schedules(schedules: impl IntoIterator<Item = Schedule>) -> Self {
        Self {
            schedules: Mutex::new(
                schedules
                    .into_iter()
                    .map(|schedule| (schedule.id.clone(), schedule))
                    .collect(),
            ),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Schedule>>, InfraError> {
        self.schedules
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("schedule store lock poisoned: {error}")))
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn list(&self) -> Result<Vec<Schedule>, InfraError> {
        let schedules = self.lock()?;
        let mut listed: Vec<Schedule> = schedules.values().cloned().collect();
        listed.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(listed)
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<Schedule>, InfraError> {
        Ok(self.lock()?.get(schedule_id).cloned())
    }

    async fn upsert(&self, schedule: &Schedule) -> Result<(), InfraError> {
        let mut schedules = self.lock()?;
        let created_at = schedules
            .get(&schedule.id)
            .map_or(schedule.created_at, |existing| existing.created_at);
        let mut stored = schedule.clone();
        stored.created_at = created_at;
        schedules.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn delete(&self, schedule_id: &str) -> Result<bool, InfraError> {
        Ok(self.lock()?.remove(schedule_id).is_some())
    }
}
