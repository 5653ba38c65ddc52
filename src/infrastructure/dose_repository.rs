use crate::domain::models::{Dose, DoseSource, ScheduledDoseStatus};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{parse_timestamp, with_connection};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const KEY_LOOKUP_CHUNK: usize = 500;

const SELECT_DOSE_COLUMNS: &str = "SELECT id, medication_id, dose_mg, datetime_iso, timezone, created_at,
        updated_at, source, schedule_id, occurrence_key, status FROM doses";

const INSERT_DOSE_SQL: &str = "INSERT INTO doses (
        id, medication_id, dose_mg, datetime_iso, timezone, created_at, updated_at,
        source, schedule_id, occurrence_key, status
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertOutcome {
    pub inserted: usize,
    pub conflicts: Vec<String>,
}

#[async_trait]
pub trait DoseRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Dose>, InfraError>;
    async fn get(&self, dose_id: &str) -> Result<Option<Dose>, InfraError>;
    async fn add(&self, dose: &Dose) -> Result<(), InfraError>;
    async fn update(&self, dose: &Dose) -> Result<(), InfraError>;
    async fn delete(&self, dose_id: &str) -> Result<bool, InfraError>;
    async fn existing_occurrence_keys(&self, keys: &[String]) -> Result<HashSet<String>, InfraError>;
    // Unique-key conflicts are collected per row; the rest of the batch still commits.
    async fn bulk_insert(&self, doses: Vec<Dose>) -> Result<BulkInsertOutcome, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteDoseRepository {
    db_path: PathBuf,
}

impl SqliteDoseRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

struct DoseRow {
    id: String,
    medication_id: String,
    dose_mg: f64,
    datetime_iso: String,
    timezone: String,
    created_at: String,
    updated_at: String,
    source: Option<String>,
    schedule_id: Option<String>,
    occurrence_key: Option<String>,
    status: Option<String>,
}

impl DoseRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            medication_id: row.get(1)?,
            dose_mg: row.get(2)?,
            datetime_iso: row.get(3)?,
            timezone: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            source: row.get(7)?,
            schedule_id: row.get(8)?,
            occurrence_key: row.get(9)?,
            status: row.get(10)?,
        })
    }

    fn into_dose(self) -> Result<Dose, InfraError> {
        let source = match self.source.as_deref() {
            None => None,
            Some(raw) => Some(DoseSource::parse(raw).ok_or_else(|| {
                InfraError::InvalidRecord(format!("unknown doses.source '{raw}' on {}", self.id))
            })?),
        };
        let status = match self.status.as_deref() {
            None => None,
            Some(raw) => Some(ScheduledDoseStatus::parse(raw).ok_or_else(|| {
                InfraError::InvalidRecord(format!("unknown doses.status '{raw}' on {}", self.id))
            })?),
        };
        Ok(Dose {
            created_at: parse_timestamp(&self.created_at, "doses.created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "doses.updated_at")?,
            id: self.id,
            medication_id: self.medication_id,
            dose_mg: self.dose_mg,
            datetime_iso: self.datetime_iso,
            timezone: self.timezone,
            source,
            schedule_id: self.schedule_id,
            occurrence_key: self.occurrence_key,
            status,
        })
    }
}

fn insert_dose(connection: &Connection, dose: &Dose) -> rusqlite::Result<usize> {
    connection.execute(
        INSERT_DOSE_SQL,
        params![
            dose.id,
            dose.medication_id,
            dose.dose_mg,
            dose.datetime_iso,
            dose.timezone,
            dose.created_at.to_rfc3339(),
            dose.updated_at.to_rfc3339(),
            dose.source.map(DoseSource::as_str),
            dose.schedule_id,
            dose.occurrence_key,
            dose.status.map(ScheduledDoseStatus::as_str),
        ],
    )
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn conflict_label(dose: &Dose) -> String {
    dose.occurrence_key.clone().unwrap_or_else(|| dose.id.clone())
}

#[async_trait]
impl DoseRepository for SqliteDoseRepository {
    async fn list(&self) -> Result<Vec<Dose>, InfraError> {
        with_connection(&self.db_path, |connection| {
            let mut statement =
                connection.prepare(&format!("{SELECT_DOSE_COLUMNS} ORDER BY datetime_iso, id"))?;
            let rows = statement
                .query_map([], DoseRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(DoseRow::into_dose).collect()
        })
        .await
    }

    async fn get(&self, dose_id: &str) -> Result<Option<Dose>, InfraError> {
        let dose_id = dose_id.to_string();
        with_connection(&self.db_path, move |connection| {
            let row = connection
                .query_row(
                    &format!("{SELECT_DOSE_COLUMNS} WHERE id = ?1"),
                    params![dose_id],
                    DoseRow::read,
                )
                .optional()?;
            row.map(DoseRow::into_dose).transpose()
        })
        .await
    }

    async fn add(&self, dose: &Dose) -> Result<(), InfraError> {
        let dose = dose.clone();
        with_connection(&self.db_path, move |connection| {
            match insert_dose(connection, &dose) {
                Ok(_) => Ok(()),
                Err(error) if is_unique_violation(&error) => {
                    Err(InfraError::DuplicateOccurrenceKey(conflict_label(&dose)))
                }
                Err(error) => Err(error.into()),
            }
        })
        .await
    }

    async fn update(&self, dose: &Dose) -> Result<(), InfraError> {
        let dose = dose.clone();
        with_connection(&self.db_path, move |connection| {
            let changed = connection
                .execute(
                    "UPDATE doses SET medication_id = ?2, dose_mg = ?3, datetime_iso = ?4,
                       timezone = ?5, updated_at = ?6, source = ?7, schedule_id = ?8,
                       occurrence_key = ?9, status = ?10
                     WHERE id = ?1",
                    params![
                        dose.id,
                        dose.medication_id,
                        dose.dose_mg,
                        dose.datetime_iso,
                        dose.timezone,
                        dose.updated_at.to_rfc3339(),
                        dose.source.map(DoseSource::as_str),
                        dose.schedule_id,
                        dose.occurrence_key,
                        dose.status.map(ScheduledDoseStatus::as_str),
                    ],
                )
                .map_err(|error| {
                    if is_unique_violation(&error) {
                        InfraError::DuplicateOccurrenceKey(conflict_label(&dose))
                    } else {
                        InfraError::from(error)
                    }
                })?;
            if changed == 0 {
                return Err(InfraError::NotFound(format!("dose {}", dose.id)));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, dose_id: &str) -> Result<bool, InfraError> {
        let dose_id = dose_id.to_string();
        with_connection(&self.db_path, move |connection| {
            let removed = connection.execute("DELETE FROM doses WHERE id = ?1", params![dose_id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn existing_occurrence_keys(&self, keys: &[String]) -> Result<HashSet<String>, InfraError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let keys = keys.to_vec();
        with_connection(&self.db_path, move |connection| {
            let mut found = HashSet::new();
            for chunk in keys.chunks(KEY_LOOKUP_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let mut statement = connection.prepare(&format!(
                    "SELECT occurrence_key FROM doses WHERE occurrence_key IN ({placeholders})"
                ))?;
                let rows = statement.query_map(params_from_iter(chunk.iter()), |row| {
                    row.get::<_, String>(0)
                })?;
                for key in rows {
                    found.insert(key?);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn bulk_insert(&self, doses: Vec<Dose>) -> Result<BulkInsertOutcome, InfraError> {
        if doses.is_empty() {
            return Ok(BulkInsertOutcome::default());
        }
        with_connection(&self.db_path, move |connection| {
            let transaction = connection.transaction()?;
            let mut outcome = BulkInsertOutcome::default();
            for dose in &doses {
                match insert_dose(&transaction, dose) {
                    Ok(_) => outcome.inserted += 1,
                    Err(error) if is_unique_violation(&error) => {
                        outcome.conflicts.push(conflict_label(dose));
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            transaction.commit()?;
            Ok(outcome)
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDoseRepository {
    doses: Mutex<HashMap<String, Dose>>,
}

impl InMemoryDoseRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Dose>>, InfraError> {
        self.doses
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("dose store lock poisoned: {error}")))
    }

    fn key_taken(doses: &HashMap<String, Dose>, candidate: &Dose) -> bool {
        let Some(key) = candidate.occurrence_key.as_deref() else {
            return false;
        };
        doses
            .values()
            .any(|existing| existing.id != candidate.id && existing.occurrence_key.as_deref() == Some(key))
    }
}

#[async_trait]
impl DoseRepository for InMemoryDoseRepository {
    async fn list(&self) -> Result<Vec<Dose>, InfraError> {
        let doses = self.lock()?;
        let mut listed: Vec<Dose> = doses.values().cloned().collect();
        listed.sort_by(|left, right| {
            left.datetime_iso
                .cmp(&right.datetime_iso)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(listed)
    }

    async fn get(&self, dose_id: &str) -> Result<Option<Dose>, InfraError> {
        Ok(self.lock()?.get(dose_id).cloned())
    }

    async fn add(&self, dose: &Dose) -> Result<(), InfraError> {
        let mut doses = self.lock()?;
        if Self::key_taken(&doses, dose) {
            return Err(InfraError::DuplicateOccurrenceKey(conflict_label(dose)));
        }
        doses.insert(dose.id.clone(), dose.clone());
        Ok(())
    }

    async fn update(&self, dose: &Dose) -> Result<(), InfraError> {
        let mut doses = self.lock()?;
        if !doses.contains_key(&dose.id) {
            return Err(InfraError::NotFound(format!("dose {}", dose.id)));
        }
        if Self::key_taken(&doses, dose) {
            return Err(InfraError::DuplicateOccurrenceKey(conflict_label(dose)));
        }
        doses.insert(dose.id.clone(), dose.clone());
        Ok(())
    }

    async fn delete(&self, dose_id: &str) -> Result<bool, InfraError> {
        Ok(self.lock()?.remove(dose_id).is_some())
    }

    async fn existing_occurrence_keys(&self, keys: &[String]) -> Result<HashSet<String>, InfraError> {
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let doses = self.lock()?;
        Ok(doses
            .values()
            .filter_map(|dose| dose.occurrence_key.as_deref())
            .filter(|key| wanted.contains(key))
            .map(ToOwned::to_owned)
            .collect())
    }

    async fn bulk_insert(&self, batch: Vec<Dose>) -> Result<BulkInsertOutcome, InfraError> {
        let mut doses = self.lock()?;
        let mut outcome = BulkInsertOutcome::default();
        for dose in batch {
            if Self::key_taken(&doses, &dose) {
                outcome.conflicts.push(conflict_label(&dose));
                continue;
            }
            doses.insert(dose.id.clone(), dose);
            outcome.inserted += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use chrono::{DateTime, Utc};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn scheduled(id: &str, key: &str) -> Dose {
        Dose {
            id: id.to_string(),
            medication_id: "med-1".to_string(),
            dose_mg: 2.5,
            datetime_iso: "2025-01-01T00:00:00.000Z".to_string(),
            timezone: "UTC".to_string(),
            created_at: fixed_time("2025-01-01T00:00:00Z"),
            updated_at: fixed_time("2025-01-01T00:00:00Z"),
            source: Some(DoseSource::Scheduled),
            schedule_id: Some("sch-1".to_string()),
            occurrence_key: Some(key.to_string()),
            status: Some(ScheduledDoseStatus::AssumedTaken),
        }
    }

    fn manual(id: &str) -> Dose {
        Dose {
            source: Some(DoseSource::Manual),
            schedule_id: None,
            occurrence_key: None,
            status: None,
            ..scheduled(id, "unused")
        }
    }

    fn sqlite_repository(dir: &tempfile::TempDir) -> SqliteDoseRepository {
        let path = dir.path().join("doses.sqlite");
        initialize_database(&path).expect("schema");
        SqliteDoseRepository::new(path)
    }

    async fn exercise_bulk_insert_conflicts(repository: &dyn DoseRepository) {
        repository.add(&scheduled("dose-a", "k1")).await.expect("seed");

        let outcome = repository
            .bulk_insert(vec![
                scheduled("dose-b", "k1"),
                scheduled("dose-c", "k2"),
                scheduled("dose-d", "k3"),
                manual("dose-e"),
                manual("dose-f"),
            ])
            .await
            .expect("bulk insert");

        assert_eq!(outcome.inserted, 4);
        assert_eq!(outcome.conflicts, vec!["k1".to_string()]);
        assert_eq!(repository.list().await.expect("list").len(), 5);

        let existing = repository
            .existing_occurrence_keys(&["k1".to_string(), "k3".to_string(), "k9".to_string()])
            .await
            .expect("lookup");
        assert_eq!(existing, HashSet::from(["k1".to_string(), "k3".to_string()]));
    }

    async fn exercise_crud(repository: &dyn DoseRepository) {
        let mut dose = manual("dose-1");
        repository.add(&dose).await.expect("add");
        dose.dose_mg = 5.0;
        repository.update(&dose).await.expect("update");
        let stored = repository.get("dose-1").await.expect("get").expect("exists");
        assert_eq!(stored, dose);

        assert!(matches!(
            repository.update(&manual("missing")).await,
            Err(InfraError::NotFound(_))
        ));
        assert!(repository.delete("dose-1").await.expect("delete"));
        assert!(!repository.delete("dose-1").await.expect("delete again"));
    }

    #[tokio::test]
    async fn sqlite_bulk_insert_reports_conflicts_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise_bulk_insert_conflicts(&sqlite_repository(&dir)).await;
    }

    #[tokio::test]
    async fn in_memory_bulk_insert_reports_conflicts_per_record() {
        exercise_bulk_insert_conflicts(&InMemoryDoseRepository::default()).await;
    }

    #[tokio::test]
    async fn sqlite_crud_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise_crud(&sqlite_repository(&dir)).await;
    }

    #[tokio::test]
    async fn in_memory_crud_round_trip() {
        exercise_crud(&InMemoryDoseRepository::default()).await;
    }

    #[tokio::test]
    async fn sqlite_add_rejects_duplicate_occurrence_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = sqlite_repository(&dir);
        repository.add(&scheduled("dose-a", "k1")).await.expect("first");
        let error = repository
            .add(&scheduled("dose-b", "k1"))
            .await
            .expect_err("duplicate must fail");
        assert!(matches!(error, InfraError::DuplicateOccurrenceKey(key) if key == "k1"));
    }

    #[tokio::test]
    async fn sqlite_bulk_insert_rolls_back_on_non_conflict_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = sqlite_repository(&dir);
        repository.add(&manual("dose-a")).await.expect("seed");

        // Same primary key, different occurrence key: not a duplicate-occurrence conflict.
        let result = repository
            .bulk_insert(vec![scheduled("dose-new", "k1"), scheduled("dose-a", "k2")])
            .await;

        assert!(matches!(result, Err(InfraError::Sqlite(_))));
        let stored = repository.list().await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "dose-a");
    }

    #[tokio::test]
    async fn sqlite_key_lookup_handles_large_sets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = sqlite_repository(&dir);
        let batch: Vec<Dose> = (0..1200)
            .map(|index| scheduled(&format!("dose-{index}"), &format!("key-{index}")))
            .collect();
        assert_eq!(repository.bulk_insert(batch).await.expect("insert").inserted, 1200);

        let keys: Vec<String> = (0..1300).map(|index| format!("key-{index}")).collect();
        let found = repository.existing_occurrence_keys(&keys).await.expect("lookup");
        assert_eq!(found.len(), 1200);
    }
}
