use crate::domain::models::Medication;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{parse_timestamp, with_connection};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SELECT_MEDICATION_COLUMNS: &str = "SELECT id, name, ka_per_hour, ke_per_hour, scale, notes,
        created_at, updated_at FROM medications";

#[async_trait]
pub trait MedicationRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Medication>, InfraError>;
    async fn get(&self, medication_id: &str) -> Result<Option<Medication>, InfraError>;
    async fn add(&self, medication: &Medication) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteMedicationRepository {
    db_path: PathBuf,
}

impl SqliteMedicationRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

struct MedicationRow {
    id: String,
    name: String,
    ka_per_hour: f64,
    ke_per_hour: f64,
    scale: f64,
    notes: String,
    created_at: String,
    updated_at: String,
}

impl MedicationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            ka_per_hour: row.get(2)?,
            ke_per_hour: row.get(3)?,
            scale: row.get(4)?,
            notes: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_medication(self) -> Result<Medication, InfraError> {
        Ok(Medication {
            created_at: parse_timestamp(&self.created_at, "medications.created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "medications.updated_at")?,
            id: self.id,
            name: self.name,
            ka_per_hour: self.ka_per_hour,
            ke_per_hour: self.ke_per_hour,
            scale: self.scale,
            notes: self.notes,
        })
    }
}

#[async_trait]
impl MedicationRepository for SqliteMedicationRepository {
    async fn list(&self) -> Result<Vec<Medication>, InfraError> {
        with_connection(&self.db_path, |connection| {
            let mut statement =
                connection.prepare(&format!("{SELECT_MEDICATION_COLUMNS} ORDER BY name, id"))?;
            let rows = statement
                .query_map([], MedicationRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(MedicationRow::into_medication).collect()
        })
        .await
    }

    async fn get(&self, medication_id: &str) -> Result<Option<Medication>, InfraError> {
        let medication_id = medication_id.to_string();
        with_connection(&self.db_path, move |connection| {
            connection
                .query_row(
                    &format!("{SELECT_MEDICATION_COLUMNS} WHERE id = ?1"),
                    params![medication_id],
                    MedicationRow::read,
                )
                .optional()?
                .map(MedicationRow::into_medication)
                .transpose()
        })
        .await
    }

    async fn add(&self, medication: &Medication) -> Result<(), InfraError> {
        let medication = medication.clone();
        with_connection(&self.db_path, move |connection| {
            connection.execute(
                "INSERT INTO medications (
                   id, name, ka_per_hour, ke_per_hour, scale, notes, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    medication.id,
                    medication.name,
                    medication.ka_per_hour,
                    medication.ke_per_hour,
                    medication.scale,
                    medication.notes,
                    medication.created_at.to_rfc3339(),
                    medication.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMedicationRepository {
    medications: Mutex<Vec<Medication>>,
}

impl InMemoryMedicationRepository {
    pub fn with_medications(medications: impl IntoIterator<Item = Medication>) -> Self {
        Self {
            medications: Mutex::new(medications.into_iter().collect()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Medication>>, InfraError> {
        self.medications
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("medication store lock poisoned: {error}")))
    }
}

#[async_trait]
impl MedicationRepository for InMemoryMedicationRepository {
    async fn list(&self) -> Result<Vec<Medication>, InfraError> {
        let mut listed = self.lock()?.clone();
        listed.sort_by(|left, right| left.name.cmp(&right.name).then_with(|| left.id.cmp(&right.id)));
        Ok(listed)
    }

    async fn get(&self, medication_id: &str) -> Result<Option<Medication>, InfraError> {
        Ok(self
            .lock()?
            .iter()
            .find(|medication| medication.id == medication_id)
            .cloned())
    }

    async fn add(&self, medication: &Medication) -> Result<(), InfraError> {
        let mut medications = self.lock()?;
        if medications.iter().any(|existing| existing.id == medication.id) {
            return Err(InfraError::InvalidInput(format!(
                "medication {} already exists",
                medication.id
            )));
        }
        medications.push(medication.clone());
        Ok(())
    }
}
