use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = open_connection(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

pub(crate) fn open_connection(path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub(crate) async fn with_connection<T, F>(db_path: &Path, work: F) -> Result<T, InfraError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, InfraError> + Send + 'static,
{
    let db_path: PathBuf = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut connection = open_connection(&db_path)?;
        work(&mut connection)
    })
    .await
    .map_err(|error| InfraError::Task(error.to_string()))?
}

pub(crate) fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| InfraError::InvalidRecord(format!("invalid {field} '{raw}': {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_database_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dosecurve.sqlite");

        initialize_database(&path).expect("first init");
        initialize_database(&path).expect("second init");

        let connection = Connection::open(&path).expect("open");
        let tables: Vec<String> = connection
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("collect");
        assert_eq!(tables, vec!["doses", "medications", "schedules", "settings"]);
    }

    #[test]
    fn parse_timestamp_reports_field_name() {
        let error = parse_timestamp("garbage", "doses.created_at").expect_err("must fail");
        assert!(error.to_string().contains("doses.created_at"));
    }
}
