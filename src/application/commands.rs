use crate::application::bootstrap::bootstrap_workspace;
use crate::application::projection::{ChartSeries, FutureHorizon, SeriesOptions, LOOKBACK_DAY_OPTIONS};
use crate::application::reconcile::{new_record_id, IdGenerator, NowProvider};
use crate::application::refresh::{RefreshConfig, RefreshController, RefreshOutcome, RefreshTrigger};
use crate::domain::models::{
    Dose, DoseSource, DoseUpdate, Medication, Schedule, ScheduleFrequency, ScheduledDoseStatus,
    Settings,
};
use crate::domain::timezone::{format_instant, is_valid_time_zone, parse_instant, resolve_timezone};
use crate::infrastructure::dose_repository::{DoseRepository, SqliteDoseRepository};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::medication_repository::{MedicationRepository, SqliteMedicationRepository};
use crate::infrastructure::schedule_repository::{ScheduleRepository, SqliteScheduleRepository};
use crate::infrastructure::settings_repository::{SettingsRepository, SqliteSettingsRepository};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

pub type SqliteRefreshController = RefreshController<
    SqliteDoseRepository,
    SqliteScheduleRepository,
    SqliteMedicationRepository,
    SqliteSettingsRepository,
>;

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    doses: Arc<SqliteDoseRepository>,
    schedules: Arc<SqliteScheduleRepository>,
    medications: Arc<SqliteMedicationRepository>,
    settings: Arc<SqliteSettingsRepository>,
    controller: Arc<SqliteRefreshController>,
    now_provider: NowProvider,
    id_generator: IdGenerator,
    pending_refresh: Mutex<Option<JoinHandle<RefreshOutcome>>>,
    ticker: JoinHandle<()>,
}

impl AppState {
    pub async fn open(workspace_root: PathBuf) -> Result<Self, InfraError> {
        Self::open_with_now_provider(workspace_root, Arc::new(Utc::now)).await
    }

    pub async fn open_with_now_provider(
        workspace_root: PathBuf,
        now_provider: NowProvider,
    ) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let doses = Arc::new(SqliteDoseRepository::new(&bootstrap.database_path));
        let schedules = Arc::new(SqliteScheduleRepository::new(&bootstrap.database_path));
        let medications = Arc::new(SqliteMedicationRepository::new(&bootstrap.database_path));
        let settings = Arc::new(SqliteSettingsRepository::new(&bootstrap.database_path));

        if settings.load().await?.is_none() {
            let seeded = bootstrap.config.app.to_settings();
            settings.save(&seeded).await?;
            info!(
                "event=seed_settings module=commands status=ok default_timezone={}",
                seeded.default_timezone
            );
        }

        let id_generator: IdGenerator = Arc::new(new_record_id);
        let controller = Arc::new(
            RefreshController::new(
                Arc::clone(&doses),
                Arc::clone(&schedules),
                Arc::clone(&medications),
                Arc::clone(&settings),
                RefreshConfig::from(&bootstrap.config.refresh),
            )
            .with_now_provider(Arc::clone(&now_provider))
            .with_id_generator(Arc::clone(&id_generator)),
        );
        if let RefreshOutcome::Failed(message) = controller.handle(RefreshTrigger::Load).await {
            warn!("event=open module=commands status=degraded error={message}");
        }
        let ticker = controller.spawn_ticker();

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            doses,
            schedules,
            medications,
            settings,
            controller,
            now_provider,
            id_generator,
            pending_refresh: Mutex::new(None),
            ticker,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn controller(&self) -> &Arc<SqliteRefreshController> {
        &self.controller
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        error!("event=command module=commands status=error command={command} error={error}");
        error.to_string()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    fn next_id(&self) -> String {
        (self.id_generator)()
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, Option<JoinHandle<RefreshOutcome>>>, InfraError> {
        self.pending_refresh
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("pending refresh lock poisoned: {error}")))
    }

    fn notify_schedules_changed(&self) -> Result<(), InfraError> {
        let handle = self.controller.spawn_trigger(RefreshTrigger::SchedulesChanged);
        *self.lock_pending()? = Some(handle);
        Ok(())
    }

    pub async fn wait_for_refresh(&self) -> Result<Option<RefreshOutcome>, InfraError> {
        let Some(handle) = self.lock_pending()?.take() else {
            return Ok(None);
        };
        let outcome = handle
            .await
            .map_err(|error| InfraError::Task(format!("schedule refresh task failed: {error}")))?;
        Ok(Some(outcome))
    }

    async fn current_settings(&self) -> Result<Settings, InfraError> {
        self.settings.load_or(Settings::default()).await
    }

    async fn require_medication(&self, medication_id: &str) -> Result<(), InfraError> {
        match self.medications.get(medication_id).await? {
            Some(_) => Ok(()),
            None => Err(InfraError::NotFound(format!("medication not found: {medication_id}"))),
        }
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

fn required_text(value: &str, field_name: &str) -> Result<String, InfraError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(InfraError::InvalidInput(format!("{field_name} must not be empty")));
    }
    Ok(value.to_string())
}

fn normalized_instant(value: &str, field_name: &str) -> Result<String, InfraError> {
    parse_instant(value.trim())
        .map(format_instant)
        .ok_or_else(|| InfraError::InvalidInput(format!("{field_name} must be an ISO-8601 instant")))
}

fn checked_timezone(value: &str, field_name: &str) -> Result<String, InfraError> {
    let value = value.trim();
    if !is_valid_time_zone(value) {
        return Err(InfraError::InvalidInput(format!(
            "{field_name} must be a known IANA zone, got `{value}`"
        )));
    }
    Ok(value.to_string())
}

fn invalid(message: String) -> InfraError {
    InfraError::InvalidInput(message)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NewMedication {
    pub name: String,
    pub ka_per_hour: f64,
    pub ke_per_hour: f64,
    pub scale: Option<f64>,
    pub notes: Option<String>,
}

pub async fn list_medications_impl(state: &AppState) -> Result<Vec<Medication>, InfraError> {
    state.medications.list().await
}

pub async fn add_medication_impl(
    state: &AppState,
    input: NewMedication,
) -> Result<Medication, InfraError> {
    let now = state.now();
    let medication = Medication {
        id: state.next_id(),
        name: required_text(&input.name, "name")?,
        ka_per_hour: input.ka_per_hour,
        ke_per_hour: input.ke_per_hour,
        scale: input.scale.unwrap_or(1.0),
        notes: input
            .notes
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string(),
        created_at: now,
        updated_at: now,
    };
    medication.validate().map_err(invalid)?;
    state.medications.add(&medication).await?;
    state.controller.reload().await?;

    info!(
        "event=command module=commands status=ok command=add_medication medication_id={}",
        medication.id
    );
    Ok(medication)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NewDose {
    pub medication_id: String,
    pub dose_mg: f64,
    pub datetime_iso: String,
    pub timezone: Option<String>,
    pub source: Option<DoseSource>,
    pub schedule_id: Option<String>,
    pub occurrence_key: Option<String>,
    pub status: Option<ScheduledDoseStatus>,
}

pub async fn list_doses_impl(state: &AppState) -> Result<Vec<Dose>, InfraError> {
    state.doses.list().await
}

pub async fn add_dose_impl(state: &AppState, input: NewDose) -> Result<Dose, InfraError> {
    let medication_id = required_text(&input.medication_id, "medication_id")?;
    state.require_medication(&medication_id).await?;
    let settings = state.current_settings().await?;
    let timezone = resolve_timezone(
        input.timezone.as_deref().map(str::trim).unwrap_or_default(),
        &settings.default_timezone,
    );
    let source = input.source.unwrap_or(DoseSource::Manual);
    let scheduled = source == DoseSource::Scheduled;

    let now = state.now();
    let dose = Dose {
        id: state.next_id(),
        medication_id,
        dose_mg: input.dose_mg,
        datetime_iso: normalized_instant(&input.datetime_iso, "datetime_iso")?,
        timezone,
        created_at: now,
        updated_at: now,
        source: Some(source),
        schedule_id: input.schedule_id.filter(|_| scheduled),
        occurrence_key: input.occurrence_key.filter(|_| scheduled),
        status: if scheduled {
            Some(input.status.unwrap_or(ScheduledDoseStatus::AssumedTaken))
        } else {
            None
        },
    };
    dose.validate().map_err(invalid)?;
    state.doses.add(&dose).await?;
    state.controller.reload().await?;

    info!(
        "event=command module=commands status=ok command=add_dose dose_id={} source={}",
        dose.id,
        source.as_str()
    );
    Ok(dose)
}

pub async fn update_dose_impl(
    state: &AppState,
    dose_id: String,
    mut update: DoseUpdate,
) -> Result<Dose, InfraError> {
    let dose_id = required_text(&dose_id, "dose_id")?;
    let Some(mut dose) = state.doses.get(&dose_id).await? else {
        return Err(InfraError::NotFound(format!("dose not found: {dose_id}")));
    };

    if let Some(medication_id) = update.medication_id.take() {
        let medication_id = required_text(&medication_id, "medication_id")?;
        state.require_medication(&medication_id).await?;
        update.medication_id = Some(medication_id);
    }
    if let Some(datetime_iso) = update.datetime_iso.take() {
        update.datetime_iso = Some(normalized_instant(&datetime_iso, "datetime_iso")?);
    }
    if let Some(timezone) = update.timezone.take() {
        update.timezone = Some(checked_timezone(&timezone, "timezone")?);
    }

    let detached = dose.apply_update(&update, state.now());
    dose.validate().map_err(invalid)?;
    state.doses.update(&dose).await?;
    state.controller.reload().await?;

    info!(
        "event=command module=commands status=ok command=update_dose dose_id={} detached={}",
        dose.id, detached
    );
    Ok(dose)
}

pub async fn confirm_dose_impl(state: &AppState, dose_id: String) -> Result<Dose, InfraError> {
    set_dose_status(state, "confirm_dose", dose_id, ScheduledDoseStatus::ConfirmedTaken).await
}

pub async fn skip_dose_impl(state: &AppState, dose_id: String) -> Result<Dose, InfraError> {
    set_dose_status(state, "skip_dose", dose_id, ScheduledDoseStatus::Skipped).await
}

async fn set_dose_status(
    state: &AppState,
    command: &str,
    dose_id: String,
    status: ScheduledDoseStatus,
) -> Result<Dose, InfraError> {
    let dose_id = required_text(&dose_id, "dose_id")?;
    let Some(mut dose) = state.doses.get(&dose_id).await? else {
        return Err(InfraError::NotFound(format!("dose not found: {dose_id}")));
    };
    if !dose.is_scheduled() {
        return Err(InfraError::InvalidInput(format!(
            "dose {dose_id} is not a scheduled dose"
        )));
    }

    dose.status = Some(status);
    dose.updated_at = state.now();
    state.doses.update(&dose).await?;
    state.controller.reload().await?;

    info!(
        "event=command module=commands status=ok command={command} dose_id={dose_id} dose_status={}",
        status.as_str()
    );
    Ok(dose)
}

pub async fn delete_dose_impl(state: &AppState, dose_id: String) -> Result<bool, InfraError> {
    let dose_id = required_text(&dose_id, "dose_id")?;
    let removed = state.doses.delete(&dose_id).await?;
    if removed {
        state.controller.reload().await?;
        info!("event=command module=commands status=ok command=delete_dose dose_id={dose_id}");
    }
    Ok(removed)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NewSchedule {
    pub medication_id: String,
    pub start_datetime_iso: String,
    pub timezone: Option<String>,
    pub dose_mg: f64,
    pub frequency: ScheduleFrequency,
    pub interval: Option<i32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ScheduleUpdate {
    pub medication_id: Option<String>,
    pub start_datetime_iso: Option<String>,
    pub timezone: Option<String>,
    pub dose_mg: Option<f64>,
    pub frequency: Option<ScheduleFrequency>,
    pub interval: Option<i32>,
    pub enabled: Option<bool>,
}

fn resolve_interval(frequency: ScheduleFrequency, interval: Option<i32>) -> Result<i32, InfraError> {
    match (frequency, interval) {
        (_, Some(days)) => Ok(days),
        (ScheduleFrequency::Daily, None) => Ok(1),
        (ScheduleFrequency::Weekly, None) => Ok(7),
        (ScheduleFrequency::Custom, None) => Err(InfraError::InvalidInput(
            "interval is required for custom schedules".to_string(),
        )),
    }
}

pub async fn list_schedules_impl(state: &AppState) -> Result<Vec<Schedule>, InfraError> {
    state.schedules.list().await
}

pub async fn add_schedule_impl(state: &AppState, input: NewSchedule) -> Result<Schedule, InfraError> {
    let medication_id = required_text(&input.medication_id, "medication_id")?;
    state.require_medication(&medication_id).await?;
    let settings = state.current_settings().await?;
    let timezone = match input.timezone.as_deref() {
        Some(timezone) => checked_timezone(timezone, "timezone")?,
        None => settings.default_timezone,
    };

    let now = state.now();
    let schedule = Schedule {
        id: state.next_id(),
        medication_id,
        start_datetime_iso: normalized_instant(&input.start_datetime_iso, "start_datetime_iso")?,
        timezone,
        dose_mg: input.dose_mg,
        frequency: input.frequency,
        interval: resolve_interval(input.frequency, input.interval)?,
        enabled: input.enabled.unwrap_or(true),
        created_at: now,
        updated_at: now,
    };
    schedule.validate().map_err(invalid)?;
    state.schedules.upsert(&schedule).await?;
    state.notify_schedules_changed()?;

    info!(
        "event=command module=commands status=ok command=add_schedule schedule_id={}",
        schedule.id
    );
    Ok(schedule)
}

pub async fn update_schedule_impl(
    state: &AppState,
    schedule_id: String,
    update: ScheduleUpdate,
) -> Result<Schedule, InfraError> {
    let schedule_id = required_text(&schedule_id, "schedule_id")?;
    let Some(mut schedule) = state.schedules.get(&schedule_id).await? else {
        return Err(InfraError::NotFound(format!("schedule not found: {schedule_id}")));
    };

    if let Some(medication_id) = update.medication_id {
        let medication_id = required_text(&medication_id, "medication_id")?;
        state.require_medication(&medication_id).await?;
        schedule.medication_id = medication_id;
    }
    if let Some(start) = update.start_datetime_iso {
        schedule.start_datetime_iso = normalized_instant(&start, "start_datetime_iso")?;
    }
    if let Some(timezone) = update.timezone {
        schedule.timezone = checked_timezone(&timezone, "timezone")?;
    }
    if let Some(dose_mg) = update.dose_mg {
        schedule.dose_mg = dose_mg;
    }
    if let Some(frequency) = update.frequency {
        schedule.frequency = frequency;
        schedule.interval = resolve_interval(frequency, update.interval)?;
    } else if let Some(interval) = update.interval {
        schedule.interval = interval;
    }
    if let Some(enabled) = update.enabled {
        schedule.enabled = enabled;
    }
    schedule.updated_at = state.now();

    schedule.validate().map_err(invalid)?;
    state.schedules.upsert(&schedule).await?;
    state.notify_schedules_changed()?;

    info!(
        "event=command module=commands status=ok command=update_schedule schedule_id={schedule_id}"
    );
    Ok(schedule)
}

pub async fn set_schedule_enabled_impl(
    state: &AppState,
    schedule_id: String,
    enabled: bool,
) -> Result<Schedule, InfraError> {
    update_schedule_impl(
        state,
        schedule_id,
        ScheduleUpdate {
            enabled: Some(enabled),
            ..ScheduleUpdate::default()
        },
    )
    .await
}

pub async fn delete_schedule_impl(state: &AppState, schedule_id: String) -> Result<bool, InfraError> {
    let schedule_id = required_text(&schedule_id, "schedule_id")?;
    let removed = state.schedules.delete(&schedule_id).await?;
    if removed {
        state.notify_schedules_changed()?;
        info!(
            "event=command module=commands status=ok command=delete_schedule schedule_id={schedule_id}"
        );
    }
    Ok(removed)
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub default_timezone: Option<String>,
    pub chart_sample_minutes: Option<u32>,
    pub default_lookback_days: Option<u32>,
    pub default_future_days: Option<u32>,
}

pub async fn get_settings_impl(state: &AppState) -> Result<Settings, InfraError> {
    state.current_settings().await
}

pub async fn update_settings_impl(
    state: &AppState,
    update: SettingsUpdate,
) -> Result<Settings, InfraError> {
    let mut settings = state.current_settings().await?;
    if let Some(timezone) = update.default_timezone {
        settings.default_timezone = timezone.trim().to_string();
    }
    if let Some(minutes) = update.chart_sample_minutes {
        settings.chart_sample_minutes = minutes;
    }
    if let Some(days) = update.default_lookback_days {
        settings.default_lookback_days = days;
    }
    if let Some(days) = update.default_future_days {
        settings.default_future_days = days;
    }
    settings.validate().map_err(invalid)?;
    state.settings.save(&settings).await?;
    state.controller.reload().await?;

    info!(
        "event=command module=commands status=ok command=update_settings default_timezone={}",
        settings.default_timezone
    );
    Ok(settings)
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ChartRequest {
    pub lookback_days: Option<u32>,
    pub horizon: Option<String>,
    pub visible_medication_ids: Option<Vec<String>>,
    pub include_total: Option<bool>,
}

pub fn chart_series_impl(state: &AppState, request: ChartRequest) -> Result<ChartSeries, InfraError> {
    let settings = state.controller.snapshot()?.settings;
    let lookback_days = match request.lookback_days {
        Some(days) if LOOKBACK_DAY_OPTIONS.contains(&days) => days,
        Some(days) => {
            return Err(InfraError::InvalidInput(format!(
                "lookback_days must be one of {LOOKBACK_DAY_OPTIONS:?}, got {days}"
            )));
        }
        None => settings.default_lookback_days,
    };
    let horizon = match request.horizon.as_deref() {
        Some(raw) => FutureHorizon::parse(raw.trim())
            .ok_or_else(|| InfraError::InvalidInput(format!("unknown chart horizon `{raw}`")))?,
        None => FutureHorizon::from_default_future_days(settings.default_future_days),
    };
    let options = SeriesOptions {
        visible_medication_ids: request
            .visible_medication_ids
            .map(|ids| ids.into_iter().collect()),
        include_total: request.include_total.unwrap_or(true),
    };
    state.controller.project(lookback_days, horizon, &options)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefreshResponse {
    pub status: String,
    pub created_count: usize,
}

pub async fn reconcile_now_impl(state: &AppState) -> Result<RefreshResponse, InfraError> {
    let response = match state.controller.manual_refresh().await? {
        RefreshOutcome::Reconciled { created_count, .. } => RefreshResponse {
            status: "reconciled".to_string(),
            created_count,
        },
        RefreshOutcome::Skipped(reason) => RefreshResponse {
            status: format!("skipped_{}", reason.as_str()),
            created_count: 0,
        },
        RefreshOutcome::Failed(message) => return Err(InfraError::Task(message)),
    };
    info!(
        "event=command module=commands status=ok command=reconcile_now outcome={} created={}",
        response.status, response.created_count
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::refresh::SkipReason;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    struct Clock(Arc<Mutex<DateTime<Utc>>>);

    impl Clock {
        fn starting_at(value: &str) -> Self {
            Self(Arc::new(Mutex::new(fixed_time(value))))
        }

        fn provider(&self) -> NowProvider {
            let shared = Arc::clone(&self.0);
            Arc::new(move || *shared.lock().expect("clock lock"))
        }

        fn set(&self, value: &str) {
            *self.0.lock().expect("clock lock") = fixed_time(value);
        }
    }

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "dosecurve-command-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(path.join("config")).expect("create temp workspace");
            fs::write(
                path.join("config/refresh.json"),
                "{\"schema\": 1, \"debounceMs\": 5, \"tickSeconds\": 3600}\n",
            )
            .expect("write refresh config");
            Self { path }
        }

        async fn app_state(&self, clock: &Clock) -> AppState {
            AppState::open_with_now_provider(self.path.clone(), clock.provider())
                .await
                .expect("initialize app state")
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    async fn first_medication_id(state: &AppState) -> String {
        list_medications_impl(state)
            .await
            .expect("list medications")
            .into_iter()
            .next()
            .expect("seeded medication")
            .id
    }

    fn weekly_schedule(medication_id: &str, start: &str) -> NewSchedule {
        NewSchedule {
            medication_id: medication_id.to_string(),
            start_datetime_iso: start.to_string(),
            timezone: Some("UTC".to_string()),
            dose_mg: 2.5,
            frequency: ScheduleFrequency::Weekly,
            interval: None,
            enabled: None,
        }
    }

    fn manual_dose(medication_id: &str, at: &str) -> NewDose {
        NewDose {
            medication_id: medication_id.to_string(),
            dose_mg: 5.0,
            datetime_iso: at.to_string(),
            timezone: None,
            source: None,
            schedule_id: None,
            occurrence_key: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn open_seeds_settings_and_default_medications() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;

        let settings = get_settings_impl(&state).await.expect("settings");
        assert_eq!(settings.default_timezone, "Pacific/Auckland");
        assert_eq!(settings.chart_sample_minutes, 60);

        let names: Vec<String> = list_medications_impl(&state)
            .await
            .expect("medications")
            .into_iter()
            .map(|medication| medication.name)
            .collect();
        assert_eq!(names, vec!["Retatrutide".to_string(), "Tirzepatide".to_string()]);
        assert!(state.database_path().is_file());
        assert_eq!(
            state.controller().last_reconciled_at().expect("state"),
            Some(fixed_time("2025-01-15T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn reopening_keeps_edited_settings() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        {
            let state = workspace.app_state(&clock).await;
            update_settings_impl(
                &state,
                SettingsUpdate {
                    default_timezone: Some("Europe/London".to_string()),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .expect("update settings");
        }

        let reopened = workspace.app_state(&clock).await;
        let settings = get_settings_impl(&reopened).await.expect("settings");
        assert_eq!(settings.default_timezone, "Europe/London");
        assert_eq!(list_medications_impl(&reopened).await.expect("medications").len(), 2);
    }

    #[tokio::test]
    async fn backdated_schedule_materializes_past_occurrences() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;

        clock.set("2025-01-15T01:00:00Z");
        let schedule = add_schedule_impl(
            &state,
            weekly_schedule(&medication_id, "2025-01-01T09:00:00Z"),
        )
        .await
        .expect("add schedule");
        assert_eq!(schedule.interval, 7);
        assert_eq!(schedule.start_datetime_iso, "2025-01-01T09:00:00.000Z");

        let outcome = state.wait_for_refresh().await.expect("refresh task");
        assert_eq!(
            outcome,
            Some(RefreshOutcome::Reconciled {
                created_count: 2,
                full_scan: true,
                reloaded_doses: true,
            })
        );

        let doses = list_doses_impl(&state).await.expect("doses");
        assert_eq!(doses.len(), 2);
        assert!(doses.iter().all(|dose| dose.is_scheduled()));
        assert!(doses.iter().all(|dose| dose.status == Some(ScheduledDoseStatus::AssumedTaken)));
        assert_eq!(state.controller().snapshot().expect("snapshot").doses.len(), 2);
    }

    #[tokio::test]
    async fn deleting_a_schedule_keeps_its_doses() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;

        clock.set("2025-01-15T01:00:00Z");
        let schedule = add_schedule_impl(
            &state,
            weekly_schedule(&medication_id, "2025-01-01T09:00:00Z"),
        )
        .await
        .expect("add schedule");
        state.wait_for_refresh().await.expect("refresh task");

        clock.set("2025-01-15T02:00:00Z");
        assert!(delete_schedule_impl(&state, schedule.id.clone()).await.expect("delete"));
        assert!(!delete_schedule_impl(&state, schedule.id).await.expect("second delete"));
        state.wait_for_refresh().await.expect("refresh task");

        assert!(list_schedules_impl(&state).await.expect("schedules").is_empty());
        assert_eq!(list_doses_impl(&state).await.expect("doses").len(), 2);
    }

    #[tokio::test]
    async fn custom_schedule_requires_interval() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;

        let mut input = weekly_schedule(&medication_id, "2025-01-01T09:00:00Z");
        input.frequency = ScheduleFrequency::Custom;
        let result = add_schedule_impl(&state, input).await;
        assert!(matches!(result, Err(InfraError::InvalidInput(_))));

        let mut input = weekly_schedule(&medication_id, "2025-01-01T09:00:00Z");
        input.timezone = Some("Mars/Olympus".to_string());
        assert!(matches!(
            add_schedule_impl(&state, input).await,
            Err(InfraError::InvalidInput(_))
        ));
        assert!(list_schedules_impl(&state).await.expect("schedules").is_empty());
    }

    #[tokio::test]
    async fn disabling_and_re_enabling_a_schedule_round_trips() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;

        let schedule = add_schedule_impl(
            &state,
            weekly_schedule(&medication_id, "2025-02-01T09:00:00Z"),
        )
        .await
        .expect("add schedule");
        state.wait_for_refresh().await.expect("refresh task");

        let disabled = set_schedule_enabled_impl(&state, schedule.id.clone(), false)
            .await
            .expect("disable");
        assert!(!disabled.enabled);
        state.wait_for_refresh().await.expect("refresh task");

        let enabled = set_schedule_enabled_impl(&state, schedule.id.clone(), true)
            .await
            .expect("enable");
        assert!(enabled.enabled);
        assert_eq!(enabled.created_at, schedule.created_at);
        state.wait_for_refresh().await.expect("refresh task");
        assert!(list_doses_impl(&state).await.expect("doses").is_empty());
    }

    #[tokio::test]
    async fn manual_doses_drop_schedule_linkage_and_status() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;

        let mut input = manual_dose(&medication_id, "2025-01-10T08:00:00+13:00");
        input.status = Some(ScheduledDoseStatus::Skipped);
        input.schedule_id = Some("sch-ignored".to_string());
        let dose = add_dose_impl(&state, input).await.expect("add dose");

        assert_eq!(dose.source, Some(DoseSource::Manual));
        assert_eq!(dose.status, None);
        assert_eq!(dose.schedule_id, None);
        assert_eq!(dose.datetime_iso, "2025-01-09T19:00:00.000Z");
        assert_eq!(dose.timezone, "Pacific/Auckland");

        let result = confirm_dose_impl(&state, dose.id.clone()).await;
        assert!(matches!(result, Err(InfraError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn add_dose_rejects_unknown_medication() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;

        let result = add_dose_impl(&state, manual_dose("med-missing", "2025-01-10T08:00:00Z")).await;
        assert!(matches!(result, Err(InfraError::NotFound(_))));
        let message = state.command_error("add_dose", &result.expect_err("not found"));
        assert!(message.contains("med-missing"));
    }

    #[tokio::test]
    async fn scheduled_doses_can_be_confirmed_skipped_and_detached() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;

        clock.set("2025-01-15T01:00:00Z");
        add_schedule_impl(&state, weekly_schedule(&medication_id, "2025-01-01T09:00:00Z"))
            .await
            .expect("add schedule");
        state.wait_for_refresh().await.expect("refresh task");
        let doses = list_doses_impl(&state).await.expect("doses");
        let (first, second) = (doses[0].id.clone(), doses[1].id.clone());

        let confirmed = confirm_dose_impl(&state, first.clone()).await.expect("confirm");
        assert_eq!(confirmed.status, Some(ScheduledDoseStatus::ConfirmedTaken));
        let skipped = skip_dose_impl(&state, second).await.expect("skip");
        assert_eq!(skipped.status, Some(ScheduledDoseStatus::Skipped));

        let retimed = update_dose_impl(
            &state,
            first.clone(),
            DoseUpdate {
                timezone: Some("Europe/London".to_string()),
                ..DoseUpdate::default()
            },
        )
        .await
        .expect("timezone only");
        assert!(retimed.is_scheduled());

        let moved = update_dose_impl(
            &state,
            first,
            DoseUpdate {
                datetime_iso: Some("2025-01-01T10:00:00Z".to_string()),
                ..DoseUpdate::default()
            },
        )
        .await
        .expect("move dose");
        assert_eq!(moved.source, Some(DoseSource::Manual));
        assert_eq!(moved.occurrence_key, None);
        assert_eq!(moved.status, None);

        let result = update_dose_impl(
            &state,
            "dose-missing".to_string(),
            DoseUpdate::default(),
        )
        .await;
        assert!(matches!(result, Err(InfraError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_dose_reports_whether_it_removed_anything() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;
        let dose = add_dose_impl(&state, manual_dose(&medication_id, "2025-01-10T08:00:00Z"))
            .await
            .expect("add dose");

        assert!(delete_dose_impl(&state, dose.id.clone()).await.expect("delete"));
        assert!(!delete_dose_impl(&state, dose.id).await.expect("second delete"));
        assert!(state.controller().snapshot().expect("snapshot").doses.is_empty());
    }

    #[tokio::test]
    async fn settings_update_is_partial_and_validated() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;

        let updated = update_settings_impl(
            &state,
            SettingsUpdate {
                chart_sample_minutes: Some(30),
                ..SettingsUpdate::default()
            },
        )
        .await
        .expect("update");
        assert_eq!(updated.chart_sample_minutes, 30);
        assert_eq!(updated.default_timezone, "Pacific/Auckland");

        let result = update_settings_impl(
            &state,
            SettingsUpdate {
                default_timezone: Some("Mars/Olympus".to_string()),
                ..SettingsUpdate::default()
            },
        )
        .await;
        assert!(matches!(result, Err(InfraError::InvalidInput(_))));
        assert_eq!(
            get_settings_impl(&state).await.expect("settings").chart_sample_minutes,
            30
        );
    }

    #[tokio::test]
    async fn chart_series_uses_settings_defaults_and_rejects_unknown_horizons() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;
        let medication_id = first_medication_id(&state).await;
        add_dose_impl(&state, manual_dose(&medication_id, "2025-01-14T00:00:00Z"))
            .await
            .expect("add dose");

        let series = chart_series_impl(
            &state,
            ChartRequest {
                lookback_days: Some(7),
                ..ChartRequest::default()
            },
        )
        .expect("series");
        assert_eq!(series.range.now, fixed_time("2025-01-15T00:00:00Z"));
        assert_eq!(series.range.end, fixed_time("2025-01-22T00:00:00Z"));
        assert_eq!(series.sample_minutes, 60);
        let at_now = series
            .points
            .iter()
            .find(|point| point.t == series.range.now)
            .expect("now sample");
        assert!(at_now.total.and_then(|total| total.past).is_some_and(|amount| amount > 0.0));

        let result = chart_series_impl(
            &state,
            ChartRequest {
                horizon: Some("2w".to_string()),
                ..ChartRequest::default()
            },
        );
        assert!(matches!(result, Err(InfraError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn reconcile_now_skips_when_clock_has_not_moved() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;

        let response = reconcile_now_impl(&state).await.expect("reconcile");
        assert_eq!(
            response.status,
            format!("skipped_{}", SkipReason::AlreadyReconciled.as_str())
        );

        clock.set("2025-01-15T00:05:00Z");
        let response = reconcile_now_impl(&state).await.expect("reconcile");
        assert_eq!(
            response,
            RefreshResponse {
                status: "reconciled".to_string(),
                created_count: 0,
            }
        );
    }

    #[tokio::test]
    async fn add_medication_validates_rates() {
        let workspace = TempWorkspace::new();
        let clock = Clock::starting_at("2025-01-15T00:00:00Z");
        let state = workspace.app_state(&clock).await;

        let medication = add_medication_impl(
            &state,
            NewMedication {
                name: "  Semaglutide ".to_string(),
                ka_per_hour: 0.03,
                ke_per_hour: 0.0041,
                scale: None,
                notes: None,
            },
        )
        .await
        .expect("add medication");
        assert_eq!(medication.name, "Semaglutide");
        assert_eq!(medication.scale, 1.0);

        let result = add_medication_impl(
            &state,
            NewMedication {
                name: "Broken".to_string(),
                ka_per_hour: 0.0,
                ke_per_hour: 0.1,
                scale: None,
                notes: None,
            },
        )
        .await;
        assert!(matches!(result, Err(InfraError::InvalidInput(_))));
        assert_eq!(
            state.controller().snapshot().expect("snapshot").medications.len(),
            3
        );
    }
}
