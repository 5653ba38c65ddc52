use crate::application::projection::{project_series, ChartRange, ChartSeries, DataSnapshot, FutureHorizon, SeriesOptions};
use crate::application::reconcile::{new_record_id, IdGenerator, NowProvider, ScheduledDoseReconciler};
use crate::domain::models::{Medication, Schedule, Settings, DEFAULT_MEDICATIONS};
use crate::domain::recurrence::Recurrence;
use crate::domain::timezone::{format_instant, parse_instant};
use crate::infrastructure::config::RefreshFileConfig;
use crate::infrastructure::dose_repository::DoseRepository;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::medication_repository::MedicationRepository;
use crate::infrastructure::schedule_repository::ScheduleRepository;
use crate::infrastructure::settings_repository::SettingsRepository;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    pub debounce: Duration,
    pub tick_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig::from(&RefreshFileConfig::default())
    }
}

impl From<&RefreshFileConfig> for RefreshConfig {
    fn from(file: &RefreshFileConfig) -> Self {
        Self {
            debounce: file.debounce(),
            tick_interval: file.tick_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Load,
    SchedulesChanged,
    Tick,
    ManualRefresh,
}

impl RefreshTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::SchedulesChanged => "schedules_changed",
            Self::Tick => "tick",
            Self::ManualRefresh => "manual_refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    AlreadyReconciled,
    NotDue,
    Superseded,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::AlreadyReconciled => "already_reconciled",
            Self::NotDue => "not_due",
            Self::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Reconciled {
        created_count: usize,
        full_scan: bool,
        reloaded_doses: bool,
    },
    Skipped(SkipReason),
    Failed(String),
}

pub fn requires_full_scan(
    previous: &HashMap<String, Schedule>,
    current: &[Schedule],
    last_reconciled_at: DateTime<Utc>,
) -> bool {
    current.iter().any(|schedule| {
        if !schedule.enabled {
            return false;
        }
        let Some(start) = parse_instant(&schedule.start_datetime_iso) else {
            return false;
        };
        if start > last_reconciled_at {
            return false;
        }
        match previous.get(&schedule.id) {
            None => true,
            Some(before) => {
                !before.enabled
                    || before.start_datetime_iso != schedule.start_datetime_iso
                    || before.interval != schedule.interval
                    || before.timezone != schedule.timezone
            }
        }
    })
}

pub fn next_due_occurrence(
    schedules: &[Schedule],
    after: DateTime<Utc>,
    default_timezone: &str,
) -> Option<DateTime<Utc>> {
    schedules
        .iter()
        .filter_map(|schedule| Recurrence::for_schedule(schedule, default_timezone))
        .filter_map(|recurrence| recurrence.next_after(after))
        .min()
}

#[derive(Debug, Default)]
struct ControllerState {
    last_reconciled_at: Option<DateTime<Utc>>,
    previous_schedules: HashMap<String, Schedule>,
    pending_full_scan: bool,
    snapshot: DataSnapshot,
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct RefreshController<D, S, M, P>
where
    D: DoseRepository,
    S: ScheduleRepository,
    M: MedicationRepository,
    P: SettingsRepository,
{
    reconciler: ScheduledDoseReconciler<D, S, P>,
    dose_repository: Arc<D>,
    schedule_repository: Arc<S>,
    medication_repository: Arc<M>,
    settings_repository: Arc<P>,
    config: RefreshConfig,
    now_provider: NowProvider,
    id_generator: IdGenerator,
    state: Mutex<ControllerState>,
    in_flight: AtomicBool,
    edit_generation: AtomicU64,
}

impl<D, S, M, P> RefreshController<D, S, M, P>
where
    D: DoseRepository,
    S: ScheduleRepository,
    M: MedicationRepository,
    P: SettingsRepository,
{
    pub fn new(
        dose_repository: Arc<D>,
        schedule_repository: Arc<S>,
        medication_repository: Arc<M>,
        settings_repository: Arc<P>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            reconciler: ScheduledDoseReconciler::new(
                dose_repository.clone(),
                schedule_repository.clone(),
                settings_repository.clone(),
            ),
            dose_repository,
            schedule_repository,
            medication_repository,
            settings_repository,
            config,
            now_provider: Arc::new(Utc::now),
            id_generator: Arc::new(new_record_id),
            state: Mutex::new(ControllerState::default()),
            in_flight: AtomicBool::new(false),
            edit_generation: AtomicU64::new(0),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.reconciler = self.reconciler.with_now_provider(now_provider.clone());
        self.now_provider = now_provider;
        self
    }

    pub fn with_id_generator(mut self, id_generator: IdGenerator) -> Self {
        self.reconciler = self.reconciler.with_id_generator(id_generator.clone());
        self.id_generator = id_generator;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    pub fn config(&self) -> RefreshConfig {
        self.config
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ControllerState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("refresh state lock poisoned: {error}")))
    }

    pub fn last_reconciled_at(&self) -> Result<Option<DateTime<Utc>>, InfraError> {
        Ok(self.lock_state()?.last_reconciled_at)
    }

    pub fn snapshot(&self) -> Result<DataSnapshot, InfraError> {
        Ok(self.lock_state()?.snapshot.clone())
    }

    pub async fn handle(&self, trigger: RefreshTrigger) -> RefreshOutcome {
        let result = match trigger {
            RefreshTrigger::Load => self.load().await,
            RefreshTrigger::SchedulesChanged => self.schedules_changed().await,
            RefreshTrigger::Tick => self.tick().await,
            RefreshTrigger::ManualRefresh => self.manual_refresh().await,
        };
        match result {
            Ok(outcome) => {
                debug!(
                    "event=refresh module=refresh status=ok trigger={} outcome={:?}",
                    trigger.as_str(),
                    outcome
                );
                outcome
            }
            Err(failure) => {
                error!(
                    "event=refresh module=refresh status=error trigger={} error={}",
                    trigger.as_str(),
                    failure
                );
                RefreshOutcome::Failed(failure.to_string())
            }
        }
    }

    pub async fn load(&self) -> Result<RefreshOutcome, InfraError> {
        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight) else {
            return Ok(RefreshOutcome::Skipped(SkipReason::InFlight));
        };
        let now = self.now();
        let result = self.reconciler.reconcile(now, None).await?;

        let medications = self.load_medications(now).await?;
        let doses = self.dose_repository.list().await?;
        let schedules = self.schedule_repository.list().await?;
        let settings = self.settings_repository.load_or(Settings::default()).await?;

        let mut state = self.lock_state()?;
        state.last_reconciled_at = Some(state.last_reconciled_at.map_or(now, |last| last.max(now)));
        state.previous_schedules = schedules
            .iter()
            .map(|schedule| (schedule.id.clone(), schedule.clone()))
            .collect();
        state.snapshot = DataSnapshot {
            medications,
            doses,
            schedules,
            settings,
        };
        info!(
            "event=refresh_load module=refresh status=ok now={} created={}",
            format_instant(now),
            result.created_count
        );
        Ok(RefreshOutcome::Reconciled {
            created_count: result.created_count,
            full_scan: true,
            reloaded_doses: true,
        })
    }

    async fn load_medications(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Medication>, InfraError> {
        let existing = self.medication_repository.list().await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        for preset in DEFAULT_MEDICATIONS {
            let medication = preset.instantiate((self.id_generator)(), now);
            self.medication_repository.add(&medication).await?;
        }
        info!(
            "event=seed_medications module=refresh status=ok count={}",
            DEFAULT_MEDICATIONS.len()
        );
        self.medication_repository.list().await
    }

    pub async fn reload(&self) -> Result<(), InfraError> {
        let medications = self.medication_repository.list().await?;
        let doses = self.dose_repository.list().await?;
        let schedules = self.schedule_repository.list().await?;
        let settings = self.settings_repository.load_or(Settings::default()).await?;
        self.lock_state()?.snapshot = DataSnapshot {
            medications,
            doses,
            schedules,
            settings,
        };
        Ok(())
    }

    pub async fn schedules_changed(&self) -> Result<RefreshOutcome, InfraError> {
        let generation = self.edit_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let schedules = self.schedule_repository.list().await?;
        {
            let mut state = self.lock_state()?;
            let full_scan = match state.last_reconciled_at {
                Some(last) => requires_full_scan(&state.previous_schedules, &schedules, last),
                None => true,
            };
            state.pending_full_scan |= full_scan;
            state.previous_schedules = schedules
                .iter()
                .map(|schedule| (schedule.id.clone(), schedule.clone()))
                .collect();
            state.snapshot.schedules = schedules;
        }

        sleep(self.config.debounce).await;
        if self.edit_generation.load(Ordering::Acquire) != generation {
            return Ok(RefreshOutcome::Skipped(SkipReason::Superseded));
        }

        let (full_scan, since) = {
            let mut state = self.lock_state()?;
            let full_scan = std::mem::take(&mut state.pending_full_scan);
            (full_scan, if full_scan { None } else { state.last_reconciled_at })
        };
        let outcome = self.reconcile_and_refresh(self.now(), since, true).await;
        if full_scan && !matches!(outcome, Ok(RefreshOutcome::Reconciled { .. })) {
            self.lock_state()?.pending_full_scan = true;
        }
        outcome
    }

    pub async fn tick(&self) -> Result<RefreshOutcome, InfraError> {
        let now = self.now();
        let (last, next_due) = {
            let state = self.lock_state()?;
            let last = state.last_reconciled_at;
            let after = last.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let next_due = next_due_occurrence(
                &state.snapshot.schedules,
                after,
                &state.snapshot.settings.default_timezone,
            );
            (last, next_due)
        };
        match next_due {
            Some(due) if now >= due => self.reconcile_and_refresh(now, last, false).await,
            _ => Ok(RefreshOutcome::Skipped(SkipReason::NotDue)),
        }
    }

    pub async fn manual_refresh(&self) -> Result<RefreshOutcome, InfraError> {
        self.reconcile_and_refresh(self.now(), None, true).await
    }

    async fn reconcile_and_refresh(
        &self,
        target: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        force_reload: bool,
    ) -> Result<RefreshOutcome, InfraError> {
        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight) else {
            return Ok(RefreshOutcome::Skipped(SkipReason::InFlight));
        };
        if self
            .lock_state()?
            .last_reconciled_at
            .is_some_and(|last| target <= last)
        {
            return Ok(RefreshOutcome::Skipped(SkipReason::AlreadyReconciled));
        }

        let result = self.reconciler.reconcile(target, since).await?;
        self.lock_state()?.last_reconciled_at = Some(target);

        let reloaded_doses = result.created_count > 0 || force_reload;
        if reloaded_doses {
            let doses = self.dose_repository.list().await?;
            self.lock_state()?.snapshot.doses = doses;
        }
        Ok(RefreshOutcome::Reconciled {
            created_count: result.created_count,
            full_scan: since.is_none(),
            reloaded_doses,
        })
    }

    pub fn project(
        &self,
        lookback_days: u32,
        horizon: FutureHorizon,
        options: &SeriesOptions,
    ) -> Result<ChartSeries, InfraError> {
        let now = self.now();
        let range = ChartRange::resolve(now, lookback_days, horizon).ok_or_else(|| {
            InfraError::InvalidInput(format!(
                "chart range out of bounds: lookback={lookback_days} horizon={}",
                horizon.as_str()
            ))
        })?;
        let state = self.lock_state()?;
        Ok(project_series(
            &state.snapshot,
            &range,
            options,
            state.last_reconciled_at,
        ))
    }
}

impl<D, S, M, P> RefreshController<D, S, M, P>
where
    D: DoseRepository + 'static,
    S: ScheduleRepository + 'static,
    M: MedicationRepository + 'static,
    P: SettingsRepository + 'static,
{
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(controller.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.handle(RefreshTrigger::Tick).await;
            }
        })
    }

    pub fn spawn_trigger(self: &Arc<Self>, trigger: RefreshTrigger) -> JoinHandle<RefreshOutcome> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.handle(trigger).await })
    }
}
