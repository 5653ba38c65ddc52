use crate::domain::models::{Dose, DoseSource, ReconcileResult, ScheduledDoseStatus, Settings};
use crate::domain::recurrence::Recurrence;
use crate::domain::timezone::{format_instant, parse_instant};
use crate::infrastructure::dose_repository::DoseRepository;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::schedule_repository::ScheduleRepository;
use crate::infrastructure::settings_repository::SettingsRepository;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub struct ScheduledDoseReconciler<D, S, P>
where
    D: DoseRepository,
    S: ScheduleRepository,
    P: SettingsRepository,
{
    dose_repository: Arc<D>,
    schedule_repository: Arc<S>,
    settings_repository: Arc<P>,
    now_provider: NowProvider,
    id_generator: IdGenerator,
}

impl<D, S, P> ScheduledDoseReconciler<D, S, P>
where
    D: DoseRepository,
    S: ScheduleRepository,
    P: SettingsRepository,
{
    pub fn new(
        dose_repository: Arc<D>,
        schedule_repository: Arc<S>,
        settings_repository: Arc<P>,
    ) -> Self {
        Self {
            dose_repository,
            schedule_repository,
            settings_repository,
            now_provider: Arc::new(Utc::now),
            id_generator: Arc::new(new_record_id),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_id_generator(mut self, id_generator: IdGenerator) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub async fn reconcile(
        &self,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReconcileResult, InfraError> {
        let settings = self.settings_repository.load_or(Settings::default()).await?;
        let schedules = self.schedule_repository.list().await?;

        let mut pending: Vec<Dose> = Vec::new();
        for schedule in &schedules {
            let Some(recurrence) = Recurrence::for_schedule(schedule, &settings.default_timezone)
            else {
                debug!(
                    "event=reconcile_skip module=reconcile status=ok schedule_id={} enabled={} interval={}",
                    schedule.id, schedule.enabled, schedule.interval
                );
                continue;
            };

            let occurrences: Vec<(DateTime<Utc>, String)> = recurrence
                .due_through(since, now)
                .map(|at| (at, recurrence.key_for(at)))
                .collect();
            if occurrences.is_empty() {
                continue;
            }

            let keys: Vec<String> = occurrences.iter().map(|(_, key)| key.clone()).collect();
            let existing = self.dose_repository.existing_occurrence_keys(&keys).await?;

            let created_at = (self.now_provider)();
            for (at, key) in occurrences {
                if existing.contains(&key) {
                    continue;
                }
                pending.push(Dose {
                    id: (self.id_generator)(),
                    medication_id: schedule.medication_id.clone(),
                    dose_mg: schedule.dose_mg,
                    datetime_iso: format_instant(at),
                    timezone: recurrence.timezone_name().to_string(),
                    created_at,
                    updated_at: created_at,
                    source: Some(DoseSource::Scheduled),
                    schedule_id: Some(schedule.id.clone()),
                    occurrence_key: Some(key),
                    status: Some(ScheduledDoseStatus::AssumedTaken),
                });
            }
        }

        if pending.is_empty() {
            return Ok(ReconcileResult::default());
        }

        let attempted = pending.len();
        let outcome = self.dose_repository.bulk_insert(pending).await?;
        if !outcome.conflicts.is_empty() {
            warn!(
                "event=reconcile_conflict module=reconcile status=ok conflicts={} first_key={}",
                outcome.conflicts.len(),
                outcome.conflicts[0]
            );
        }
        info!(
            "event=reconcile module=reconcile status=ok now={} full_scan={} attempted={} created={}",
            format_instant(now),
            since.is_none(),
            attempted,
            outcome.inserted
        );

        Ok(ReconcileResult {
            created_count: outcome.inserted,
        })
    }

    pub async fn reconcile_iso(
        &self,
        now_iso: &str,
        since_iso: Option<&str>,
    ) -> Result<ReconcileResult, InfraError> {
        let Some(now) = parse_instant(now_iso) else {
            debug!("event=reconcile_skip module=reconcile status=ok reason=invalid_now");
            return Ok(ReconcileResult::default());
        };
        self.reconcile(now, since_iso.and_then(parse_instant)).await
    }
}
