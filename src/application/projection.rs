use crate::domain::models::{Dose, DoseEvent, Medication, MedicationProfile, Schedule, Settings};
use crate::domain::pk::{sample_times, total_amount_at_time};
use crate::domain::recurrence::Recurrence;
use crate::domain::timezone::parse_instant;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const LOOKBACK_DAY_OPTIONS: [u32; 4] = [7, 30, 90, 365];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FutureHorizon {
    #[serde(rename = "0d")]
    None,
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "10d")]
    Days10,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "4mo")]
    Months4,
}

impl FutureHorizon {
    pub const ALL: [FutureHorizon; 5] = [
        Self::None,
        Self::Days7,
        Self::Days10,
        Self::Days30,
        Self::Months4,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "0d",
            Self::Days7 => "7d",
            Self::Days10 => "10d",
            Self::Days30 => "30d",
            Self::Months4 => "4mo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|horizon| horizon.as_str() == value)
    }

    pub fn nominal_days(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Days7 => 7,
            Self::Days10 => 10,
            Self::Days30 => 30,
            Self::Months4 => 120,
        }
    }

    pub fn from_default_future_days(days: u32) -> Self {
        Self::ALL
            .into_iter()
            .find(|horizon| horizon.nominal_days() == days)
            .unwrap_or(Self::Days7)
    }

    pub fn end_from(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Months4 => now.checked_add_months(Months::new(4)),
            other => now.checked_add_signed(Duration::try_days(i64::from(other.nominal_days()))?),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ChartRange {
    pub start: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ChartRange {
    pub fn resolve(now: DateTime<Utc>, lookback_days: u32, horizon: FutureHorizon) -> Option<Self> {
        let start = now.checked_sub_signed(Duration::try_days(i64::from(lookback_days))?)?;
        Some(Self {
            start,
            now,
            end: horizon.end_from(now)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesOptions {
    pub visible_medication_ids: Option<HashSet<String>>,
    pub include_total: bool,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            visible_medication_ids: None,
            include_total: true,
        }
    }
}

impl SeriesOptions {
    fn shows(&self, medication_id: &str) -> bool {
        self.visible_medication_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(medication_id))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct SplitValue {
    pub past: Option<f64>,
    pub future: Option<f64>,
}

impl SplitValue {
    pub fn at(t: DateTime<Utc>, now: DateTime<Utc>, amount_mg: f64) -> Self {
        if t <= now {
            Self {
                past: Some(amount_mg),
                future: None,
            }
        } else {
            Self {
                past: None,
                future: Some(amount_mg),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesPoint {
    pub t: DateTime<Utc>,
    pub medications: BTreeMap<String, SplitValue>,
    pub total: Option<SplitValue>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartSeries {
    pub range: ChartRange,
    pub sample_minutes: u32,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSnapshot {
    pub medications: Vec<Medication>,
    pub doses: Vec<Dose>,
    pub schedules: Vec<Schedule>,
    pub settings: Settings,
}

fn profiles_by_id(medications: &[Medication]) -> HashMap<&str, MedicationProfile> {
    medications
        .iter()
        .map(|medication| (medication.id.as_str(), medication.profile()))
        .collect()
}

pub fn dose_events_by_medication(
    doses: &[Dose],
    medications: &[Medication],
) -> HashMap<String, Vec<DoseEvent>> {
    let profiles = profiles_by_id(medications);
    let mut grouped: HashMap<String, Vec<DoseEvent>> = HashMap::new();
    for dose in doses {
        let Some(profile) = profiles.get(dose.medication_id.as_str()) else {
            continue;
        };
        let Some(datetime) = parse_instant(&dose.datetime_iso) else {
            continue;
        };
        grouped
            .entry(dose.medication_id.clone())
            .or_default()
            .push(DoseEvent {
                datetime,
                dose_mg: dose.dose_mg,
                medication: *profile,
            });
    }
    grouped
}

pub fn future_schedule_events(
    schedules: &[Schedule],
    medications: &[Medication],
    materialized_keys: &HashSet<&str>,
    after: DateTime<Utc>,
    end: DateTime<Utc>,
    default_timezone: &str,
) -> HashMap<String, Vec<DoseEvent>> {
    let profiles = profiles_by_id(medications);
    let mut grouped: HashMap<String, Vec<DoseEvent>> = HashMap::new();
    for schedule in schedules {
        let Some(profile) = profiles.get(schedule.medication_id.as_str()) else {
            continue;
        };
        let Some(recurrence) = Recurrence::for_schedule(schedule, default_timezone) else {
            continue;
        };
        let events: Vec<DoseEvent> = recurrence
            .upcoming(after, end)
            .filter(|at| !materialized_keys.contains(recurrence.key_for(*at).as_str()))
            .map(|datetime| DoseEvent {
                datetime,
                dose_mg: schedule.dose_mg,
                medication: *profile,
            })
            .collect();
        if !events.is_empty() {
            grouped
                .entry(schedule.medication_id.clone())
                .or_default()
                .extend(events);
        }
    }
    grouped
}

pub fn time_points(range: &ChartRange, sample_minutes: u32) -> Vec<DateTime<Utc>> {
    let mut points = sample_times(range.start, range.end, i64::from(sample_minutes));
    if points.is_empty() {
        return points;
    }
    if !points.contains(&range.now) {
        points.push(range.now);
        points.sort();
        points.dedup();
    }
    points
}

pub fn project_series(
    snapshot: &DataSnapshot,
    range: &ChartRange,
    options: &SeriesOptions,
    reconciled_through: Option<DateTime<Utc>>,
) -> ChartSeries {
    let sample_minutes = snapshot.settings.chart_sample_minutes;
    let boundary = reconciled_through.map_or(range.now, |at| at.min(range.now));
    let materialized_keys: HashSet<&str> = snapshot
        .doses
        .iter()
        .filter_map(|dose| dose.occurrence_key.as_deref())
        .collect();

    let mut events = dose_events_by_medication(&snapshot.doses, &snapshot.medications);
    for (medication_id, projected) in future_schedule_events(
        &snapshot.schedules,
        &snapshot.medications,
        &materialized_keys,
        boundary,
        range.end,
        &snapshot.settings.default_timezone,
    ) {
        events.entry(medication_id).or_default().extend(projected);
    }

    let visible: Vec<&Medication> = snapshot
        .medications
        .iter()
        .filter(|medication| options.shows(&medication.id))
        .collect();
    let all_events: Vec<DoseEvent> = events.values().flatten().cloned().collect();
    let empty: Vec<DoseEvent> = Vec::new();

    let points = time_points(range, sample_minutes)
        .into_iter()
        .map(|t| {
            let medications = visible
                .iter()
                .map(|medication| {
                    let doses = events.get(&medication.id).unwrap_or(&empty);
                    (
                        medication.id.clone(),
                        SplitValue::at(t, range.now, total_amount_at_time(doses, t)),
                    )
                })
                .collect();
            let total = options
                .include_total
                .then(|| SplitValue::at(t, range.now, total_amount_at_time(&all_events, t)));
            SeriesPoint {
                t,
                medications,
                total,
            }
        })
        .collect();

    ChartSeries {
        range: *range,
        sample_minutes,
        points,
    }
}
