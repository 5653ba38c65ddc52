use crate::domain::timezone::{is_valid_time_zone, parse_instant, DEFAULT_TIMEZONE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MedicationProfile {
    pub ka_per_hour: f64,
    pub ke_per_hour: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub id: String,
    pub name: String,
    pub ka_per_hour: f64,
    pub ke_per_hour: f64,
    pub scale: f64,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Medication {
    pub fn profile(&self) -> MedicationProfile {
        MedicationProfile {
            ka_per_hour: self.ka_per_hour,
            ke_per_hour: self.ke_per_hour,
            scale: self.scale,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "medication.id")?;
        validate_non_empty(&self.name, "medication.name")?;
        validate_positive(self.ka_per_hour, "medication.ka_per_hour")?;
        validate_positive(self.ke_per_hour, "medication.ke_per_hour")?;
        validate_positive(self.scale, "medication.scale")?;
        Ok(())
    }
}

pub struct MedicationPreset {
    pub name: &'static str,
    pub ka_per_hour: f64,
    pub ke_per_hour: f64,
    pub scale: f64,
    pub notes: &'static str,
}

pub const DEFAULT_MEDICATIONS: &[MedicationPreset] = &[
    MedicationPreset {
        name: "Tirzepatide",
        ka_per_hour: 0.12,
        ke_per_hour: 0.0058,
        scale: 1.0,
        notes: "Approximate PK defaults (t1/2 ≈ 5 days, tmax ≈ 24-36h).",
    },
    MedicationPreset {
        name: "Retatrutide",
        ka_per_hour: 0.1,
        ke_per_hour: 0.0048,
        scale: 1.0,
        notes: "Approximate PK defaults (t1/2 ≈ 6 days, tmax ≈ 24-36h).",
    },
];

impl MedicationPreset {
    pub fn instantiate(&self, id: String, now: DateTime<Utc>) -> Medication {
        Medication {
            id,
            name: self.name.to_string(),
            ka_per_hour: self.ka_per_hour,
            ke_per_hour: self.ke_per_hour,
            scale: self.scale,
            notes: self.notes.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoseEvent {
    pub datetime: DateTime<Utc>,
    pub dose_mg: f64,
    pub medication: MedicationProfile,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseSource {
    Manual,
    Scheduled,
}

impl DoseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledDoseStatus {
    AssumedTaken,
    ConfirmedTaken,
    Skipped,
}

impl ScheduledDoseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssumedTaken => "assumed_taken",
            Self::ConfirmedTaken => "confirmed_taken",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "assumed_taken" => Some(Self::AssumedTaken),
            "confirmed_taken" => Some(Self::ConfirmedTaken),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
    Custom,
}

impl ScheduleFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub medication_id: String,
    pub start_datetime_iso: String,
    pub timezone: String,
    pub dose_mg: f64,
    pub frequency: ScheduleFrequency,
    pub interval: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "schedule.id")?;
        validate_non_empty(&self.medication_id, "schedule.medication_id")?;
        validate_instant(&self.start_datetime_iso, "schedule.start_datetime_iso")?;
        if !is_valid_time_zone(&self.timezone) {
            return Err("schedule.timezone must be a known IANA zone".to_string());
        }
        validate_positive(self.dose_mg, "schedule.dose_mg")?;
        if self.interval <= 0 {
            return Err("schedule.interval must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dose {
    pub id: String,
    pub medication_id: String,
    pub dose_mg: f64,
    pub datetime_iso: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source: Option<DoseSource>,
    pub schedule_id: Option<String>,
    pub occurrence_key: Option<String>,
    pub status: Option<ScheduledDoseStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DoseUpdate {
    pub medication_id: Option<String>,
    pub dose_mg: Option<f64>,
    pub datetime_iso: Option<String>,
    pub timezone: Option<String>,
}

impl Dose {
    pub fn is_scheduled(&self) -> bool {
        self.source == Some(DoseSource::Scheduled)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "dose.id")?;
        validate_non_empty(&self.medication_id, "dose.medication_id")?;
        validate_positive(self.dose_mg, "dose.dose_mg")?;
        validate_instant(&self.datetime_iso, "dose.datetime_iso")?;
        validate_non_empty(&self.timezone, "dose.timezone")?;
        if self.is_scheduled()
            && (self.schedule_id.is_none()
                || self.occurrence_key.is_none()
                || self.status.is_none())
        {
            return Err(
                "scheduled dose must carry dose.schedule_id, dose.occurrence_key and dose.status"
                    .to_string(),
            );
        }
        Ok(())
    }

    // Returns true when a scheduled dose was detached from its schedule.
    pub fn apply_update(&mut self, update: &DoseUpdate, updated_at: DateTime<Utc>) -> bool {
        let datetime_changed = update
            .datetime_iso
            .as_deref()
            .is_some_and(|value| !same_instant(value, &self.datetime_iso));
        let medication_changed = update
            .medication_id
            .as_deref()
            .is_some_and(|value| value != self.medication_id);
        let dose_changed = update.dose_mg.is_some_and(|value| value != self.dose_mg);
        let detach = self.is_scheduled() && (datetime_changed || medication_changed || dose_changed);

        if let Some(medication_id) = &update.medication_id {
            self.medication_id = medication_id.clone();
        }
        if let Some(dose_mg) = update.dose_mg {
            self.dose_mg = dose_mg;
        }
        if let Some(datetime_iso) = &update.datetime_iso {
            self.datetime_iso = datetime_iso.clone();
        }
        if let Some(timezone) = &update.timezone {
            self.timezone = timezone.clone();
        }
        if detach {
            self.source = Some(DoseSource::Manual);
            self.schedule_id = None;
            self.occurrence_key = None;
            self.status = None;
        }
        self.updated_at = updated_at;
        detach
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub default_timezone: String,
    pub chart_sample_minutes: u32,
    pub default_lookback_days: u32,
    pub default_future_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timezone: DEFAULT_TIMEZONE.to_string(),
            chart_sample_minutes: 60,
            default_lookback_days: 30,
            default_future_days: 7,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_time_zone(&self.default_timezone) {
            return Err("settings.default_timezone must be a known IANA zone".to_string());
        }
        if self.chart_sample_minutes == 0 {
            return Err("settings.chart_sample_minutes must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReconcileResult {
    pub created_count: usize,
}

fn same_instant(left: &str, right: &str) -> bool {
    match (parse_instant(left), parse_instant(right)) {
        (Some(left), Some(right)) => left == right,
        _ => left == right,
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn validate_positive(value: f64, field_name: &str) -> Result<(), String> {
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("{field_name} must be a positive number"));
    }
    Ok(())
}

fn validate_instant(value: &str, field_name: &str) -> Result<(), String> {
    if parse_instant(value).is_none() {
        return Err(format!("{field_name} must be an RFC 3339 instant"));
    }
    Ok(())
}
