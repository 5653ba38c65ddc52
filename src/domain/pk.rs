use crate::domain::models::DoseEvent;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const KA_KE_EPSILON: f64 = 1e-8;
const MILLIS_PER_HOUR: f64 = 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct AmountSample {
    pub t: DateTime<Utc>,
    pub amount_mg: f64,
}

pub fn amount_from_dose_at_time(dose: &DoseEvent, t: DateTime<Utc>) -> f64 {
    let elapsed_ms = (t - dose.datetime).num_milliseconds();
    amount_from_dose_at_delta_hours(dose, elapsed_ms as f64 / MILLIS_PER_HOUR)
}

pub fn amount_from_dose_at_delta_hours(dose: &DoseEvent, dt_hours: f64) -> f64 {
    if dt_hours < 0.0 {
        return 0.0;
    }

    let ka = dose.medication.ka_per_hour;
    let ke = dose.medication.ke_per_hour;
    let base = dose.dose_mg * dose.medication.scale;
    let ka_minus_ke = ka - ke;

    let amount = if ka_minus_ke.abs() < KA_KE_EPSILON {
        base * (ka * dt_hours) * (-ka * dt_hours).exp()
    } else {
        base * (ka / ka_minus_ke) * ((-ke * dt_hours).exp() - (-ka * dt_hours).exp())
    };

    clamp_non_negative(amount)
}

pub fn total_amount_at_time(doses: &[DoseEvent], t: DateTime<Utc>) -> f64 {
    doses
        .iter()
        .map(|dose| amount_from_dose_at_time(dose, t))
        .sum()
}

pub fn sample_times(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sample_minutes: i64,
) -> Vec<DateTime<Utc>> {
    if sample_minutes <= 0 || end < start {
        return Vec::new();
    }
    let Some(step) = Duration::try_minutes(sample_minutes) else {
        return Vec::new();
    };

    let mut times = Vec::new();
    let mut current = start;
    while current <= end {
        times.push(current);
        match current.checked_add_signed(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    times
}

pub fn generate_time_series(
    doses: &[DoseEvent],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sample_minutes: i64,
) -> Vec<AmountSample> {
    sample_times(start, end, sample_minutes)
        .into_iter()
        .map(|t| AmountSample {
            t,
            amount_mg: total_amount_at_time(doses, t),
        })
        .collect()
}

fn clamp_non_negative(value: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        0.0
    } else {
        value
    }
}
