use crate::domain::models::Schedule;
use crate::domain::timezone::{add_days_in, format_instant, local_day_index_in, parse_instant, resolve_tz};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub fn occurrence_key(schedule_id: &str, instant: DateTime<Utc>) -> String {
    format!("{schedule_id}_{}", format_instant(instant))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recurrence {
    schedule_id: String,
    anchor: DateTime<Utc>,
    interval_days: i64,
    timezone: Tz,
}

impl Recurrence {
    pub fn for_schedule(schedule: &Schedule, default_timezone: &str) -> Option<Self> {
        if !schedule.enabled || schedule.interval <= 0 {
            return None;
        }
        let anchor = parse_instant(&schedule.start_datetime_iso)?;
        Some(Self {
            schedule_id: schedule.id.clone(),
            anchor,
            interval_days: i64::from(schedule.interval),
            timezone: resolve_tz(&schedule.timezone, default_timezone),
        })
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    pub fn timezone_name(&self) -> &'static str {
        self.timezone.name()
    }

    pub fn occurrence(&self, index: i64) -> Option<DateTime<Utc>> {
        let days = index.checked_mul(self.interval_days)?;
        add_days_in(self.anchor, days, self.timezone)
    }

    pub fn key_for(&self, instant: DateTime<Utc>) -> String {
        occurrence_key(&self.schedule_id, instant)
    }

    pub fn due_through(
        &self,
        since: Option<DateTime<Utc>>,
        through: DateTime<Utc>,
    ) -> Occurrences<'_> {
        let first = match since {
            Some(bound) => self.first_index_where(bound, |at| at >= bound),
            None => Some(0),
        };
        Occurrences::new(self, first, through)
    }

    pub fn upcoming(&self, after: DateTime<Utc>, through: DateTime<Utc>) -> Occurrences<'_> {
        let first = self.first_index_where(after, |at| at > after);
        Occurrences::new(self, first, through)
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let index = self.first_index_where(after, |at| at > after)?;
        self.occurrence(index)
    }

    // Jumps to the last whole period that starts on or before the bound's
    // local date, then walks forward until `accept` holds.
    fn first_index_where(
        &self,
        bound: DateTime<Utc>,
        accept: impl Fn(DateTime<Utc>) -> bool,
    ) -> Option<i64> {
        let mut index = if bound > self.anchor {
            let diff_days =
                local_day_index_in(bound, self.timezone) - local_day_index_in(self.anchor, self.timezone);
            diff_days.div_euclid(self.interval_days).max(0)
        } else {
            0
        };

        let mut previous: Option<DateTime<Utc>> = None;
        loop {
            let at = self.occurrence(index)?;
            if accept(at) {
                return Some(index);
            }
            if previous.is_some_and(|earlier| at <= earlier) {
                return None;
            }
            previous = Some(at);
            index = index.checked_add(1)?;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Occurrences<'a> {
    recurrence: &'a Recurrence,
    next_index: Option<i64>,
    through: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
}

impl<'a> Occurrences<'a> {
    fn new(recurrence: &'a Recurrence, first_index: Option<i64>, through: DateTime<Utc>) -> Self {
        Self {
            recurrence,
            next_index: first_index,
            through,
            previous: None,
        }
    }
}

impl Iterator for Occurrences<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next_index?;
        let Some(at) = self.recurrence.occurrence(index) else {
            self.next_index = None;
            return None;
        };
        if at > self.through || self.previous.is_some_and(|earlier| at <= earlier) {
            self.next_index = None;
            return None;
        }
        self.previous = Some(at);
        self.next_index = index.checked_add(1);
        Some(at)
    }
}
