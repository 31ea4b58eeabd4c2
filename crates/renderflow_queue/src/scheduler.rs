//! Periodic task schedules.
//!
//! Schedules are UTC cron specs (seconds-resolution). The worker runtime
//! polls the set; every due entry yields its task name for enqueueing. A
//! missed window fires once on the next poll rather than replaying backlog.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::debug;

use renderflow_protocol::Settings;

use crate::tasks;

#[derive(Debug, Error)]
#[error("invalid cron spec '{spec}' for {task_name}: {source}")]
pub struct ScheduleError {
    pub task_name: String,
    pub spec: String,
    #[source]
    source: cron::error::Error,
}

pub struct PeriodicEntry {
    pub task_name: String,
    schedule: Schedule,
    last_fired: Option<DateTime<Utc>>,
}

impl PeriodicEntry {
    pub fn new(task_name: &str, spec: &str) -> Result<Self, ScheduleError> {
        let schedule = Schedule::from_str(spec).map_err(|source| ScheduleError {
            task_name: task_name.to_string(),
            spec: spec.to_string(),
            source,
        })?;
        Ok(Self {
            task_name: task_name.to_string(),
            schedule,
            last_fired: None,
        })
    }

    /// Whether the entry is due at `now`, anchored at `epoch` before the
    /// first firing.
    fn due(&self, epoch: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let anchor = self.last_fired.unwrap_or(epoch);
        match self.schedule.after(&anchor).next() {
            Some(next) => next <= now,
            None => false,
        }
    }
}

/// The full recurring schedule of one scheduler process.
pub struct PeriodicSet {
    entries: Vec<PeriodicEntry>,
    epoch: DateTime<Utc>,
}

impl PeriodicSet {
    pub fn new(entries: Vec<PeriodicEntry>) -> Self {
        Self {
            entries,
            epoch: Utc::now(),
        }
    }

    /// The core recurrences, specs taken from configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, ScheduleError> {
        Ok(Self::new(vec![
            PeriodicEntry::new(tasks::TRANSFER_ROUTE_ANALYTICS, &settings.route_transfer_cron)?,
            PeriodicEntry::new(
                tasks::TRANSFER_GENERATION_EVENTS,
                &settings.generation_transfer_cron,
            )?,
            PeriodicEntry::new(
                tasks::AGGREGATE_ROUTE_ANALYTICS_HOURLY,
                &settings.route_rollup_cron,
            )?,
            PeriodicEntry::new(
                tasks::AGGREGATE_GENERATION_METRICS_HOURLY,
                &settings.generation_rollup_cron,
            )?,
            PeriodicEntry::new(tasks::REFRESH_TAG_CARDINALITY, &settings.tag_cardinality_cron)?,
        ]))
    }

    #[cfg(test)]
    fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = epoch;
        self
    }

    /// Task names due at `now`. Firing advances each entry's anchor to `now`.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.due(self.epoch, now) {
                debug!("Schedule due: {}", entry.task_name);
                entry.last_fired = Some(now);
                due.push(entry.task_name.clone());
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn settings_specs_parse() {
        let set = PeriodicSet::from_settings(&Settings::default()).unwrap();
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn invalid_spec_is_rejected() {
        assert!(PeriodicEntry::new("broken", "not a cron").is_err());
    }

    #[test]
    fn ten_minute_schedule_fires_on_boundaries() {
        let epoch = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
        let mut set = PeriodicSet::new(vec![
            PeriodicEntry::new("transfer", "0 */10 * * * *").unwrap(),
        ])
        .with_epoch(epoch);

        // Nothing due one minute in.
        assert!(set
            .poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap())
            .is_empty());

        // Due at the 12:10 boundary.
        let due = set.poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 10, 5).unwrap());
        assert_eq!(due, vec!["transfer".to_string()]);

        // Not due again until the next boundary.
        assert!(set
            .poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 11, 0).unwrap())
            .is_empty());
        let due = set.poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 20, 0).unwrap());
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn hourly_schedule_fires_on_the_hour() {
        let epoch = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let mut set = PeriodicSet::new(vec![
            PeriodicEntry::new("rollup", "0 0 * * * *").unwrap(),
        ])
        .with_epoch(epoch);

        assert!(set
            .poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 59, 59).unwrap())
            .is_empty());
        let due = set.poll(Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 1).unwrap());
        assert_eq!(due, vec!["rollup".to_string()]);
    }

    #[test]
    fn missed_windows_fire_once() {
        let epoch = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
        let mut set = PeriodicSet::new(vec![
            PeriodicEntry::new("transfer", "0 */10 * * * *").unwrap(),
        ])
        .with_epoch(epoch);

        // Three boundaries elapsed; a single catch-up fire.
        let due = set.poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 35, 0).unwrap());
        assert_eq!(due.len(), 1);
        assert!(set
            .poll(Utc.with_ymd_and_hms(2026, 3, 1, 12, 36, 0).unwrap())
            .is_empty());
    }
}
