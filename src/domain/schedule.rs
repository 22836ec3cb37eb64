use crate::domain::model::SendoutId;
use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    Automated(AutomatedSchedule),
    Recurring(RecurringSchedule),
}

/// Unit used for automated trigger delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Minutes,
    Hours,
    #[default]
    Days,
    Weeks,
    Months,
}

impl DelayUnit {
    pub fn offset(&self, from: DateTime<Utc>, count: u32) -> Option<DateTime<Utc>> {
        let count = i64::from(count);
        match self {
            DelayUnit::Minutes => from.checked_add_signed(Duration::minutes(count)),
            DelayUnit::Hours => from.checked_add_signed(Duration::hours(count)),
            DelayUnit::Days => from.checked_add_signed(Duration::days(count)),
            DelayUnit::Weeks => from.checked_add_signed(Duration::weeks(count)),
            DelayUnit::Months => from.checked_add_months(Months::new(count as u32)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// `from + steps` units. Month arithmetic clamps to the end of shorter
    /// months, so offsets must always be taken from the anchor.
    pub fn offset(&self, from: DateTime<Utc>, steps: u32) -> Option<DateTime<Utc>> {
        let unit = match self {
            Frequency::Hourly => DelayUnit::Hours,
            Frequency::Daily => DelayUnit::Days,
            Frequency::Weekly => DelayUnit::Weeks,
            Frequency::Monthly => DelayUnit::Months,
        };
        unit.offset(from, steps)
    }
}

/// Restricts when a schedule may fire within a day and week.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendWindow {
    pub days_of_week: Vec<Weekday>,
    pub time_of_day: Option<NaiveTime>,
}

impl SendWindow {
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        let day_ok = self.days_of_week.is_empty() || self.days_of_week.contains(&now.weekday());
        let time_ok = self.time_of_day.map_or(true, |t| now.time() >= t);
        day_ok && time_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AutomatedTrigger {
    /// Counted from the moment the contact joined the qualifying list.
    #[default]
    Subscribed,
    /// Counted from the delivery of an earlier sendout in a sequence.
    SendoutDelivered { sendout_id: SendoutId },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomatedSchedule {
    pub trigger: AutomatedTrigger,
    pub time_delay: u32,
    pub time_delay_unit: DelayUnit,
    pub end_date: Option<DateTime<Utc>>,
    pub window: SendWindow,
}

impl AutomatedSchedule {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.end_date.map_or(true, |end| now <= end) && self.window.allows(now)
    }

    /// Whether `now` is at least the configured delay past the trigger event.
    pub fn is_triggered(&self, trigger_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.time_delay_unit
            .offset(trigger_time, self.time_delay)
            .is_some_and(|due| now >= due)
    }
}

fn default_interval() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub frequency: Frequency,
    #[serde(default = "default_interval")]
    pub interval: u32,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Completed runs. The next occurrence is derived from it.
    #[serde(default)]
    pub runs: u32,
    #[serde(default)]
    pub can_send_to_contacts_multiple_times: bool,
    #[serde(default)]
    pub window: SendWindow,
}

impl RecurringSchedule {
    pub fn new(frequency: Frequency, start_date: DateTime<Utc>) -> Self {
        Self {
            frequency,
            interval: 1,
            start_date,
            end_date: None,
            max_runs: None,
            runs: 0,
            can_send_to_contacts_multiple_times: false,
            window: SendWindow::default(),
        }
    }

    pub fn occurrence(&self, index: u32) -> Option<DateTime<Utc>> {
        let steps = self.interval.max(1).checked_mul(index)?;
        self.frequency.offset(self.start_date, steps)
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.occurrence(self.runs)
    }

    pub fn is_exhausted(&self) -> bool {
        if self.max_runs.is_some_and(|max| self.runs >= max) {
            return true;
        }
        match (self.next_run(), self.end_date) {
            (None, _) => true,
            (Some(next), Some(end)) => next > end,
            (Some(_), None) => false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_exhausted()
            && self.next_run().is_some_and(|next| now >= next)
            && self.window.allows(now)
    }

    /// Records a finished run and returns the next occurrence. Only one
    /// occurrence is consumed per call, however far behind the schedule is.
    pub fn advance(&mut self) -> Option<DateTime<Utc>> {
        self.runs = self.runs.saturating_add(1);
        self.next_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_missed_occurrences_catch_up_one_at_a_time() {
        let mut schedule = RecurringSchedule::new(Frequency::Daily, at(2024, 1, 1));
        let now = at(2024, 1, 5);

        assert!(schedule.is_due(now));
        assert_eq!(schedule.advance(), Some(at(2024, 1, 2)));

        assert!(schedule.is_due(now));
        assert_eq!(schedule.advance(), Some(at(2024, 1, 3)));
    }

    #[test]
    fn test_not_due_before_next_occurrence() {
        let mut schedule = RecurringSchedule::new(Frequency::Weekly, at(2024, 1, 1));
        schedule.runs = 1;
        assert!(!schedule.is_due(at(2024, 1, 7)));
        assert!(schedule.is_due(at(2024, 1, 8)));
    }

    #[test]
    fn test_monthly_is_anchored_to_start() {
        let mut schedule = RecurringSchedule::new(Frequency::Monthly, at(2024, 1, 31));
        assert_eq!(schedule.advance(), Some(at(2024, 2, 29)));
        assert_eq!(schedule.advance(), Some(at(2024, 3, 31)));
    }

    #[test]
    fn test_interval_multiplies_steps() {
        let mut schedule = RecurringSchedule::new(Frequency::Hourly, at(2024, 1, 1));
        schedule.interval = 6;
        assert_eq!(schedule.advance(), Some(at(2024, 1, 1) + Duration::hours(6)));
    }

    #[test]
    fn test_run_and_end_constraints() {
        let mut schedule = RecurringSchedule::new(Frequency::Daily, at(2024, 1, 1));
        schedule.max_runs = Some(2);
        schedule.advance();
        assert!(!schedule.is_exhausted());
        schedule.advance();
        assert!(schedule.is_exhausted());
        assert!(!schedule.is_due(at(2024, 2, 1)));

        let mut schedule = RecurringSchedule::new(Frequency::Daily, at(2024, 1, 1));
        schedule.end_date = Some(at(2024, 1, 2));
        schedule.advance();
        assert!(schedule.is_due(at(2024, 1, 3)));
        schedule.advance();
        assert!(schedule.is_exhausted());
    }

    #[test]
    fn test_send_window() {
        let window = SendWindow {
            days_of_week: vec![Weekday::Mon],
            time_of_day: NaiveTime::from_hms_opt(9, 0, 0),
        };
        // 2024-01-01 is a Monday
        assert!(!window.allows(at(2024, 1, 1)));
        assert!(window.allows(at(2024, 1, 1) + Duration::hours(10)));
        assert!(!window.allows(at(2024, 1, 2) + Duration::hours(10)));
    }

    #[test]
    fn test_automated_trigger_delay() {
        let schedule = AutomatedSchedule {
            time_delay: 3,
            time_delay_unit: DelayUnit::Days,
            ..Default::default()
        };
        let joined = at(2024, 1, 1);
        assert!(!schedule.is_triggered(joined, at(2024, 1, 3)));
        assert!(schedule.is_triggered(joined, at(2024, 1, 4)));
    }

    #[test]
    fn test_schedule_json_shape() {
        let json = serde_json::json!({
            "type": "recurring",
            "frequency": "daily",
            "start_date": "2024-01-01T00:00:00Z"
        });
        let schedule: Schedule = serde_json::from_value(json).unwrap();
        match schedule {
            Schedule::Recurring(r) => {
                assert_eq!(r.interval, 1);
                assert_eq!(r.next_run(), Some(at(2024, 1, 1)));
            }
            other => panic!("unexpected schedule {other:?}"),
        }
    }
}
