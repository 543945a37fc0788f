//! Business-day arithmetic for SLA deadlines, plus the clock the engine reads.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Timelike, Utc,
    Weekday,
};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Source of "now" for timestamps and deadline arithmetic.
#[cfg_attr(any(test, feature = "testing"), automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Computes due dates that skip non-working days.
pub trait DeadlineCalculator: Send + Sync {
    /// Deadline `business_days` working days out, at `cutoff_hour` local time.
    ///
    /// A start at or after the cutoff counts from the next business day.
    fn deadline_with_cutoff(&self, start: DateTime<Utc>, business_days: u32, cutoff_hour: u32) -> DateTime<Utc>;

    /// `start` moved forward by `n` business days, time of day unchanged.
    fn add_business_days(&self, start: DateTime<Utc>, n: u32) -> DateTime<Utc>;
}

/// Weekends and configured holidays are non-working days in a fixed local offset.
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    offset: FixedOffset,
    holidays: HashSet<NaiveDate>,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::new(7, Vec::new())
    }
}

impl BusinessCalendar {
    pub fn new(utc_offset_hours: i32, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_hours.clamp(-23, 23) * 3600)
            .unwrap_or_else(|| Utc.fix());
        Self {
            offset,
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn next_business_day(&self, mut date: NaiveDate) -> NaiveDate {
        loop {
            date = date.succ_opt().unwrap_or(NaiveDate::MAX);
            if self.is_business_day(date) || date == NaiveDate::MAX {
                return date;
            }
        }
    }

    fn add_business_dates(&self, mut date: NaiveDate, n: u32) -> NaiveDate {
        for _ in 0..n {
            date = self.next_business_day(date);
        }
        date
    }

    fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

impl DeadlineCalculator for BusinessCalendar {
    fn deadline_with_cutoff(&self, start: DateTime<Utc>, business_days: u32, cutoff_hour: u32) -> DateTime<Utc> {
        let cutoff_hour = cutoff_hour.min(23);
        let local = start.with_timezone(&self.offset);

        let today = local.date_naive();
        let count_from = if local.hour() >= cutoff_hour || !self.is_business_day(today) {
            self.next_business_day(today)
        } else {
            today
        };
        let due = self.add_business_dates(count_from, business_days.saturating_sub(1));
        let cutoff = NaiveTime::from_hms_opt(cutoff_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        self.to_utc(due, cutoff)
    }

    fn add_business_days(&self, start: DateTime<Utc>, n: u32) -> DateTime<Utc> {
        let local = start.with_timezone(&self.offset);
        let date = self.add_business_dates(local.date_naive(), n);
        self.to_utc(date, local.time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn before_cutoff_counts_the_same_day() {
        let calendar = BusinessCalendar::default();
        // Thursday 10:00 -> Thu, Fri, Mon
        let deadline = calendar.deadline_with_cutoff(local(2024, 1, 4, 10), 3, 17);
        assert_eq!(deadline, local(2024, 1, 8, 17));
    }

    #[test]
    fn at_or_after_cutoff_counts_from_next_business_day() {
        let calendar = BusinessCalendar::default();
        let deadline = calendar.deadline_with_cutoff(local(2024, 1, 4, 17), 3, 17);
        assert_eq!(deadline, local(2024, 1, 9, 17));
    }

    #[test]
    fn holidays_are_skipped() {
        let holiday = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let calendar = BusinessCalendar::new(7, [holiday]);
        assert!(!calendar.is_business_day(holiday));
        let deadline = calendar.deadline_with_cutoff(local(2024, 1, 4, 9), 2, 17);
        assert_eq!(deadline, local(2024, 1, 8, 17));
    }

    #[test]
    fn weekend_start_counts_from_monday() {
        let calendar = BusinessCalendar::default();
        // Saturday 09:00 -> Mon, Tue
        let deadline = calendar.deadline_with_cutoff(local(2024, 1, 6, 9), 2, 17);
        assert_eq!(deadline, local(2024, 1, 9, 17));
    }

    #[test]
    fn zero_days_is_due_at_cutoff() {
        let calendar = BusinessCalendar::default();
        assert_eq!(
            calendar.deadline_with_cutoff(local(2024, 1, 4, 9), 0, 17),
            local(2024, 1, 4, 17)
        );
    }

    #[test]
    fn add_business_days_keeps_time_of_day() {
        let calendar = BusinessCalendar::default();
        // Friday + 1 -> Monday
        assert_eq!(
            calendar.add_business_days(local(2024, 1, 5, 14), 1),
            local(2024, 1, 8, 14)
        );
    }

    #[test]
    fn manual_clock_advances() {
        let start = local(2024, 1, 1, 0);
        let clock = ManualClock::new(start);
        clock.advance(Duration::days(3));
        assert_eq!(clock.now(), start + Duration::days(3));
    }

    #[test]
    fn clock_can_be_mocked() {
        let mut clock = MockClock::new();
        let fixed = local(2024, 2, 1, 8);
        clock.expect_now().return_const(fixed);
        assert_eq!(clock.now(), fixed);
    }
}
