use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};

/// Abstraction over "current time" so scheduling and one-time codes are
/// deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day in the local timezone. Time of day is discarded.
    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
    today: Option<NaiveDate>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now, today: None }
    }

    /// Pin the calendar day regardless of the host timezone.
    ///
    /// `now()` reports noon UTC on that day.
    pub fn on_date(date: NaiveDate) -> Self {
        let noon = date.and_hms_opt(12, 0, 0).unwrap_or_default();
        Self {
            now: Utc.from_utc_datetime(&noon),
            today: Some(date),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn today(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| self.now.with_timezone(&Local).date_naive())
    }
}
