use chrono::{DateTime, Datelike, Timelike, Utc};

/// Calendar decomposition of a play timestamp, always taken in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeParts {
    pub hour: i32,
    pub day: i32,
    /// ISO-8601 week number (1..=53).
    pub week: i32,
    pub month: i32,
    /// Calendar year, which can differ from the ISO week-year around new year.
    pub year: i32,
    /// Monday = 0 .. Sunday = 6.
    pub weekday: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Hour,
    Day,
    Week,
    Month,
    Year,
    Weekday,
}

impl TimeParts {
    /// `None` when `millis` is outside the representable calendar range.
    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        let dt: DateTime<Utc> = DateTime::from_timestamp_millis(millis)?;
        Some(Self {
            hour: dt.hour() as i32,
            day: dt.day() as i32,
            week: dt.iso_week().week() as i32,
            month: dt.month() as i32,
            year: dt.year(),
            weekday: dt.weekday().num_days_from_monday() as i32,
        })
    }

    pub fn get(&self, field: TimeField) -> i32 {
        match field {
            TimeField::Hour => self.hour,
            TimeField::Day => self.day,
            TimeField::Week => self.week,
            TimeField::Month => self.month,
            TimeField::Year => self.year,
            TimeField::Weekday => self.weekday,
        }
    }
}
