//! Log partition enumeration.
//!
//! Audit-trail logs are stored under date (optionally hour) partitions such as
//! `AWSLogs/<account>/CloudTrail/<region>/2024/06/15/`. The storage service
//! stamps objects in UTC while the trail may bucket events under a different
//! offset or deliver them late, so a landing time maps to several candidate
//! partitions around the same day.

use chrono::format::{Item, Numeric, StrftimeItems};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use std::fmt::{self, Write};
use thiserror::Error;

/// Errors raised while validating a log path template
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("log path template is empty")]
    Empty,

    #[error("log path template '{0}' contains an unsupported format specifier")]
    InvalidSpecifier(String),
}

/// One date (or date + hour) partition of the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogPartitionKey {
    pub date: NaiveDate,
    pub hour: Option<u32>,
}

impl LogPartitionKey {
    /// Point in time used to render this partition through a template
    fn as_datetime(&self) -> NaiveDateTime {
        let time = self
            .hour
            .and_then(|h| NaiveTime::from_hms_opt(h, 0, 0))
            .unwrap_or_default();
        NaiveDateTime::new(self.date, time)
    }
}

impl fmt::Display for LogPartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hour {
            Some(hour) => write!(f, "{}T{:02}", self.date.format("%Y-%m-%d"), hour),
            None => write!(f, "{}", self.date.format("%Y-%m-%d")),
        }
    }
}

/// A strftime-style template turning a partition into a key prefix.
///
/// Example: `AWSLogs/123456789012/CloudTrail/us-east-1/%Y/%m/%d/`. Use `%-d`
/// for stores that write the day without zero padding. A template containing
/// an hour specifier produces hourly partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPathTemplate {
    raw: String,
    hourly: bool,
}

impl LogPathTemplate {
    /// Parse and validate a template.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        if raw.trim().is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut hourly = false;
        for item in StrftimeItems::new(raw) {
            match item {
                Item::Error => return Err(TemplateError::InvalidSpecifier(raw.to_string())),
                Item::Numeric(Numeric::Hour | Numeric::Hour12, _) => hourly = true,
                _ => {}
            }
        }

        // Specifiers such as %z parse but cannot render a naive timestamp.
        let sample = NaiveDateTime::default();
        let mut rendered = String::new();
        if write!(rendered, "{}", sample.format(raw)).is_err() {
            return Err(TemplateError::InvalidSpecifier(raw.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            hourly,
        })
    }

    /// Whether partitions include the hour
    pub fn is_hourly(&self) -> bool {
        self.hourly
    }

    /// The template as configured
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Render a partition into a key prefix.
    pub fn render(&self, partition: &LogPartitionKey) -> String {
        partition.as_datetime().format(&self.raw).to_string()
    }
}

/// Enumerate the partitions to search for an object that landed at
/// `reference`, in search order.
///
/// Offsets are applied in the order given (the default `[0, -1, 1]` yields
/// same day, previous day, next day). For hourly templates `hour_offsets` is
/// applied inside every day offset, so the hours around the landing hour are
/// searched before moving to the next day. Repeated partitions are searched
/// once.
pub fn enumerate_partitions(
    reference: DateTime<Utc>,
    day_offsets: &[i64],
    hour_offsets: Option<&[i64]>,
) -> Vec<LogPartitionKey> {
    let mut partitions: Vec<LogPartitionKey> = Vec::new();

    for day in day_offsets {
        match hour_offsets {
            None => {
                let Some(date) = reference.date_naive().checked_add_signed(Duration::days(*day))
                else {
                    continue;
                };
                push_unique(&mut partitions, LogPartitionKey { date, hour: None });
            }
            Some(hours) => {
                for hour in hours {
                    let Some(at) = reference
                        .checked_add_signed(Duration::days(*day))
                        .and_then(|t| t.checked_add_signed(Duration::hours(*hour)))
                    else {
                        continue;
                    };
                    push_unique(
                        &mut partitions,
                        LogPartitionKey {
                            date: at.date_naive(),
                            hour: Some(at.hour()),
                        },
                    );
                }
            }
        }
    }

    partitions
}

fn push_unique(partitions: &mut Vec<LogPartitionKey>, key: LogPartitionKey) {
    if !partitions.contains(&key) {
        partitions.push(key);
    }
}
