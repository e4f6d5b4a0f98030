//! Schedule spec parsing and occurrence projection
//!
//! RRULE uses standard iCalendar semantics in the workflow's timezone.
//! Cron accepts the 5-field POSIX form (a 0 seconds field is prepended for
//! the parser) plus the parser's predefined macros. Interval is a positive
//! millisecond period; once is an RFC 3339 instant.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use watchflow_core::model::ScheduleKind;

use crate::error::{EngineError, Result};

/// A validated schedule, ready for occurrence projection
#[derive(Debug, Clone)]
pub struct ParsedSchedule {
    kind: ScheduleKind,
    tz: Tz,
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    Rrule(String),
    Cron(Box<cron::Schedule>),
    Interval(Duration),
    Once(DateTime<Utc>),
    None,
}

impl ParsedSchedule {
    pub fn parse(kind: ScheduleKind, spec: Option<&str>, timezone: &str) -> Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| EngineError::validation(format!("unknown timezone: {timezone}")))?;

        let inner = match kind {
            ScheduleKind::None => Inner::None,
            ScheduleKind::Rrule => {
                let spec = required(kind, spec)?;
                // Build once against the current instant to validate
                build_rrule(spec, Utc::now(), tz)?;
                Inner::Rrule(spec.to_string())
            }
            ScheduleKind::Cron => {
                let spec = required(kind, spec)?;
                let normalized = normalize_cron(spec);
                let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
                    EngineError::validation(format!("invalid cron expression {spec:?}: {e}"))
                })?;
                Inner::Cron(Box::new(schedule))
            }
            ScheduleKind::Interval => {
                let spec = required(kind, spec)?;
                let ms: u64 = spec.trim().parse().map_err(|_| {
                    EngineError::validation(format!("invalid interval millis: {spec:?}"))
                })?;
                if ms == 0 {
                    return Err(EngineError::validation("interval must be positive"));
                }
                Inner::Interval(Duration::from_millis(ms))
            }
            ScheduleKind::Once => {
                let spec = required(kind, spec)?;
                let at = DateTime::parse_from_rfc3339(spec.trim())
                    .map_err(|e| {
                        EngineError::validation(format!("invalid instant {spec:?}: {e}"))
                    })?
                    .with_timezone(&Utc);
                Inner::Once(at)
            }
        };

        Ok(Self { kind, tz, inner })
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    /// Fixed period, for interval schedules
    pub fn interval(&self) -> Option<Duration> {
        match &self.inner {
            Inner::Interval(period) => Some(*period),
            _ => None,
        }
    }

    /// The single firing instant, for once schedules
    pub fn once_at(&self) -> Option<DateTime<Utc>> {
        match &self.inner {
            Inner::Once(at) => Some(*at),
            _ => None,
        }
    }

    /// The next firing strictly after the given instant
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.inner {
            Inner::None => None,
            Inner::Once(at) => (*at > after).then_some(*at),
            Inner::Interval(period) => {
                Some(after + chrono::Duration::from_std(*period).ok()?)
            }
            Inner::Cron(schedule) => {
                let local = after.with_timezone(&self.tz);
                schedule.after(&local).next().map(|d| d.with_timezone(&Utc))
            }
            Inner::Rrule(spec) => {
                let set = build_rrule(spec, after, self.tz).ok()?;
                let result = set.all(3);
                result
                    .dates
                    .into_iter()
                    .map(|d| d.with_timezone(&Utc))
                    .find(|d| *d > after)
            }
        }
    }

    /// Up to `limit` firings inside the window
    pub fn occurrences(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut cursor = from;
        while out.len() < limit {
            match self.next_after(cursor) {
                Some(next) if next <= until => {
                    out.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }
        out
    }
}

fn required(kind: ScheduleKind, spec: Option<&str>) -> Result<&str> {
    spec.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
        EngineError::validation(format!("schedule kind {} requires a spec", kind.as_str()))
    })
}

/// Accept 5-field POSIX cron by pinning seconds to 0; macros pass through
fn normalize_cron(spec: &str) -> String {
    let trimmed = spec.trim();
    if trimmed.starts_with('@') {
        return trimmed.to_string();
    }
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn build_rrule(spec: &str, dtstart: DateTime<Utc>, tz: Tz) -> Result<rrule::RRuleSet> {
    let rule: rrule::RRule<rrule::Unvalidated> = spec
        .parse()
        .map_err(|e| EngineError::validation(format!("invalid rrule {spec:?}: {e}")))?;
    let start = dtstart.with_timezone(&rrule::Tz::Tz(tz));
    rule.build(start)
        .map_err(|e| EngineError::validation(format!("invalid rrule {spec:?}: {e}")))
}
