//! The queue-processing schedule.
//!
//! `deleter_queueprocinterval` accepts either a named interval
//! (`minutely`/`hourly`/`daily`/`weekly`/`monthly`) or, with the `cron`
//! feature, a five-field crontab expression. Crontab expressions get a
//! seconds field prepended internally, derived from the process id, so a
//! fleet of pool hosts sharing one configuration does not stampede the tape
//! server at the exact same instant.
//!
//! Named intervals work without the cron parser through rollover detection:
//! the smallest time field that distinguishes the interval is formatted
//! each tick, and processing fires when the formatted value changes.

use std::fmt;

use chrono::{DateTime, Local};

/// Errors parsing the schedule specification.
#[derive(Debug)]
pub struct ScheduleError(String);

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid deleter_queueprocinterval: {}", self.0)
    }
}

impl std::error::Error for ScheduleError {}

/// Named rollover intervals and their distinguishing strftime field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Named {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Named {
    fn parse(spec: &str) -> Option<Self> {
        match spec {
            "minutely" => Some(Self::Minutely),
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    /// The smallest strftime field whose change marks a new interval.
    fn format(self) -> &'static str {
        match self {
            Self::Minutely => "%M",
            Self::Hourly => "%H",
            Self::Daily => "%d",
            Self::Weekly => "%U",
            Self::Monthly => "%m",
        }
    }
}

enum Kind {
    Named { interval: Named, last: Option<String> },
    #[cfg(feature = "cron")]
    Cron {
        schedule: cron::Schedule,
        next: Option<DateTime<Local>>,
    },
}

/// A parsed schedule with per-tick due checking.
pub struct Schedule {
    kind: Kind,
}

impl Schedule {
    /// Parses the configured interval specification.
    ///
    /// # Errors
    ///
    /// Unknown named intervals, malformed crontab expressions, or crontab
    /// syntax when the `cron` feature is compiled out.
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let spec = spec.trim();
        if let Some(interval) = Named::parse(spec) {
            return Ok(Self {
                kind: Kind::Named {
                    interval,
                    last: None,
                },
            });
        }

        if spec.split_whitespace().count() == 5 {
            return Self::parse_crontab(spec);
        }

        Err(ScheduleError(format!(
            "'{spec}' is neither a named interval nor a five-field crontab expression"
        )))
    }

    #[cfg(feature = "cron")]
    fn parse_crontab(spec: &str) -> Result<Self, ScheduleError> {
        use std::str::FromStr;

        // Jitter: a per-host seconds field keeps shared configurations from
        // firing simultaneously fleet-wide.
        let seconds = std::process::id() % 60;
        let with_seconds = format!("{seconds} {spec}");
        let schedule = cron::Schedule::from_str(&with_seconds)
            .map_err(|e| ScheduleError(format!("'{spec}': {e}")))?;
        Ok(Self {
            kind: Kind::Cron {
                schedule,
                next: None,
            },
        })
    }

    #[cfg(not(feature = "cron"))]
    fn parse_crontab(spec: &str) -> Result<Self, ScheduleError> {
        Err(ScheduleError(format!(
            "'{spec}': crontab expressions need the cron feature; use a named interval"
        )))
    }

    /// Whether queue processing is due at `now`.
    ///
    /// The first call only establishes the baseline; it never fires.
    pub fn due(&mut self, now: DateTime<Local>) -> bool {
        match &mut self.kind {
            Kind::Named { interval, last } => {
                let stamp = now.format(interval.format()).to_string();
                match last.replace(stamp.clone()) {
                    None => false,
                    Some(previous) => previous != stamp,
                }
            }
            #[cfg(feature = "cron")]
            Kind::Cron { schedule, next } => {
                let upcoming = match next {
                    Some(t) => *t,
                    None => {
                        let Some(first) = schedule.after(&now).next() else {
                            return false;
                        };
                        *next = Some(first);
                        return false;
                    }
                };
                if now >= upcoming {
                    *next = schedule.after(&now).next();
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn named_intervals_parse() {
        for name in ["minutely", "hourly", "daily", "weekly", "monthly"] {
            assert!(Schedule::parse(name).is_ok(), "{name} should parse");
        }
        assert!(Schedule::parse("fortnightly").is_err());
        assert!(Schedule::parse("").is_err());
    }

    #[test]
    fn rollover_fires_on_field_change() {
        let mut schedule = Schedule::parse("hourly").unwrap();
        // Baseline call never fires.
        assert!(!schedule.due(at(10, 15, 0)));
        // Same hour: quiet.
        assert!(!schedule.due(at(10, 45, 0)));
        // Hour rolled over: fire once.
        assert!(schedule.due(at(11, 2, 0)));
        assert!(!schedule.due(at(11, 30, 0)));
    }

    #[test]
    fn daily_rollover_uses_day_of_month() {
        let mut schedule = Schedule::parse("daily").unwrap();
        assert!(!schedule.due(Local.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap()));
        assert!(schedule.due(Local.with_ymd_and_hms(2024, 5, 2, 0, 1, 0).unwrap()));
    }

    #[cfg(feature = "cron")]
    #[test]
    fn crontab_expression_fires_at_match() {
        let mut schedule = Schedule::parse("30 2 * * *").unwrap();
        // Baseline.
        assert!(!schedule.due(at(1, 0, 0)));
        // Not there yet.
        assert!(!schedule.due(at(2, 29, 0)));
        // Past the match (including any jitter seconds): fire once.
        assert!(schedule.due(at(2, 31, 30)));
        assert!(!schedule.due(at(2, 32, 0)));
    }

    #[cfg(feature = "cron")]
    #[test]
    fn malformed_crontab_is_rejected() {
        assert!(Schedule::parse("99 99 * * *").is_err());
    }

    #[cfg(not(feature = "cron"))]
    #[test]
    fn crontab_without_feature_is_rejected() {
        assert!(Schedule::parse("30 2 * * *").is_err());
    }
}
