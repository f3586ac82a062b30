use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use super::rules::{DeploymentWindowRule, WindowKind};

/// Upper bound on occurrences inspected when looking backwards from "now".
const MAX_SCAN_STEPS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

/// Parsed subset of an RFC 5545 recurrence rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Recurrence {
    pub freq: Frequency,
    pub interval: u32,
    pub by_day: Vec<Weekday>,
    pub until: Option<DateTime<Utc>>,
}

impl Recurrence {
    pub fn parse(rule: &str) -> Result<Self> {
        let body = rule.trim().trim_start_matches("RRULE:");
        let mut freq = None;
        let mut interval = 1;
        let mut by_day = Vec::new();
        let mut until = None;

        for part in body.split(';').filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .with_context(|| format!("malformed rrule component '{}'", part))?;
            match name.to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "HOURLY" => Frequency::Hourly,
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        other => bail!("unsupported rrule frequency '{}'", other),
                    })
                }
                "INTERVAL" => {
                    interval = value
                        .parse::<u32>()
                        .with_context(|| format!("bad rrule interval '{}'", value))?;
                    if interval == 0 {
                        bail!("rrule interval must be positive");
                    }
                }
                "BYDAY" => {
                    for day in value.split(',') {
                        by_day.push(parse_weekday(day)?);
                    }
                }
                "UNTIL" => until = Some(parse_until(value)?),
                other => bail!("unsupported rrule component '{}'", other),
            }
        }

        Ok(Self {
            freq: freq.context("rrule is missing FREQ")?,
            interval,
            by_day,
            until,
        })
    }
}

fn parse_weekday(s: &str) -> Result<Weekday> {
    Ok(match s.trim().to_ascii_uppercase().as_str() {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        other => bail!("unknown weekday '{}'", other),
    })
}

fn parse_until(s: &str) -> Result<DateTime<Utc>> {
    let trimmed = s.trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S")
        .with_context(|| format!("bad rrule UNTIL '{}'", s))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Parse `UTC`, `Z`, or `±HH:MM`.
pub fn parse_offset(tz: &str) -> Result<FixedOffset> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).context("zero offset");
    }
    let (sign, rest) = match tz.chars().next() {
        Some('+') => (1, &tz[1..]),
        Some('-') => (-1, &tz[1..]),
        _ => bail!("unsupported timezone '{}'", tz),
    };
    let (h, m) = rest
        .split_once(':')
        .with_context(|| format!("unsupported timezone '{}'", tz))?;
    let secs = sign * (h.parse::<i32>()? * 3600 + m.parse::<i32>()? * 60);
    FixedOffset::east_opt(secs).with_context(|| format!("offset out of range '{}'", tz))
}

/// The zone a window's `dtstart` wall-clock time is written in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl WindowZone {
    /// `UTC`, `Z`, `±HH:MM`, or an IANA name such as `Europe/Berlin`.
    pub fn parse(tz: &str) -> Result<Self> {
        let tz = tz.trim();
        if tz.eq_ignore_ascii_case("utc") || tz == "Z" || tz.starts_with(['+', '-']) {
            return parse_offset(tz).map(WindowZone::Fixed);
        }
        tz.parse::<Tz>()
            .map(WindowZone::Named)
            .map_err(|e| anyhow!("unknown timezone '{}': {}", tz, e))
    }

    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        match self {
            WindowZone::Fixed(offset) => at.with_timezone(offset).naive_local(),
            WindowZone::Named(tz) => at.with_timezone(tz).naive_local(),
        }
    }

    /// The instant a wall-clock time refers to. A time skipped by a DST jump
    /// moves forward by an hour; a repeated time takes the earlier instant.
    fn instant(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            WindowZone::Fixed(offset) => offset
                .from_local_datetime(&local)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
            WindowZone::Named(tz) => tz
                .from_local_datetime(&local)
                .earliest()
                .or_else(|| {
                    let shifted = local.checked_add_signed(Duration::hours(1))?;
                    tz.from_local_datetime(&shifted).earliest()
                })
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl DeploymentWindowRule {
    /// Check that the recurrence and timezone can be evaluated.
    pub fn validate(&self) -> Result<()> {
        Recurrence::parse(&self.rrule)?;
        WindowZone::parse(&self.timezone)?;
        if self.duration_minutes <= 0 {
            bail!("window duration must be positive, got {} minutes", self.duration_minutes);
        }
        Ok(())
    }

    /// Whether `now` falls inside any occurrence of the window.
    pub fn is_inside(&self, now: DateTime<Utc>) -> Result<bool> {
        let recurrence = Recurrence::parse(&self.rrule)?;
        let zone = WindowZone::parse(&self.timezone)?;
        let local_now = zone.local(now);
        // A duration past chrono's range never closes.
        let duration = self
            .duration_minutes
            .max(0)
            .checked_mul(60)
            .and_then(Duration::try_seconds);

        if local_now < self.dtstart || duration.is_some_and(|d| d.is_zero()) {
            return Ok(false);
        }

        let start_time = self.dtstart.time();
        let valid_start = |start: NaiveDateTime| -> bool {
            if start < self.dtstart {
                return false;
            }
            if let Some(until) = recurrence.until {
                if !zone.instant(start).is_some_and(|at| at <= until) {
                    return false;
                }
            }
            if !recurrence.by_day.is_empty() && !recurrence.by_day.contains(&start.weekday()) {
                return false;
            }
            match recurrence.freq {
                Frequency::Hourly => {
                    let hours = (start - self.dtstart).num_hours();
                    hours % i64::from(recurrence.interval) == 0
                }
                Frequency::Daily => {
                    let days = (start.date() - self.dtstart.date()).num_days();
                    days % i64::from(recurrence.interval) == 0
                }
                Frequency::Weekly => {
                    if recurrence.by_day.is_empty() && start.weekday() != self.dtstart.weekday() {
                        return false;
                    }
                    let weeks = (week_start(start) - week_start(self.dtstart)).num_days() / 7;
                    weeks % i64::from(recurrence.interval) == 0
                }
            }
        };

        // Walk occurrence starts backwards from now; earlier starts end earlier,
        // so the first one that has already ended stops the scan.
        let (mut cursor, step) = match recurrence.freq {
            Frequency::Hourly => {
                let elapsed = (local_now - self.dtstart).num_hours();
                (self.dtstart + Duration::hours(elapsed), Duration::hours(1))
            }
            Frequency::Daily | Frequency::Weekly => {
                (local_now.date().and_time(start_time), Duration::days(1))
            }
        };

        for _ in 0..MAX_SCAN_STEPS {
            if cursor < self.dtstart {
                break;
            }
            if cursor <= local_now {
                if let Some(start) = zone.instant(cursor) {
                    let end = duration.and_then(|d| start.checked_add_signed(d));
                    if end.is_some_and(|end| end <= now) {
                        break;
                    }
                    if start <= now && valid_start(cursor) {
                        return Ok(true);
                    }
                }
            }
            match cursor.checked_sub_signed(step) {
                Some(previous) => cursor = previous,
                None => break,
            }
        }
        Ok(false)
    }

    /// Whether releases are blocked at `now`.
    pub fn blocks(&self, now: DateTime<Utc>) -> Result<bool> {
        let inside = self.is_inside(now)?;
        Ok(match self.kind {
            WindowKind::Allow => !inside,
            WindowKind::Deny => inside,
        })
    }
}

fn week_start(dt: NaiveDateTime) -> chrono::NaiveDate {
    dt.date() - Duration::days(i64::from(dt.weekday().num_days_from_monday()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn window(rrule: &str, dtstart: &str, tz: &str, minutes: i64, kind: WindowKind) -> DeploymentWindowRule {
        DeploymentWindowRule {
            rrule: rrule.to_string(),
            dtstart: NaiveDateTime::parse_from_str(dtstart, "%Y-%m-%dT%H:%M:%S").unwrap(),
            timezone: tz.to_string(),
            duration_minutes: minutes,
            kind,
        }
    }

    #[test]
    fn parses_weekly_rule() {
        let r = Recurrence::parse("RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,FR").unwrap();
        assert_eq!(r.freq, Frequency::Weekly);
        assert_eq!(r.interval, 2);
        assert_eq!(r.by_day, vec![Weekday::Mon, Weekday::Fri]);
    }

    #[test]
    fn rejects_unknown_frequency() {
        assert!(Recurrence::parse("FREQ=YEARLY").is_err());
        assert!(Recurrence::parse("INTERVAL=2").is_err());
    }

    #[test]
    fn daily_window_covers_its_hours_only() {
        // 09:00-11:00 UTC every day from 2024-01-01.
        let w = window("FREQ=DAILY", "2024-01-01T09:00:00", "UTC", 120, WindowKind::Deny);
        assert!(w.is_inside(at("2024-03-05T10:30:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-03-05T11:00:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-03-05T08:59:00Z")).unwrap());
        assert!(!w.is_inside(at("2023-12-31T10:00:00Z")).unwrap());
    }

    #[test]
    fn window_respects_offset() {
        // 09:00 local at +02:00 is 07:00 UTC.
        let w = window("FREQ=DAILY", "2024-01-01T09:00:00", "+02:00", 60, WindowKind::Deny);
        assert!(w.is_inside(at("2024-02-01T07:30:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-02-01T09:30:00Z")).unwrap());
    }

    #[test]
    fn weekly_byday_window_spanning_midnight() {
        // Fridays 22:00 for 4 hours, so it spills into Saturday.
        let w = window("FREQ=WEEKLY;BYDAY=FR", "2024-01-05T22:00:00", "UTC", 240, WindowKind::Deny);
        // 2024-01-13 is a Saturday.
        assert!(w.is_inside(at("2024-01-13T01:00:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-01-13T03:00:00Z")).unwrap());
        // Thursday never matches.
        assert!(!w.is_inside(at("2024-01-11T22:30:00Z")).unwrap());
    }

    #[test]
    fn allow_window_blocks_outside() {
        let w = window("FREQ=DAILY", "2024-01-01T09:00:00", "UTC", 60, WindowKind::Allow);
        assert!(w.blocks(at("2024-01-02T12:00:00Z")).unwrap());
        assert!(!w.blocks(at("2024-01-02T09:15:00Z")).unwrap());
    }

    #[test]
    fn until_ends_the_recurrence() {
        let w = window(
            "FREQ=DAILY;UNTIL=20240110T000000Z",
            "2024-01-01T09:00:00",
            "UTC",
            60,
            WindowKind::Deny,
        );
        assert!(w.is_inside(at("2024-01-09T09:30:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-01-10T09:30:00Z")).unwrap());
    }

    #[test]
    fn hourly_interval() {
        let w = window("FREQ=HOURLY;INTERVAL=3", "2024-01-01T00:00:00", "UTC", 30, WindowKind::Deny);
        assert!(w.is_inside(at("2024-01-01T03:10:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-01-01T04:10:00Z")).unwrap());
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        // 02:00 Berlin time is 01:00 UTC in winter and 00:00 UTC in summer.
        let w = window("FREQ=DAILY", "2024-01-01T02:00:00", "Europe/Berlin", 60, WindowKind::Deny);
        assert!(w.is_inside(at("2024-01-15T01:30:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-01-15T00:30:00Z")).unwrap());
        assert!(w.is_inside(at("2024-07-15T00:30:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-07-15T01:30:00Z")).unwrap());
        assert!(!w.blocks(at("2024-07-15T12:00:00Z")).unwrap());
    }

    #[test]
    fn skipped_local_start_moves_forward() {
        // 02:00 does not exist in Berlin on 2024-03-31; the window opens at 03:00.
        let w = window("FREQ=DAILY", "2024-01-01T02:00:00", "Europe/Berlin", 60, WindowKind::Deny);
        assert!(w.is_inside(at("2024-03-31T01:30:00Z")).unwrap());
        assert!(!w.is_inside(at("2024-03-31T02:30:00Z")).unwrap());
    }

    #[test]
    fn huge_duration_never_closes() {
        let w = window("FREQ=DAILY", "2024-01-01T09:00:00", "UTC", i64::MAX, WindowKind::Deny);
        assert!(w.is_inside(at("2024-03-05T08:00:00Z")).unwrap());
        assert!(!w.is_inside(at("2023-12-31T10:00:00Z")).unwrap());
    }

    #[test]
    fn validate_rejects_unknown_zone_and_rule() {
        let good = window("FREQ=DAILY", "2024-01-01T09:00:00", "America/New_York", 60, WindowKind::Deny);
        assert!(good.validate().is_ok());
        let zone = window("FREQ=DAILY", "2024-01-01T09:00:00", "Mars/Olympus", 60, WindowKind::Deny);
        assert!(zone.validate().unwrap_err().to_string().contains("Mars/Olympus"));
        let rule = window("FREQ=YEARLY", "2024-01-01T09:00:00", "UTC", 60, WindowKind::Deny);
        assert!(rule.validate().is_err());
        let empty = window("FREQ=DAILY", "2024-01-01T09:00:00", "UTC", 0, WindowKind::Deny);
        assert!(empty.validate().is_err());
    }
}
