//! Next-run computation for scheduled feed syncs. All arithmetic is UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::SyncFrequency;

/// Next scheduled invocation relative to the current instant.
pub fn next_run(
    frequency: SyncFrequency,
    time_of_day: NaiveTime,
    day_of_week: Option<u32>,
) -> DateTime<Utc> {
    next_run_after(Utc::now(), frequency, time_of_day, day_of_week)
}

/// Pure form of [`next_run`]. `day_of_week` counts from Sunday = 0 and
/// defaults to Sunday for weekly schedules.
pub fn next_run_after(
    now: DateTime<Utc>,
    frequency: SyncFrequency,
    time_of_day: NaiveTime,
    day_of_week: Option<u32>,
) -> DateTime<Utc> {
    match frequency {
        SyncFrequency::Hourly => {
            let hour_start = at(now.date_naive(), hour(now.hour()));
            hour_start + Duration::hours(1)
        }
        SyncFrequency::Every6Hours => next_hour_boundary(now, 6),
        SyncFrequency::Every12Hours => next_hour_boundary(now, 12),
        SyncFrequency::Daily => {
            let today = at(now.date_naive(), time_of_day);
            if today > now {
                today
            } else {
                today + Duration::days(1)
            }
        }
        SyncFrequency::Weekly => {
            let target = day_of_week.unwrap_or(0) % 7;
            let current = now.weekday().num_days_from_sunday();
            let days_ahead = (target + 7 - current) % 7;
            let candidate = at(now.date_naive(), time_of_day) + Duration::days(days_ahead as i64);
            if candidate <= now {
                candidate + Duration::days(7)
            } else {
                candidate
            }
        }
    }
}

/// Parses the stored `HH:MM:SS` (or `HH:MM`) time-of-day column.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn next_hour_boundary(now: DateTime<Utc>, step: u32) -> DateTime<Utc> {
    let next = (now.hour() / step + 1) * step;
    if next >= 24 {
        at(now.date_naive() + Duration::days(1), hour(0))
    } else {
        at(now.date_naive(), hour(next))
    }
}

fn hour(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn hourly_returns_start_of_next_hour() {
        let now = utc(2026, 10, 14, 8, 42, 10);
        assert_eq!(
            next_run_after(now, SyncFrequency::Hourly, t(0, 0), None),
            utc(2026, 10, 14, 9, 0, 0)
        );
        let late = utc(2026, 10, 14, 23, 0, 0);
        assert_eq!(
            next_run_after(late, SyncFrequency::Hourly, t(0, 0), None),
            utc(2026, 10, 15, 0, 0, 0)
        );
    }

    #[test]
    fn every_six_hours_rolls_over_midnight() {
        let now = utc(2026, 10, 14, 23, 30, 0);
        assert_eq!(
            next_run_after(now, SyncFrequency::Every6Hours, t(3, 0), None),
            utc(2026, 10, 15, 0, 0, 0)
        );
        let morning = utc(2026, 10, 14, 7, 15, 0);
        assert_eq!(
            next_run_after(morning, SyncFrequency::Every6Hours, t(3, 0), None),
            utc(2026, 10, 14, 12, 0, 0)
        );
        let on_boundary = utc(2026, 10, 14, 6, 0, 0);
        assert_eq!(
            next_run_after(on_boundary, SyncFrequency::Every6Hours, t(3, 0), None),
            utc(2026, 10, 14, 12, 0, 0)
        );
    }

    #[test]
    fn every_twelve_hours_uses_noon_and_midnight() {
        let morning = utc(2026, 10, 14, 11, 59, 59);
        assert_eq!(
            next_run_after(morning, SyncFrequency::Every12Hours, t(0, 0), None),
            utc(2026, 10, 14, 12, 0, 0)
        );
        let afternoon = utc(2026, 10, 14, 12, 30, 0);
        assert_eq!(
            next_run_after(afternoon, SyncFrequency::Every12Hours, t(0, 0), None),
            utc(2026, 10, 15, 0, 0, 0)
        );
    }

    #[test]
    fn daily_runs_today_until_the_time_passes() {
        let three = t(3, 0);
        assert_eq!(
            next_run_after(utc(2026, 10, 14, 2, 0, 0), SyncFrequency::Daily, three, None),
            utc(2026, 10, 14, 3, 0, 0)
        );
        assert_eq!(
            next_run_after(utc(2026, 10, 14, 4, 0, 0), SyncFrequency::Daily, three, None),
            utc(2026, 10, 15, 3, 0, 0)
        );
    }

    #[test]
    fn weekly_targets_the_next_matching_weekday() {
        let wednesday_morning = utc(2026, 10, 14, 8, 0, 0);
        assert_eq!(wednesday_morning.weekday(), Weekday::Wed);
        let nine = t(9, 0);

        assert_eq!(
            next_run_after(wednesday_morning, SyncFrequency::Weekly, nine, Some(3)),
            utc(2026, 10, 14, 9, 0, 0)
        );
        assert_eq!(
            next_run_after(utc(2026, 10, 14, 10, 0, 0), SyncFrequency::Weekly, nine, Some(3)),
            utc(2026, 10, 21, 9, 0, 0)
        );
        // Friday target from Wednesday, Monday target wraps past the weekend.
        assert_eq!(
            next_run_after(wednesday_morning, SyncFrequency::Weekly, nine, Some(5)),
            utc(2026, 10, 16, 9, 0, 0)
        );
        assert_eq!(
            next_run_after(wednesday_morning, SyncFrequency::Weekly, nine, Some(1)),
            utc(2026, 10, 19, 9, 0, 0)
        );
    }

    #[test]
    fn unrecognized_frequency_text_schedules_daily() {
        let frequency = SyncFrequency::parse_lossy("biweekly");
        assert_eq!(
            next_run_after(utc(2026, 10, 14, 4, 0, 0), frequency, t(3, 0), None),
            utc(2026, 10, 15, 3, 0, 0)
        );
    }

    #[test]
    fn time_of_day_accepts_seconds_or_minutes_precision() {
        assert_eq!(parse_time_of_day("03:00:00"), Some(t(3, 0)));
        assert_eq!(parse_time_of_day("21:30"), Some(t(21, 30)));
        assert_eq!(parse_time_of_day("25:00:00"), None);
    }
}
