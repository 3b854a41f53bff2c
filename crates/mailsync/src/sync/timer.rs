//! Timer sources driving the scheduler
//!
//! Production uses [`CronTimer`]; tests and embedders that want to decide
//! when ticks happen use [`ManualTimer`].

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;

/// Source of periodic ticks for one tier
#[async_trait]
pub trait TimerSource: Send {
    /// Wait for the next tick. `None` means the source is exhausted and the
    /// tier's timer loop should stop.
    async fn next_tick(&mut self) -> Option<DateTime<Utc>>;
}

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month day-of-week`
/// and numbers weekdays 1-7 from Sunday. Configuration uses standard 5-field
/// cron (`min hour day-of-month month day-of-week`, 0 or 7 = Sunday), so the
/// numeric weekdays of a 5-field expression are renumbered as well. A 6-field
/// expression is passed through in the crate's own syntax.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day,
            month,
            standard_weekdays(weekday)
        ),
        _ => trimmed.to_string(),
    }
}

/// Renumber a standard day-of-week field (0-7, Sunday = 0 or 7) to 1-7 (Sunday = 1)
fn standard_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(standard_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

/// One comma-separated item: `*`, `*/n`, `d`, `a-b`, `a-b/n` or `a/n`.
///
/// Numeric items are expanded to an explicit day list, which also handles
/// ranges ending on Sunday (`5-7`). Anything else (names, out-of-range
/// numbers) is left for the cron parser to accept or reject.
fn standard_weekday_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    // `*` and `*/n` select the same days under both numberings
    if range == "*" {
        return item.to_string();
    }

    let bounds = match range.split_once('-') {
        Some((start, end)) => start.parse::<u8>().ok().zip(end.parse::<u8>().ok()),
        None => range.parse::<u8>().ok().map(|day| match step {
            Some(_) => (day, 6),
            None => (day, day),
        }),
    };
    let Some((start, end)) = bounds.filter(|&(start, end)| start <= end && end <= 7) else {
        return item.to_string();
    };
    let step = match step.map(str::parse::<usize>) {
        None => 1,
        Some(Ok(step)) if step > 0 => step,
        Some(_) => return item.to_string(),
    };

    let mut days: Vec<u8> = (start..=end).step_by(step).map(|day| day % 7 + 1).collect();
    days.sort_unstable();
    days.dedup();
    days.iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a 5- or 6-field cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_cron(expr))
}

/// Ticks at the fire times of a cron schedule (UTC)
pub struct CronTimer {
    schedule: Schedule,
}

impl CronTimer {
    pub fn new(schedule: Schedule) -> Self {
        Self { schedule }
    }

    pub fn from_expression(expr: &str) -> Result<Self, cron::error::Error> {
        parse_cron(expr).map(Self::new)
    }

    /// Next fire time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

#[async_trait]
impl TimerSource for CronTimer {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        let next = self.next_after(Utc::now())?;
        // A fire time already in the past (clock skew) sleeps zero.
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        Some(next)
    }
}

/// Timer fed by hand through a [`TickSender`]
pub struct ManualTimer {
    rx: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

/// Handle that fires ticks into a [`ManualTimer`]
#[derive(Clone)]
pub struct TickSender {
    tx: mpsc::UnboundedSender<DateTime<Utc>>,
}

impl ManualTimer {
    pub fn channel() -> (TickSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TickSender { tx }, Self { rx })
    }
}

impl TickSender {
    /// Fire one tick. Returns false if the timer has been dropped.
    pub fn tick(&self) -> bool {
        self.tx.send(Utc::now()).is_ok()
    }
}

#[async_trait]
impl TimerSource for ManualTimer {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_normalize_cron_5_to_6_fields() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
    }

    #[test]
    fn test_normalize_cron_already_6_fields() {
        assert_eq!(normalize_cron("0 */15 * * * *"), "0 */15 * * * *");
    }

    #[test]
    fn test_normalize_cron_trims_whitespace() {
        assert_eq!(normalize_cron("  */5 * * * *  "), "0 */5 * * * *");
    }

    #[test]
    fn test_normalize_cron_weekdays() {
        assert_eq!(normalize_cron("0 2 * * 0"), "0 0 2 * * 1");
        assert_eq!(normalize_cron("0 2 * * 7"), "0 0 2 * * 1");
        assert_eq!(normalize_cron("0 2 * * 1-5"), "0 0 2 * * 2,3,4,5,6");
        assert_eq!(normalize_cron("0 2 * * 5-7"), "0 0 2 * * 1,6,7");
        assert_eq!(normalize_cron("0 2 * * 1,3"), "0 0 2 * * 2,4");
        assert_eq!(normalize_cron("0 2 * * */2"), "0 0 2 * * */2");
        assert_eq!(normalize_cron("0 2 * * Mon"), "0 0 2 * * Mon");
    }

    #[test]
    fn test_sunday_schedule() {
        let timer = CronTimer::from_expression("* * * * 0").unwrap();
        // Friday
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = timer.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_weekday_schedule() {
        let timer = CronTimer::from_expression("* * * * 1-5").unwrap();
        // Saturday
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 10, 0, 0).unwrap();
        let next = timer.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Mon);

        let weekly = CronTimer::from_expression("0 2 * * 1").unwrap();
        let friday = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            weekly.next_after(friday).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 4, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[test]
    fn test_cron_timer_next_after() {
        let timer = CronTimer::from_expression("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();
        let next = timer.next_after(now).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));
    }

    #[test]
    fn test_daily_full_timer() {
        let timer = CronTimer::from_expression("0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let next = timer.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_manual_timer_ticks_and_ends() {
        let (sender, mut timer) = ManualTimer::channel();
        assert!(sender.tick());
        assert!(timer.next_tick().await.is_some());

        drop(sender);
        assert!(timer.next_tick().await.is_none());
    }
}
