// pgstash/src/scheduler.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::{Pipeline, RunOutcome};

/// Converts a classic 5-field expression to the 6-field form the `cron` crate parses.
///
/// A `0` seconds field is prepended and numeric day-of-week values are renumbered
/// from the classic `0`/`7` = Sunday to the crate's `1` = Sunday .. `7` = Saturday.
/// Six and seven field expressions already use the crate's numbering and pass through.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return expr.to_string();
    }
    format!(
        "0 {} {}",
        fields[..4].join(" "),
        convert_day_of_week(fields[4])
    )
}

fn convert_day_of_week(field: &str) -> String {
    let mut converted: Vec<String> = Vec::new();
    for part in field.split(',') {
        match classic_days(part) {
            Some(days) => {
                for day in days {
                    let day = (day % 7 + 1).to_string();
                    if !converted.contains(&day) {
                        converted.push(day);
                    }
                }
            }
            // `*`, `?` and day names mean the same in both numberings.
            None => converted.push(part.to_string()),
        }
    }
    converted.join(",")
}

/// Expands one numeric list element (`n`, `a-b`, `a-b/s`, `n/s`, `*/s`) to classic
/// day numbers. `None` for anything else, including out of range values.
fn classic_days(part: &str) -> Option<Vec<u32>> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
        None => (part, 1),
    };
    let (start, end) = match range.split_once('-') {
        _ if range == "*" && step > 1 => (0, 6),
        Some((start, end)) => (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?),
        None => {
            let start = range.parse::<u32>().ok()?;
            (start, if step > 1 { 6 } else { start })
        }
    };
    if end > 7 || start > end {
        return None;
    }
    Some((start..=end).step_by(step).collect())
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron(expr)).with_context(|| format!("Invalid cron expression '{}'", expr))
}

pub fn next_fire_time(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Runs the pipeline on every tick of `schedule` until `cancel` fires.
///
/// Runs are awaited in the loop and the next tick is computed afterwards, so ticks
/// that fall inside a run are dropped.
pub async fn run_scheduler(pipeline: Arc<Pipeline>, schedule: Schedule, cancel: CancellationToken) {
    loop {
        let now = Utc::now();
        let Some(next) = next_fire_time(&schedule, now) else {
            warn!("Cron schedule has no upcoming fire time, stopping scheduler");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next.to_rfc3339(), "Next backup scheduled");

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match pipeline.run(&cancel).await {
            RunOutcome::Succeeded { key, purged, .. } => info!(key = %key, purged, "Scheduled run finished"),
            RunOutcome::PurgeFailed { run, key, error } => {
                warn!(key = %key, dumped = run.dumped, error = %error, "Scheduled run finished with purge failure")
            }
            RunOutcome::Failed(error) => warn!(error = %error, "Scheduled run failed"),
            RunOutcome::Skipped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 0 * * *"), "0 0 0 * * *");
        assert_eq!(normalize_cron("  */5 * * * * "), "0 */5 * * * *");
        assert_eq!(normalize_cron("30 0 0 * * *"), "30 0 0 * * *");
    }

    #[test]
    fn test_day_of_week_is_renumbered() {
        assert_eq!(normalize_cron("0 0 * * 1"), "0 0 0 * * 2");
        assert_eq!(normalize_cron("0 0 * * 0"), "0 0 0 * * 1");
        assert_eq!(normalize_cron("0 0 * * 7"), "0 0 0 * * 1");
        assert_eq!(normalize_cron("0 0 * * 1-5"), "0 0 0 * * 2,3,4,5,6");
        assert_eq!(normalize_cron("0 0 * * 5-7"), "0 0 0 * * 6,7,1");
        assert_eq!(normalize_cron("0 0 * * 0,3"), "0 0 0 * * 1,4");
        assert_eq!(normalize_cron("0 0 * * */2"), "0 0 0 * * 1,3,5,7");
        assert_eq!(normalize_cron("0 0 * * MON-FRI"), "0 0 0 * * MON-FRI");
        assert_eq!(normalize_cron("0 0 * * ?"), "0 0 0 * * ?");
    }

    #[test]
    fn test_monday_schedule_fires_on_monday() -> anyhow::Result<()> {
        // 2024-01-03 is a Wednesday.
        let after = Utc
            .with_ymd_and_hms(2024, 1, 3, 9, 0, 0)
            .single()
            .context("invalid time")?;

        let next = next_fire_time(&parse_schedule("0 0 * * 1")?, after).context("no fire time")?;
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).single().context("invalid time")?);

        let next = next_fire_time(&parse_schedule("0 0 * * MON")?, after).context("no fire time")?;
        assert_eq!(next.weekday(), Weekday::Mon);
        Ok(())
    }

    #[test]
    fn test_sunday_as_zero_and_seven() -> anyhow::Result<()> {
        let after = Utc
            .with_ymd_and_hms(2024, 1, 3, 9, 0, 0)
            .single()
            .context("invalid time")?;
        for expr in ["0 0 * * 0", "0 0 * * 7"] {
            let next = next_fire_time(&parse_schedule(expr)?, after).context("no fire time")?;
            assert_eq!(next.weekday(), Weekday::Sun, "{}", expr);
        }
        Ok(())
    }

    #[test]
    fn test_weekdays_skip_the_weekend() -> anyhow::Result<()> {
        // Friday noon: the next weekday midnight is Monday.
        let after = Utc
            .with_ymd_and_hms(2024, 1, 5, 12, 0, 0)
            .single()
            .context("invalid time")?;
        let next = next_fire_time(&parse_schedule("0 0 * * 1-5")?, after).context("no fire time")?;
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).single().context("invalid time")?);
        Ok(())
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        assert!(parse_schedule("every night").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
        assert!(parse_schedule("0 0 * * 8").is_err());
    }

    #[test]
    fn test_next_fire_time_is_midnight_utc() -> anyhow::Result<()> {
        let schedule = parse_schedule("0 0 * * *")?;
        let after = Utc
            .with_ymd_and_hms(2024, 1, 3, 9, 15, 0)
            .single()
            .context("invalid time")?;
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 4, 0, 0, 0)
            .single()
            .context("invalid time")?;
        assert_eq!(next_fire_time(&schedule, after), Some(expected));
        Ok(())
    }

    #[test]
    fn test_every_five_minutes() -> anyhow::Result<()> {
        let schedule = parse_schedule("*/5 * * * *")?;
        let after = Utc
            .with_ymd_and_hms(2024, 1, 3, 9, 12, 30)
            .single()
            .context("invalid time")?;
        let next = next_fire_time(&schedule, after).context("no fire time")?;
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 3, 9, 15, 0).single().context("invalid time")?);
        Ok(())
    }
}
