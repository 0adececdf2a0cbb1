// Cron-driven scheduler: a single tick loop that materializes due schedules
// into tasks. Ticks never overlap; each tick runs to completion before the
// next sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use workbench_types::Schedule;

use crate::cron::Cron;
use crate::runner::Runner;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn now_minute() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn goal_for(schedule: &Schedule) -> String {
    schedule
        .payload
        .as_ref()
        .and_then(|p| p.get("goal"))
        .and_then(|g| g.as_str())
        .filter(|g| !g.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Scheduled run: {}", schedule.name))
}

/// One scheduler pass over all enabled schedules.
pub async fn tick_once(runner: &Arc<Runner>) -> anyhow::Result<()> {
    tick_at(runner, now_minute()).await
}

/// Tick with an explicit clock, so due-time handling is testable.
pub async fn tick_at(runner: &Arc<Runner>, now: DateTime<Utc>) -> anyhow::Result<()> {
    let store = runner.store();
    let schedules = store.list_schedules(true).await?;
    for schedule in schedules {
        let next_run = schedule.next_run_at.as_deref().and_then(parse_time);

        let Some(next_run) = next_run else {
            // Backfill from a minute ago so a just-due expression still fires.
            match Cron::parse(&schedule.cron_expr)
                .and_then(|cron| cron.next_after(now - chrono::Duration::minutes(1)))
            {
                Ok(next) => {
                    store
                        .set_schedule_next_run(&schedule.id, Some(&format_time(next)))
                        .await?;
                }
                Err(err) => {
                    tracing::warn!(
                        schedule_id = schedule.id,
                        "disabling schedule with invalid cron: {err}"
                    );
                    store.set_schedule_enabled(&schedule.id, false).await?;
                }
            }
            continue;
        };

        if next_run > now {
            continue;
        }

        let goal = goal_for(&schedule);
        let task = store
            .create_task(
                &schedule.workspace_id,
                &schedule.skill_id,
                &goal,
                schedule.mode,
                None,
            )
            .await?;
        runner.start_task_background(&task.id);
        store
            .set_schedule_last_run(&schedule.id, &format_time(now))
            .await?;

        match Cron::parse(&schedule.cron_expr).and_then(|cron| cron.next_after(now)) {
            Ok(next) => {
                store
                    .set_schedule_next_run(&schedule.id, Some(&format_time(next)))
                    .await?;
            }
            Err(err) => {
                tracing::warn!(
                    schedule_id = schedule.id,
                    "disabling schedule with invalid cron: {err}"
                );
                store.set_schedule_enabled(&schedule.id, false).await?;
            }
        }
    }
    Ok(())
}

/// Spawn the tick loop. Cancel the token to stop it.
pub fn start_scheduler(
    runner: Arc<Runner>,
    tick_seconds: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(tick_seconds.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            if let Err(err) = tick_once(&runner).await {
                tracing::warn!("scheduler tick failed: {err}");
            }
        }
    })
}
