//! Long-running scheduler: fires each job at its cadence until Ctrl-C.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use studyflow_core::{Clock, JobKind, JobRun};

use crate::Engine;
use crate::state::StateFile;

fn next_fires(after: DateTime<Utc>, tz: Tz) -> BTreeMap<JobKind, DateTime<Utc>> {
    JobKind::ALL
        .into_iter()
        .filter_map(|job| job.spec().cadence.next_after(after, tz).map(|at| (job, at)))
        .collect()
}

/// Each job runs inside a state transaction, so the engine's copy is reloaded
/// before the job and saved right after it.
pub async fn run(engine: Arc<Engine>, state: StateFile, tick_seconds: u64) -> Result<()> {
    let tz = engine.config().tz()?;
    let mut next = next_fires(engine.clock().now(), tz);
    for (job, at) in &next {
        tracing::info!(job = job.name(), next_run = %at, "scheduled");
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_seconds.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            res = &mut shutdown => {
                res.context("listen for ctrl-c")?;
                tracing::info!("shutting down");
                break;
            }
        }

        let now = engine.clock().now();
        let due: Vec<JobKind> = next
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(job, _)| *job)
            .collect();

        for job in due {
            let worker = Arc::clone(&engine);
            let state = state.clone();
            let result = tokio::task::spawn_blocking(move || {
                state.transaction(worker.store(), || Ok(worker.run(job)))
            })
            .await
            .context("join job task")?;
            match result {
                Ok(Ok(JobRun::Completed(report))) => tracing::info!(
                    job = job.name(),
                    users = report.total_users,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    affected = report.affected,
                    "job finished"
                ),
                Ok(Ok(JobRun::AlreadyRunning)) => {
                    tracing::info!(job = job.name(), "job still running elsewhere")
                }
                Ok(Err(e)) => tracing::error!(job = job.name(), error = %e, "job failed"),
                Err(e) => tracing::error!(job = job.name(), error = %format!("{e:#}"), "could not sync state"),
            }

            match job.spec().cadence.next_after(engine.clock().now(), tz) {
                Some(at) => {
                    next.insert(job, at);
                }
                None => {
                    next.remove(&job);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_job_gets_a_next_fire_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 10, 7, 0).unwrap();
        let next = next_fires(now, chrono_tz::UTC);
        assert_eq!(next.len(), JobKind::ALL.len());
        assert_eq!(
            next[&JobKind::SendReminders],
            Utc.with_ymd_and_hms(2026, 3, 4, 10, 15, 0).unwrap()
        );
        assert_eq!(
            next[&JobKind::CheckMissedSessions],
            Utc.with_ymd_and_hms(2026, 3, 4, 11, 0, 0).unwrap()
        );
        assert_eq!(
            next[&JobKind::RecalculatePriorities],
            Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap()
        );
        assert_eq!(
            next[&JobKind::AdaptSchedules],
            Utc.with_ymd_and_hms(2026, 3, 8, 2, 0, 0).unwrap()
        );
    }
}
