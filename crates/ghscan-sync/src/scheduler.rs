//! Cron wiring: one job per stage, fire-and-forget.

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{Stage, SyncPipeline};

async fn run_logged(pipeline: SyncPipeline, stage: Stage) {
    match pipeline.run_stage(stage).await {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(json) => info!(stage = stage.name(), report = %json, "scheduled stage done"),
            Err(_) => info!(stage = stage.name(), "scheduled stage done"),
        },
        Err(err) => error!(stage = stage.name(), error = %format!("{err:#}"), "scheduled stage failed"),
    }
}

/// Register every configured stage. Stages flagged with `trigger` are also
/// spawned once right away. Runs may overlap; each owns its own token.
pub async fn build_scheduler(pipeline: SyncPipeline) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for schedule in pipeline.config().schedules.clone() {
        let stage = schedule.stage;
        let job_pipeline = pipeline.clone();
        let job = Job::new_async(schedule.cron.as_str(), move |_uuid, _l| {
            let pipeline = job_pipeline.clone();
            Box::pin(async move { run_logged(pipeline, stage).await })
        })
        .with_context(|| format!("creating job for {} with cron {}", stage.name(), schedule.cron))?;
        sched
            .add(job)
            .await
            .with_context(|| format!("adding job for {}", stage.name()))?;

        if schedule.trigger {
            info!(stage = stage.name(), "triggering immediately");
            tokio::spawn(run_logged(pipeline.clone(), stage));
        }
    }
    Ok(sched)
}

/// Start the scheduler and block until Ctrl-C, then shut it down.
pub async fn run_until_shutdown(pipeline: SyncPipeline) -> Result<()> {
    let jobs = pipeline.config().schedules.len();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(jobs, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, pipeline_at};
    use crate::SyncConfig;
    use std::collections::HashMap;

    #[tokio::test(flavor = "multi_thread")]
    async fn default_crontabs_all_register() {
        let (pipeline, _, _) = pipeline_at(at(2024, 1, 1), SyncConfig::default());
        assert!(build_scheduler(pipeline).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_crontab_names_its_stage() {
        let env: HashMap<&str, &str> = HashMap::from([("CRON_RANK_MATCHES", "whenever")]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        let (pipeline, _, _) = pipeline_at(at(2024, 1, 1), config);
        let Err(err) = build_scheduler(pipeline).await else {
            panic!("an unparseable crontab must be rejected");
        };
        assert!(format!("{err:#}").contains("rank_matches"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn triggered_stage_runs_without_waiting_for_cron() {
        let env: HashMap<&str, &str> = HashMap::from([("TRIGGER_USER_COUNT", "1")]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        let (pipeline, store, _) = pipeline_at(at(2024, 1, 1), config);
        store
            .users
            .upsert(ghscan_storage::UpsertOp::new("alice").set("followers", 1))
            .await
            .unwrap();

        let _sched = build_scheduler(pipeline).await.unwrap();
        let stats = store.stat_records();
        let mut found = false;
        for _ in 0..50 {
            if stats.find(ghscan_core::StatType::UserCount).await.is_ok() {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(found);
    }
}
