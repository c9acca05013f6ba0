//! Command implementations.

use std::time::Duration;

use anyhow::{Context, bail};
use sqlx::PgPool;
use tracing::info;

use workhorse_core::job::JobStatus;
use workhorse_db::repo::Cleaner;

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    workhorse_db::run_migrations(pool)
        .await
        .context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn cleanup_workers(pool: &PgPool, older_than: u64) -> anyhow::Result<()> {
    let purged = Cleaner::new(pool.clone())
        .purge_stale_workers(Duration::from_secs(older_than))
        .await?;
    info!(count = purged, "stale workers purged");
    Ok(())
}

pub async fn cleanup_jobs(pool: &PgPool, older_than: u64, statuses: &[String]) -> anyhow::Result<()> {
    let statuses = parse_statuses(statuses)?;
    let purged = Cleaner::new(pool.clone())
        .purge_jobs(Duration::from_secs(older_than), statuses.as_deref())
        .await?;
    info!(count = purged, "old jobs purged");
    Ok(())
}

fn parse_statuses(names: &[String]) -> anyhow::Result<Option<Vec<JobStatus>>> {
    if names.is_empty() {
        return Ok(None);
    }
    let mut statuses = Vec::with_capacity(names.len());
    for name in names {
        let status = match name.as_str() {
            "pending" => JobStatus::Pending,
            "executing" => JobStatus::Executing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "discarded" => JobStatus::Discarded,
            other => bail!("unknown job status {other:?}"),
        };
        statuses.push(status);
    }
    Ok(Some(statuses))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_parse_by_name() {
        let parsed = parse_statuses(&["completed".into(), "failed".into()])
            .unwrap()
            .unwrap();
        assert_eq!(parsed, vec![JobStatus::Completed, JobStatus::Failed]);
        assert!(parse_statuses(&[]).unwrap().is_none());
        assert!(parse_statuses(&["running".into()]).is_err());
    }
}
