//! Pruning of old terminal runs and the artifacts only they hold.

use chrono::{DateTime, Utc};
use conveyor_types::{Result, Run, RunId};

use crate::artifacts::{run_owner, ArtifactStore};
use crate::config::RetentionPolicy;
use crate::state::RunStateStore;

/// Terminal runs that `policy` no longer keeps, newest first.
///
/// Runs that are still Pending or Running are never selected. With neither
/// limit set nothing is selected.
pub fn select_expired<'a>(runs: &'a [Run], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<&'a Run> {
    let mut terminal: Vec<&Run> = runs.iter().filter(|r| r.is_terminal()).collect();
    terminal.sort_by(|a, b| b.id.cmp(&a.id));

    terminal
        .into_iter()
        .enumerate()
        .filter(|(rank, run)| {
            let over_count = policy.keep_last.is_some_and(|keep| *rank >= keep);
            let too_old = match (policy.max_age, run.finished_at) {
                (Some(max_age), Some(finished)) => chrono::Duration::from_std(max_age)
                    .map(|age| finished + age < now)
                    .unwrap_or(false),
                _ => false,
            };
            over_count || too_old
        })
        .map(|(_, run)| run)
        .collect()
}

/// Delete expired run records and release their artifacts. Returns the ids removed.
pub async fn prune(
    store: &dyn RunStateStore,
    artifacts: &dyn ArtifactStore,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<RunId>> {
    let runs = store.list().await?;
    let expired: Vec<RunId> = select_expired(&runs, policy, now)
        .into_iter()
        .map(|r| r.id)
        .collect();

    for id in &expired {
        store.delete(*id).await?;
        let blobs = artifacts.release_owner(&run_owner(*id)).await?;
        tracing::info!(run = %id, blobs, "pruned run");
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use conveyor_types::RunStatus;

    use crate::artifacts::{run_key, MemoryArtifactStore};
    use crate::state::MemoryRunStore;

    fn finished(id: u64, status: RunStatus, days_ago: i64, now: DateTime<Utc>) -> Run {
        let mut run = Run::new(RunId(id), "web", serde_json::json!({}), ["Build"]);
        run.start().unwrap();
        run.finish(status).unwrap();
        run.finished_at = Some(now - chrono::Duration::days(days_ago));
        run
    }

    #[test]
    fn keep_last_keeps_newest() {
        let now = Utc::now();
        let runs: Vec<Run> = (1..=5).map(|i| finished(i, RunStatus::Succeeded, 0, now)).collect();
        let policy = RetentionPolicy {
            keep_last: Some(2),
            max_age: None,
        };
        let ids: Vec<RunId> = select_expired(&runs, &policy, now).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RunId(3), RunId(2), RunId(1)]);
    }

    #[test]
    fn max_age_drops_old_runs() {
        let now = Utc::now();
        let runs = vec![
            finished(1, RunStatus::Failed, 40, now),
            finished(2, RunStatus::Succeeded, 10, now),
        ];
        let policy = RetentionPolicy {
            keep_last: None,
            max_age: Some(Duration::from_secs(30 * 86_400)),
        };
        let ids: Vec<RunId> = select_expired(&runs, &policy, now).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RunId(1)]);
    }

    #[test]
    fn incomplete_runs_are_never_selected() {
        let now = Utc::now();
        let mut running = Run::new(RunId(1), "web", serde_json::json!({}), ["Build"]);
        running.start().unwrap();
        let runs = vec![running, finished(2, RunStatus::Aborted, 0, now)];
        let policy = RetentionPolicy {
            keep_last: Some(0),
            max_age: None,
        };
        let ids: Vec<RunId> = select_expired(&runs, &policy, now).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![RunId(2)]);
    }

    #[test]
    fn empty_policy_keeps_everything() {
        let now = Utc::now();
        let runs = vec![finished(1, RunStatus::Succeeded, 400, now)];
        assert!(select_expired(&runs, &RetentionPolicy::default(), now).is_empty());
    }

    #[tokio::test]
    async fn prune_deletes_records_and_blobs() {
        let now = Utc::now();
        let store = MemoryRunStore::new();
        let artifacts = MemoryArtifactStore::new();
        for i in 1..=3 {
            let id = store.next_run_id().await.unwrap();
            assert_eq!(id, RunId(i));
            store.save(&finished(i, RunStatus::Succeeded, 0, now)).await.unwrap();
            let artifact = artifacts
                .put(&run_key(id, "dist"), format!("bundle {}", i).as_bytes())
                .await
                .unwrap();
            artifacts.retain(&artifact, &run_owner(id)).await.unwrap();
        }

        let policy = RetentionPolicy {
            keep_last: Some(1),
            max_age: None,
        };
        let pruned = prune(&store, &artifacts, &policy, now).await.unwrap();
        assert_eq!(pruned, vec![RunId(2), RunId(1)]);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(artifacts.blob_count().await, 1);
    }
}
