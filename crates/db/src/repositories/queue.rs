use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use winback_core::domain::conversation::ConversationId;
use winback_core::domain::job::{JobId, JobKind, JobState, QueueJob, QueueStats};

use super::{QueueRepository, RepositoryError};
use crate::DbPool;

pub struct SqlQueueRepository {
    pool: DbPool,
}

impl SqlQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl QueueRepository for SqlQueueRepository {
    async fn find_by_id(&self, id: &JobId) -> Result<Option<QueueJob>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                kind,
                conversation_id,
                payload_json,
                payload_hash,
                state,
                attempt_count,
                max_attempts,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                state_version,
                created_at,
                updated_at
             FROM queue_jobs
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn insert(&self, job: QueueJob) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO queue_jobs (
                id,
                kind,
                conversation_id,
                payload_json,
                payload_hash,
                state,
                attempt_count,
                max_attempts,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id.0)
        .bind(job.kind.as_str())
        .bind(job.conversation_id.as_ref().map(|id| id.0.as_str()))
        .bind(&job.payload_json)
        .bind(&job.payload_hash)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempt_count))
        .bind(i64::from(job.max_attempts))
        .bind(job.available_at.to_rfc3339())
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(|value| value.to_rfc3339()))
        .bind(job.last_error.as_deref())
        .bind(i64::from(job.state_version))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_unsettled_by_payload(
        &self,
        kind: JobKind,
        payload_hash: &str,
    ) -> Result<Option<QueueJob>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                kind,
                conversation_id,
                payload_json,
                payload_hash,
                state,
                attempt_count,
                max_attempts,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                state_version,
                created_at,
                updated_at
             FROM queue_jobs
             WHERE kind = ?
               AND payload_hash = ?
               AND state IN ('queued', 'running', 'retryable_failed')
             LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(payload_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn find_due(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueJob>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                kind,
                conversation_id,
                payload_json,
                payload_hash,
                state,
                attempt_count,
                max_attempts,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                state_version,
                created_at,
                updated_at
             FROM queue_jobs
             WHERE kind = ?
               AND ((state IN ('queued', 'retryable_failed') AND available_at <= ?)
                    OR (state = 'running' AND claimed_at < ?))
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(now.to_rfc3339())
        .bind(stale_before.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn update_guarded(
        &self,
        job: &QueueJob,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE queue_jobs
             SET state = ?,
                attempt_count = ?,
                available_at = ?,
                claimed_by = ?,
                claimed_at = ?,
                last_error = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.attempt_count))
        .bind(job.available_at.to_rfc3339())
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(|value| value.to_rfc3339()))
        .bind(job.last_error.as_deref())
        .bind(i64::from(job.state_version))
        .bind(job.updated_at.to_rfc3339())
        .bind(&job.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self, kind: JobKind, now: DateTime<Utc>) -> Result<QueueStats, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                IFNULL(SUM(CASE WHEN state IN ('queued', 'retryable_failed')
                    AND available_at <= ? THEN 1 ELSE 0 END), 0) AS waiting,
                IFNULL(SUM(CASE WHEN state = 'running' THEN 1 ELSE 0 END), 0) AS active,
                IFNULL(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                IFNULL(SUM(CASE WHEN state = 'failed_terminal' THEN 1 ELSE 0 END), 0) AS failed,
                IFNULL(SUM(CASE WHEN state IN ('queued', 'retryable_failed')
                    AND available_at > ? THEN 1 ELSE 0 END), 0) AS delayed
             FROM queue_jobs
             WHERE kind = ?",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            waiting: parse_count("waiting", row.try_get("waiting")?)?,
            active: parse_count("active", row.try_get("active")?)?,
            completed: parse_count("completed", row.try_get("completed")?)?,
            failed: parse_count("failed", row.try_get("failed")?)?,
            delayed: parse_count("delayed", row.try_get("delayed")?)?,
        })
    }
}

fn job_from_row(row: SqliteRow) -> Result<QueueJob, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = JobKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job kind `{kind_raw}`")))?;

    let state_raw = row.try_get::<String, _>("state")?;
    let state = JobState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job state `{state_raw}`")))?;

    Ok(QueueJob {
        id: JobId(row.try_get("id")?),
        kind,
        conversation_id: row.try_get::<Option<String>, _>("conversation_id")?.map(ConversationId),
        payload_json: row.try_get("payload_json")?,
        payload_hash: row.try_get("payload_hash")?,
        state,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        last_error: row.try_get("last_error")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_count(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative count): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use winback_core::domain::job::{JobId, JobKind, JobState, QueueJob, QueueStats};

    use super::SqlQueueRepository;
    use crate::migrations;
    use crate::repositories::QueueRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_queue_repo_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlQueueRepository::new(pool.clone());

        let job = sample_job("job-rt-001", JobKind::OutboundDelivery, "2026-02-23T12:00:00Z");
        repo.insert(job.clone()).await.expect("insert job");

        let found = repo.find_by_id(&job.id).await.expect("find job");
        assert_eq!(found, Some(job));

        pool.close().await;
    }

    #[tokio::test]
    async fn find_unsettled_by_payload_ignores_settled_jobs() {
        let pool = setup_pool().await;
        let repo = SqlQueueRepository::new(pool.clone());

        let mut job = sample_job("job-dup-001", JobKind::OutboundDelivery, "2026-02-23T12:00:00Z");
        job.payload_hash = "hash-dup".to_string();
        repo.insert(job.clone()).await.expect("insert job");

        let pending = repo
            .find_unsettled_by_payload(JobKind::OutboundDelivery, "hash-dup")
            .await
            .expect("find unsettled");
        assert_eq!(pending.as_ref().map(|found| &found.id), Some(&job.id));

        job.state = JobState::Completed;
        job.state_version = 2;
        let updated = repo.update_guarded(&job, 1).await.expect("settle job");
        assert!(updated);

        let settled = repo
            .find_unsettled_by_payload(JobKind::OutboundDelivery, "hash-dup")
            .await
            .expect("find after settle");
        assert_eq!(settled, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn find_due_picks_runnable_and_stale_jobs_only() {
        let pool = setup_pool().await;
        let repo = SqlQueueRepository::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");
        let stale_before = now - Duration::seconds(300);

        let due = sample_job("job-due-001", JobKind::InboundMessage, "2026-02-23T11:00:00Z");
        repo.insert(due).await.expect("insert due job");

        let mut future = sample_job("job-due-002", JobKind::InboundMessage, "2026-02-23T11:00:00Z");
        future.available_at = now + Duration::seconds(60);
        repo.insert(future).await.expect("insert future job");

        let mut fresh_running =
            sample_job("job-due-003", JobKind::InboundMessage, "2026-02-23T11:00:00Z");
        fresh_running.state = JobState::Running;
        fresh_running.claimed_by = Some("worker-001".to_string());
        fresh_running.claimed_at = Some(now - Duration::seconds(30));
        repo.insert(fresh_running).await.expect("insert fresh running job");

        let mut stale_running =
            sample_job("job-due-004", JobKind::InboundMessage, "2026-02-23T10:00:00Z");
        stale_running.state = JobState::Running;
        stale_running.claimed_by = Some("worker-002".to_string());
        stale_running.claimed_at = Some(now - Duration::seconds(600));
        repo.insert(stale_running).await.expect("insert stale running job");

        let mut other_kind =
            sample_job("job-due-005", JobKind::OutboundDelivery, "2026-02-23T11:00:00Z");
        other_kind.payload_hash = "hash-other".to_string();
        repo.insert(other_kind).await.expect("insert other-kind job");

        let found = repo
            .find_due(JobKind::InboundMessage, now, stale_before, 10)
            .await
            .expect("find due jobs");

        let ids: Vec<&str> = found.iter().map(|job| job.id.0.as_str()).collect();
        assert_eq!(ids, vec!["job-due-004", "job-due-001"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn update_guarded_rejects_a_lost_race() {
        let pool = setup_pool().await;
        let repo = SqlQueueRepository::new(pool.clone());

        let job = sample_job("job-race-001", JobKind::OutboundDelivery, "2026-02-23T12:00:00Z");
        repo.insert(job.clone()).await.expect("insert job");

        let mut winner = job.clone();
        winner.state = JobState::Running;
        winner.claimed_by = Some("worker-001".to_string());
        winner.claimed_at = Some(parse_ts("2026-02-23T12:00:01Z"));
        winner.attempt_count = 1;
        winner.state_version = 2;
        assert!(repo.update_guarded(&winner, 1).await.expect("winner update"));

        let mut loser = job.clone();
        loser.state = JobState::Running;
        loser.claimed_by = Some("worker-002".to_string());
        loser.claimed_at = Some(parse_ts("2026-02-23T12:00:02Z"));
        loser.attempt_count = 1;
        loser.state_version = 2;
        assert!(!repo.update_guarded(&loser, 1).await.expect("loser update"));

        let stored = repo.find_by_id(&job.id).await.expect("find").expect("exists");
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-001"));

        pool.close().await;
    }

    #[tokio::test]
    async fn stats_buckets_jobs_by_operational_state() {
        let pool = setup_pool().await;
        let repo = SqlQueueRepository::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");

        let waiting = sample_job("job-st-001", JobKind::OutboundDelivery, "2026-02-23T11:00:00Z");
        repo.insert(waiting).await.expect("insert waiting");

        let mut delayed =
            sample_job("job-st-002", JobKind::OutboundDelivery, "2026-02-23T11:00:00Z");
        delayed.state = JobState::RetryableFailed;
        delayed.available_at = now + Duration::seconds(120);
        repo.insert(delayed).await.expect("insert delayed");

        let mut active = sample_job("job-st-003", JobKind::OutboundDelivery, "2026-02-23T11:00:00Z");
        active.state = JobState::Running;
        active.claimed_by = Some("worker-001".to_string());
        active.claimed_at = Some(now);
        repo.insert(active).await.expect("insert active");

        let mut completed =
            sample_job("job-st-004", JobKind::OutboundDelivery, "2026-02-23T11:00:00Z");
        completed.state = JobState::Completed;
        repo.insert(completed).await.expect("insert completed");

        let mut failed = sample_job("job-st-005", JobKind::OutboundDelivery, "2026-02-23T11:00:00Z");
        failed.state = JobState::FailedTerminal;
        failed.last_error = Some("recipient invalid".to_string());
        repo.insert(failed).await.expect("insert failed");

        let stats = repo.stats(JobKind::OutboundDelivery, now).await.expect("stats");
        assert_eq!(
            stats,
            QueueStats { waiting: 1, active: 1, completed: 1, failed: 1, delayed: 1 },
        );

        let empty = repo.stats(JobKind::InboundMessage, now).await.expect("empty stats");
        assert_eq!(empty, QueueStats::default());

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_job(id: &str, kind: JobKind, available_at: &str) -> QueueJob {
        QueueJob {
            id: JobId(id.to_string()),
            kind,
            conversation_id: None,
            payload_json: format!("{{\"job\":\"{id}\"}}"),
            payload_hash: format!("hash-{id}"),
            state: JobState::Queued,
            attempt_count: 0,
            max_attempts: 5,
            available_at: parse_ts(available_at),
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            state_version: 1,
            created_at: parse_ts("2026-02-23T10:00:00Z"),
            updated_at: parse_ts("2026-02-23T10:00:00Z"),
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
