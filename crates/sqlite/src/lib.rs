//! SQLite backend for the quarry job engine.
//!
//! Stores jobs and queue configurations as rows, with claim atomicity
//! provided by a single `UPDATE ... RETURNING` statement over the
//! eligible set.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quarry_sqlite::SqliteBackend;
//! use quarry_core::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> quarry_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:jobs.db", "myapp").await?;
//!     let engine = Engine::new(backend, EngineConfig::new().queue("default")).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;

use quarry_core::{
    now_ms, Backend, ErrorData, Job, JobFilter, JobId, JobState, JobUpdate, NewJob, NewQueue,
    QuarryError, QueueConfig, QueueState, QueueUpdate, Result, StateCounts, TimeRange,
    UniquenessConfig,
};

/// SQLite backend for job and queue storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    /// Connect to a SQLite database.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite`
    /// or `sqlite::memory:`. Call [`Backend::migrate`] (the engine does
    /// this on construction) before first use.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single connection for writes
            .connect(database_url)
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        Ok(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    fn queues_table(&self) -> String {
        format!("{}_queues", self.namespace)
    }

    fn job_from_row(&self, row: &SqliteRow) -> Result<Job> {
        let state_str: String = row
            .try_get("state")
            .map_err(|e| QuarryError::Backend(format!("Failed to read job row: {}", e)))?;
        let state = JobState::parse(&state_str)
            .ok_or_else(|| QuarryError::Backend(format!("Unknown job state '{}'", state_str)))?;

        let args: String = get(row, "args")?;
        let constructor_args: String = get(row, "constructor_args")?;
        let errors: String = get(row, "errors")?;
        let result: Option<String> = get(row, "result")?;
        let uniqueness: Option<String> = get(row, "uniqueness")?;
        let timeout_ms: Option<i64> = get(row, "timeout_ms")?;

        Ok(Job {
            id: JobId(get(row, "id")?),
            queue: get(row, "queue")?,
            state,
            class: get(row, "class")?,
            args: serde_json::from_str(&args)?,
            constructor_args: serde_json::from_str(&constructor_args)?,
            attempt: get::<i64>(row, "attempt")? as u32,
            max_attempts: get::<i64>(row, "max_attempts")? as u32,
            timeout: timeout_ms.map(|ms| Duration::from_millis(ms as u64)),
            result: result.map(|s| serde_json::from_str(&s)).transpose()?,
            errors: serde_json::from_str::<Vec<ErrorData>>(&errors)?,
            inserted_at: get(row, "inserted_at")?,
            available_at: get(row, "available_at")?,
            attempted_at: get(row, "attempted_at")?,
            completed_at: get(row, "completed_at")?,
            failed_at: get(row, "failed_at")?,
            cancelled_at: get(row, "cancelled_at")?,
            claimed_by: get(row, "claimed_by")?,
            claimed_at: get(row, "claimed_at")?,
            unique_digest: get(row, "unique_digest")?,
            uniqueness: uniqueness
                .map(|s| serde_json::from_str::<UniquenessConfig>(&s))
                .transpose()?,
        })
    }

    fn queue_from_row(&self, row: &SqliteRow) -> Result<QueueConfig> {
        let state_str: String = get(row, "state")?;
        let state = match state_str.as_str() {
            "active" => QueueState::Active,
            "paused" => QueueState::Paused,
            other => {
                return Err(QuarryError::Backend(format!(
                    "Unknown queue state '{}'",
                    other
                )))
            }
        };
        Ok(QueueConfig {
            id: get(row, "id")?,
            name: get(row, "name")?,
            concurrency: get::<i64>(row, "concurrency")? as u32,
            priority: get::<i64>(row, "priority")? as i32,
            state,
        })
    }

    /// Write every mutable job column from an in-memory row. Used by
    /// `update_job` inside its transaction.
    async fn store_job(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        job: &Job,
    ) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {} SET
                state = ?, attempt = ?, result = ?, errors = ?,
                available_at = ?, attempted_at = ?, completed_at = ?,
                failed_at = ?, cancelled_at = ?, claimed_by = ?,
                claimed_at = ?, unique_digest = ?
            WHERE id = ?
            "#,
            self.jobs_table()
        ))
        .bind(job.state.as_str())
        .bind(job.attempt as i64)
        .bind(
            job.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&job.errors)?)
        .bind(job.available_at)
        .bind(job.attempted_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.cancelled_at)
        .bind(&job.claimed_by)
        .bind(job.claimed_at)
        .bind(&job.unique_digest)
        .bind(job.id.0)
        .execute(&mut **tx)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to update job: {}", e)))?;
        Ok(())
    }
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column)
        .map_err(|e| QuarryError::Backend(format!("Failed to read job row: {}", e)))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let now = now_ms();
        let state = new.state.unwrap_or(JobState::Waiting);
        let available_at = new.available_at.unwrap_or(now);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                queue, state, class, args, constructor_args, attempt,
                max_attempts, timeout_ms, errors, inserted_at,
                available_at, unique_digest, uniqueness
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, '[]', ?, ?, ?, ?)
            RETURNING *
            "#,
            self.jobs_table()
        ))
        .bind(&new.queue)
        .bind(state.as_str())
        .bind(&new.class)
        .bind(serde_json::to_string(&new.args)?)
        .bind(serde_json::to_string(&new.constructor_args)?)
        .bind(new.max_attempts as i64)
        .bind(new.timeout.map(|t| t.as_millis() as i64))
        .bind(now)
        .bind(available_at)
        .bind(&new.unique_digest)
        .bind(
            new.uniqueness
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QuarryError::DuplicateJob {
                    class: new.class.clone(),
                    digest: new.unique_digest.clone().unwrap_or_default(),
                }
            } else {
                QuarryError::Backend(format!("Failed to insert job: {}", e))
            }
        })?;

        self.job_from_row(&row)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE id = ?",
            self.jobs_table()
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to fetch job: {}", e)))?;

        row.map(|r| self.job_from_row(&r)).transpose()
    }

    async fn claim_pending(&self, queue: &str, quantity: usize, worker: &str) -> Result<Vec<Job>> {
        if quantity == 0 {
            return Ok(Vec::new());
        }
        let now = now_ms();
        // One statement claims the whole batch, so two concurrent
        // claimers always partition the eligible set disjointly.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE {table} SET state = 'claimed', claimed_at = ?, claimed_by = ?
            WHERE id IN (
                SELECT id FROM {table}
                WHERE queue = ? AND state = 'waiting' AND available_at <= ?
                ORDER BY inserted_at, id
                LIMIT ?
            )
            RETURNING *
            "#,
            table = self.jobs_table()
        ))
        .bind(now)
        .bind(worker)
        .bind(queue)
        .bind(now)
        .bind(quantity as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to claim jobs: {}", e)))?;

        let mut jobs = rows
            .iter()
            .map(|r| self.job_from_row(r))
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified; restore FIFO order.
        jobs.sort_by_key(|j| (j.inserted_at, j.id.0));
        Ok(jobs)
    }

    async fn update_job(&self, update: JobUpdate) -> Result<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to begin transaction: {}", e)))?;

        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE id = ?",
            self.jobs_table()
        ))
        .bind(update.id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to fetch job: {}", e)))?
        .ok_or(QuarryError::NotFound(update.id))?;

        let mut job = self.job_from_row(&row)?;
        if update.apply(&mut job) {
            self.store_job(&mut tx, &job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to commit update: {}", e)))?;
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT * FROM {} WHERE 1=1", self.jobs_table());
        if filter.queue.is_some() {
            sql.push_str(" AND queue = ?");
        }
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.class.is_some() {
            sql.push_str(" AND class = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(queue) = &filter.queue {
            query = query.bind(queue);
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(class) = &filter.class {
            query = query.bind(class);
        }
        let rows = query
            .bind(filter.effective_limit() as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to list jobs: {}", e)))?;

        rows.iter().map(|r| self.job_from_row(r)).collect()
    }

    async fn count_jobs(&self, range: &TimeRange) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            r#"
            SELECT state, COUNT(*) FROM {}
            WHERE inserted_at >= ? AND inserted_at < ?
            GROUP BY state
            "#,
            self.jobs_table()
        ))
        .bind(range.since.unwrap_or(i64::MIN))
        .bind(range.until.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to count jobs: {}", e)))?;

        let mut counts = StateCounts::default();
        for (state, n) in rows {
            if let Some(state) = JobState::parse(&state) {
                counts.add_n(state, n as u64);
            }
        }
        Ok(counts)
    }

    async fn count_jobs_by_queue(&self) -> Result<HashMap<String, StateCounts>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(&format!(
            "SELECT queue, state, COUNT(*) FROM {} GROUP BY queue, state",
            self.jobs_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to count jobs by queue: {}", e)))?;

        let mut out: HashMap<String, StateCounts> = HashMap::new();
        for (queue, state, n) in rows {
            if let Some(state) = JobState::parse(&state) {
                out.entry(queue).or_default().add_n(state, n as u64);
            }
        }
        Ok(out)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT DISTINCT queue FROM {} ORDER BY queue",
            self.jobs_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to list queue names: {}", e)))?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn insert_queue(&self, queue: NewQueue) -> Result<QueueConfig> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (name, concurrency, priority, state)
            VALUES (?, ?, ?, 'active')
            ON CONFLICT(name) DO NOTHING
            "#,
            self.queues_table()
        ))
        .bind(&queue.name)
        .bind(queue.concurrency as i64)
        .bind(queue.priority as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to insert queue: {}", e)))?;

        self.get_queue(&queue.name)
            .await?
            .ok_or_else(|| QuarryError::Backend("Queue row missing after insert".to_string()))
    }

    async fn get_queue(&self, name: &str) -> Result<Option<QueueConfig>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE name = ?",
            self.queues_table()
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to fetch queue: {}", e)))?;
        row.map(|r| self.queue_from_row(&r)).transpose()
    }

    async fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} ORDER BY priority DESC, name",
            self.queues_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to list queues: {}", e)))?;
        rows.iter().map(|r| self.queue_from_row(r)).collect()
    }

    async fn update_queue(&self, update: QueueUpdate) -> Result<QueueConfig> {
        let current = self
            .get_queue(&update.name)
            .await?
            .ok_or_else(|| QuarryError::Validation(format!("unknown queue '{}'", update.name)))?;

        let concurrency = update.concurrency.unwrap_or(current.concurrency);
        let priority = update.priority.unwrap_or(current.priority);
        let state = update.state.unwrap_or(current.state);
        let state_str = match state {
            QueueState::Active => "active",
            QueueState::Paused => "paused",
        };

        sqlx::query(&format!(
            "UPDATE {} SET concurrency = ?, priority = ?, state = ? WHERE name = ?",
            self.queues_table()
        ))
        .bind(concurrency as i64)
        .bind(priority as i64)
        .bind(state_str)
        .bind(&update.name)
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to update queue: {}", e)))?;

        Ok(QueueConfig {
            concurrency,
            priority,
            state,
            ..current
        })
    }

    async fn stale_jobs(&self, max_claimed: Duration, max_running: Duration) -> Result<Vec<Job>> {
        let now = now_ms();
        let claimed_cutoff = now - max_claimed.as_millis() as i64;
        let default_running = max_running.as_millis() as i64;

        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM {}
            WHERE (state = 'claimed' AND claimed_at <= ?)
               OR (state = 'running'
                   AND attempted_at + COALESCE(timeout_ms, ?) <= ?)
            "#,
            self.jobs_table()
        ))
        .bind(claimed_cutoff)
        .bind(default_running)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to scan stale jobs: {}", e)))?;

        rows.iter().map(|r| self.job_from_row(r)).collect()
    }

    async fn delete_finished_jobs(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM {}
            WHERE state IN ('completed', 'failed', 'canceled')
              AND COALESCE(completed_at, failed_at, cancelled_at) < ?
            "#,
            self.jobs_table()
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to purge finished jobs: {}", e)))?;
        Ok(result.rows_affected())
    }

    async fn truncate(&self) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {}", self.jobs_table()))
            .execute(&self.pool)
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to truncate jobs: {}", e)))?;
        sqlx::query(&format!("DELETE FROM {}", self.queues_table()))
            .execute(&self.pool)
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to truncate queues: {}", e)))?;
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                state TEXT NOT NULL,
                class TEXT NOT NULL,
                args TEXT NOT NULL,
                constructor_args TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                timeout_ms INTEGER,
                result TEXT,
                errors TEXT NOT NULL DEFAULT '[]',
                inserted_at INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                attempted_at INTEGER,
                completed_at INTEGER,
                failed_at INTEGER,
                cancelled_at INTEGER,
                claimed_by TEXT,
                claimed_at INTEGER,
                unique_digest TEXT,
                uniqueness TEXT
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to create jobs table: {}", e)))?;

        // Claim-path index.
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_jobs_claim ON {} (queue, state, available_at)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to create claim index: {}", e)))?;

        // The digest column is cleared on terminal transitions, so a
        // partial unique index enforces at-most-one active holder.
        sqlx::query(&format!(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_{}_jobs_digest
            ON {} (unique_digest) WHERE unique_digest IS NOT NULL
            "#,
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to create digest index: {}", e)))?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                concurrency INTEGER NOT NULL DEFAULT 10,
                priority INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'active'
            )
            "#,
            self.queues_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| QuarryError::Backend(format!("Failed to create queues table: {}", e)))?;

        Ok(())
    }

    async fn rollback_migration(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.jobs_table()))
            .execute(&self.pool)
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to drop jobs table: {}", e)))?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.queues_table()))
            .execute(&self.pool)
            .await
            .map_err(|e| QuarryError::Backend(format!("Failed to drop queues table: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
