//! Durable state for allotment resolution: the result store, the scrape-job
//! queue, and the read-only IPO directory, each behind an async trait with a
//! Postgres implementation and an in-memory substitute for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use allot_core::{normalize_tax_id, AllotmentResult, AllotmentStatus, IpoRecord, ScrapeJob};

pub const CRATE_NAME: &str = "allot-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored status {value:?} for ({ipo_id}, {tax_id}) is not a known status")]
    CorruptStatus {
        ipo_id: Uuid,
        tax_id: String,
        value: String,
    },
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub async fn connect_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Latest-known-status store keyed by (ipo_id, tax_id). Both upserts are
/// single conditional writes; the pair's uniqueness constraint is the final
/// backstop against concurrent creators.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get_batch(
        &self,
        ipo_id: Uuid,
        tax_ids: &[String],
    ) -> StoreResult<HashMap<String, AllotmentResult>>;

    /// Find-or-create-and-overwrite to the in-flight marker. Refreshes
    /// `last_checked` and clears the message; prior units stay in place.
    async fn upsert_in_flight(&self, ipo_id: Uuid, tax_id: &str) -> StoreResult<AllotmentResult>;

    /// Idempotent terminal/inconclusive outcome write; last writer wins.
    async fn upsert_outcome(
        &self,
        ipo_id: Uuid,
        tax_id: &str,
        status: AllotmentStatus,
        units: i64,
        message: &str,
    ) -> StoreResult<AllotmentResult>;

    /// Rows left in `error` or `unknown`, for the reconciliation sweep.
    async fn unresolved(&self, ipo_id: Uuid) -> StoreResult<Vec<AllotmentResult>>;
}

/// Read-only lookup into IPO metadata owned by the surrounding system.
#[async_trait]
pub trait IpoDirectory: Send + Sync {
    async fn lookup(&self, ipo_id: Uuid) -> StoreResult<Option<IpoRecord>>;

    /// IPOs listed within the trailing window or flagged as having
    /// allotment results available.
    async fn in_window(&self, now: DateTime<Utc>, window_days: i64) -> StoreResult<Vec<IpoRecord>>;
}

#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: ScrapeJob,
    pub attempt: u32,
}

/// Durable at-least-once queue carrying one scrape task per (ipo, tax-ID).
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue_batch(&self, jobs: Vec<ScrapeJob>) -> StoreResult<usize>;
    async fn claim_next(&self) -> StoreResult<Option<LeasedJob>>;
    async fn complete(&self, job_id: Uuid) -> StoreResult<()>;
    async fn fail(&self, job_id: Uuid, error_message: &str) -> StoreResult<()>;
}

/// Exponential backoff between job retries, doubled per attempt and capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    /// A claimed job whose lease is older than this is re-claimable.
    /// Duplicate execution is tolerated; outcomes are idempotent upserts.
    pub lease_timeout: Duration,
    /// How many failed jobs to retain for diagnostics.
    pub failed_retention: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease_timeout: Duration::from_secs(300),
            failed_retention: 200,
        }
    }
}

const RESULT_COLUMNS: &str = "ipo_id, tax_id, status, units, message, last_checked";

fn result_from_row(row: &PgRow) -> StoreResult<AllotmentResult> {
    let ipo_id: Uuid = row.try_get("ipo_id")?;
    let tax_id: String = row.try_get("tax_id")?;
    let value: String = row.try_get("status")?;
    let status = AllotmentStatus::parse(&value).ok_or_else(|| StoreError::CorruptStatus {
        ipo_id,
        tax_id: tax_id.clone(),
        value,
    })?;
    Ok(AllotmentResult {
        ipo_id,
        tax_id,
        status,
        units: row.try_get("units")?,
        message: row.try_get("message")?,
        last_checked: row.try_get("last_checked")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn get_batch(
        &self,
        ipo_id: Uuid,
        tax_ids: &[String],
    ) -> StoreResult<HashMap<String, AllotmentResult>> {
        if tax_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let normalized: Vec<String> = tax_ids.iter().map(|t| normalize_tax_id(t)).collect();
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM allotment_results WHERE ipo_id = $1 AND tax_id = ANY($2)"
        ))
        .bind(ipo_id)
        .bind(&normalized)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let result = result_from_row(row)?;
            out.insert(result.tax_id.clone(), result);
        }
        Ok(out)
    }

    async fn upsert_in_flight(&self, ipo_id: Uuid, tax_id: &str) -> StoreResult<AllotmentResult> {
        let tax_id = normalize_tax_id(tax_id);
        let row = sqlx::query(&format!(
            "INSERT INTO allotment_results (ipo_id, tax_id, status, units, message, last_checked) \
             VALUES ($1, $2, $3, 0, '', NOW()) \
             ON CONFLICT (ipo_id, tax_id) \
             DO UPDATE SET status = EXCLUDED.status, message = '', last_checked = NOW() \
             RETURNING {RESULT_COLUMNS}"
        ))
        .bind(ipo_id)
        .bind(&tax_id)
        .bind(AllotmentStatus::InFlight.as_str())
        .fetch_one(&self.pool)
        .await?;
        result_from_row(&row)
    }

    async fn upsert_outcome(
        &self,
        ipo_id: Uuid,
        tax_id: &str,
        status: AllotmentStatus,
        units: i64,
        message: &str,
    ) -> StoreResult<AllotmentResult> {
        let tax_id = normalize_tax_id(tax_id);
        let row = sqlx::query(&format!(
            "INSERT INTO allotment_results (ipo_id, tax_id, status, units, message, last_checked) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (ipo_id, tax_id) \
             DO UPDATE SET status = EXCLUDED.status, units = EXCLUDED.units, \
                           message = EXCLUDED.message, last_checked = NOW() \
             RETURNING {RESULT_COLUMNS}"
        ))
        .bind(ipo_id)
        .bind(&tax_id)
        .bind(status.as_str())
        .bind(units.max(0))
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        result_from_row(&row)
    }

    async fn unresolved(&self, ipo_id: Uuid) -> StoreResult<Vec<AllotmentResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM allotment_results \
             WHERE ipo_id = $1 AND status = ANY($2) \
             ORDER BY last_checked"
        ))
        .bind(ipo_id)
        .bind(vec![
            AllotmentStatus::Error.as_str().to_string(),
            AllotmentStatus::Unknown.as_str().to_string(),
        ])
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgIpoDirectory {
    pool: PgPool,
}

impl PgIpoDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ipo_from_row(row: &PgRow) -> StoreResult<IpoRecord> {
    Ok(IpoRecord {
        ipo_id: row.try_get("ipo_id")?,
        company_name: row.try_get("company_name")?,
        registrar_name: row.try_get("registrar_name")?,
        listing_date: row.try_get("listing_date")?,
        allotment_out: row.try_get("allotment_out")?,
    })
}

#[async_trait]
impl IpoDirectory for PgIpoDirectory {
    async fn lookup(&self, ipo_id: Uuid) -> StoreResult<Option<IpoRecord>> {
        let row = sqlx::query(
            "SELECT ipo_id, company_name, registrar_name, listing_date, allotment_out \
             FROM ipos WHERE ipo_id = $1",
        )
        .bind(ipo_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ipo_from_row).transpose()
    }

    async fn in_window(&self, now: DateTime<Utc>, window_days: i64) -> StoreResult<Vec<IpoRecord>> {
        let cutoff = (now - chrono::Duration::days(window_days.max(0))).date_naive();
        let rows = sqlx::query(
            "SELECT ipo_id, company_name, registrar_name, listing_date, allotment_out \
             FROM ipos WHERE listing_date >= $1 OR allotment_out \
             ORDER BY listing_date DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ipo_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }
}

fn leased_from_row(row: &PgRow) -> StoreResult<LeasedJob> {
    let attempts: i32 = row.try_get("attempts")?;
    Ok(LeasedJob {
        job: ScrapeJob {
            id: row.try_get("id")?,
            ipo_id: row.try_get("ipo_id")?,
            tax_id: row.try_get("tax_id")?,
            company_name: row.try_get("company_name")?,
            registrar_hint: row.try_get("registrar_hint")?,
            client_ref: row.try_get("client_ref")?,
        },
        attempt: attempts.max(0) as u32,
    })
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue_batch(&self, jobs: Vec<ScrapeJob>) -> StoreResult<usize> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for job in &jobs {
            sqlx::query(
                "INSERT INTO scrape_jobs \
                 (id, ipo_id, tax_id, company_name, registrar_hint, client_ref, state, run_after) \
                 VALUES ($1, $2, $3, $4, $5, $6, 'pending', NOW())",
            )
            .bind(job.id)
            .bind(job.ipo_id)
            .bind(&job.tax_id)
            .bind(&job.company_name)
            .bind(&job.registrar_hint)
            .bind(&job.client_ref)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = jobs.len(), "enqueued scrape jobs");
        Ok(jobs.len())
    }

    async fn claim_next(&self) -> StoreResult<Option<LeasedJob>> {
        let lease_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let row = sqlx::query(
            "UPDATE scrape_jobs \
             SET state = 'running', leased_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM scrape_jobs \
                 WHERE (state = 'pending' AND run_after <= NOW()) \
                    OR (state = 'running' AND leased_at < $1) \
                 ORDER BY run_after \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, ipo_id, tax_id, company_name, registrar_hint, client_ref, attempts",
        )
        .bind(lease_cutoff)
        .fetch_optional(&self.pool)
        .await?;
        let leased = row.as_ref().map(leased_from_row).transpose()?;
        if let Some(leased) = &leased {
            debug!(job_id = %leased.job.id, attempt = leased.attempt, "claimed scrape job");
        }
        Ok(leased)
    }

    async fn complete(&self, job_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM scrape_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error_message: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT attempts FROM scrape_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(());
        };
        let attempts: i32 = row.try_get("attempts")?;
        let attempts = attempts.max(0) as u32 + 1;

        if attempts >= self.config.retry.max_attempts {
            sqlx::query(
                "UPDATE scrape_jobs \
                 SET state = 'failed', attempts = $2, last_error = $3, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempts as i32)
            .bind(error_message)
            .execute(&mut *tx)
            .await?;
            // keep only the newest failed jobs
            sqlx::query(
                "DELETE FROM scrape_jobs WHERE state = 'failed' AND id IN ( \
                     SELECT id FROM scrape_jobs WHERE state = 'failed' \
                     ORDER BY updated_at DESC OFFSET $1 \
                 )",
            )
            .bind(self.config.failed_retention as i64)
            .execute(&mut *tx)
            .await?;
        } else {
            let delay = self.config.retry.delay_for_attempt(attempts - 1);
            let run_after = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
            sqlx::query(
                "UPDATE scrape_jobs \
                 SET state = 'pending', attempts = $2, run_after = $3, last_error = $4, \
                     leased_at = NULL, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempts as i32)
            .bind(run_after)
            .bind(error_message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub mod memory {
    //! In-memory store/queue/directory with the same semantics as the
    //! Postgres implementations. The engine and web tests run against these.

    use std::collections::VecDeque;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemoryResultStore {
        rows: Mutex<HashMap<(Uuid, String), AllotmentResult>>,
    }

    impl MemoryResultStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert a row verbatim, bypassing the upsert timestamps. Test setup.
        pub async fn seed(&self, result: AllotmentResult) {
            let mut rows = self.rows.lock().await;
            rows.insert((result.ipo_id, result.tax_id.clone()), result);
        }

        pub async fn len(&self) -> usize {
            self.rows.lock().await.len()
        }

        pub async fn get(&self, ipo_id: Uuid, tax_id: &str) -> Option<AllotmentResult> {
            let rows = self.rows.lock().await;
            rows.get(&(ipo_id, normalize_tax_id(tax_id))).cloned()
        }
    }

    #[async_trait]
    impl ResultStore for MemoryResultStore {
        async fn get_batch(
            &self,
            ipo_id: Uuid,
            tax_ids: &[String],
        ) -> StoreResult<HashMap<String, AllotmentResult>> {
            let rows = self.rows.lock().await;
            let mut out = HashMap::new();
            for tax_id in tax_ids {
                let key = (ipo_id, normalize_tax_id(tax_id));
                if let Some(row) = rows.get(&key) {
                    out.insert(key.1, row.clone());
                }
            }
            Ok(out)
        }

        async fn upsert_in_flight(
            &self,
            ipo_id: Uuid,
            tax_id: &str,
        ) -> StoreResult<AllotmentResult> {
            let tax_id = normalize_tax_id(tax_id);
            let mut rows = self.rows.lock().await;
            let row = rows
                .entry((ipo_id, tax_id.clone()))
                .and_modify(|row| {
                    row.status = AllotmentStatus::InFlight;
                    row.message.clear();
                    row.last_checked = Utc::now();
                })
                .or_insert_with(|| AllotmentResult {
                    ipo_id,
                    tax_id,
                    status: AllotmentStatus::InFlight,
                    units: 0,
                    message: String::new(),
                    last_checked: Utc::now(),
                });
            Ok(row.clone())
        }

        async fn upsert_outcome(
            &self,
            ipo_id: Uuid,
            tax_id: &str,
            status: AllotmentStatus,
            units: i64,
            message: &str,
        ) -> StoreResult<AllotmentResult> {
            let tax_id = normalize_tax_id(tax_id);
            let mut rows = self.rows.lock().await;
            let row = AllotmentResult {
                ipo_id,
                tax_id: tax_id.clone(),
                status,
                units: units.max(0),
                message: message.to_string(),
                last_checked: Utc::now(),
            };
            rows.insert((ipo_id, tax_id), row.clone());
            Ok(row)
        }

        async fn unresolved(&self, ipo_id: Uuid) -> StoreResult<Vec<AllotmentResult>> {
            let rows = self.rows.lock().await;
            let mut out: Vec<AllotmentResult> = rows
                .values()
                .filter(|row| {
                    row.ipo_id == ipo_id
                        && matches!(
                            row.status,
                            AllotmentStatus::Error | AllotmentStatus::Unknown
                        )
                })
                .cloned()
                .collect();
            out.sort_by_key(|row| row.last_checked);
            Ok(out)
        }
    }

    #[derive(Debug, Default)]
    struct QueueState {
        pending: VecDeque<PendingJob>,
        running: HashMap<Uuid, RunningJob>,
        failed: Vec<FailedJob>,
        total_enqueued: usize,
    }

    #[derive(Debug)]
    struct PendingJob {
        job: ScrapeJob,
        attempts: u32,
        run_after: DateTime<Utc>,
    }

    #[derive(Debug)]
    struct RunningJob {
        job: ScrapeJob,
        attempts: u32,
        leased_at: DateTime<Utc>,
    }

    #[derive(Debug)]
    struct FailedJob {
        job: ScrapeJob,
        last_error: String,
        failed_at: DateTime<Utc>,
    }

    #[derive(Debug)]
    pub struct MemoryJobQueue {
        state: Mutex<QueueState>,
        config: QueueConfig,
    }

    impl Default for MemoryJobQueue {
        fn default() -> Self {
            Self::new(QueueConfig::default())
        }
    }

    impl MemoryJobQueue {
        pub fn new(config: QueueConfig) -> Self {
            Self {
                state: Mutex::new(QueueState::default()),
                config,
            }
        }

        /// Zero retry delay so drained tests retry within one pass.
        pub fn with_immediate_retries() -> Self {
            Self::new(QueueConfig {
                retry: RetryPolicy {
                    base_delay: Duration::ZERO,
                    ..RetryPolicy::default()
                },
                ..QueueConfig::default()
            })
        }

        pub async fn depth(&self) -> usize {
            let state = self.state.lock().await;
            state.pending.len() + state.running.len()
        }

        pub async fn total_enqueued(&self) -> usize {
            self.state.lock().await.total_enqueued
        }

        pub async fn failed_count(&self) -> usize {
            self.state.lock().await.failed.len()
        }

        /// (job id, last error) for retained failed jobs, oldest first.
        pub async fn failed_jobs(&self) -> Vec<(Uuid, String)> {
            self.state
                .lock()
                .await
                .failed
                .iter()
                .map(|f| (f.job.id, f.last_error.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl JobQueue for MemoryJobQueue {
        async fn enqueue_batch(&self, jobs: Vec<ScrapeJob>) -> StoreResult<usize> {
            let mut state = self.state.lock().await;
            let count = jobs.len();
            state.total_enqueued += count;
            let now = Utc::now();
            for job in jobs {
                state.pending.push_back(PendingJob {
                    job,
                    attempts: 0,
                    run_after: now,
                });
            }
            Ok(count)
        }

        async fn claim_next(&self) -> StoreResult<Option<LeasedJob>> {
            let mut state = self.state.lock().await;
            let now = Utc::now();

            // expired leases are re-claimable, matching the durable queue
            let lease_cutoff = now
                - chrono::Duration::from_std(self.config.lease_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
            let expired: Vec<Uuid> = state
                .running
                .values()
                .filter(|r| r.leased_at < lease_cutoff)
                .map(|r| r.job.id)
                .collect();
            for id in expired {
                if let Some(run) = state.running.remove(&id) {
                    state.pending.push_back(PendingJob {
                        job: run.job,
                        attempts: run.attempts,
                        run_after: now,
                    });
                }
            }

            let ready = state.pending.iter().position(|p| p.run_after <= now);
            let Some(index) = ready else {
                return Ok(None);
            };
            let Some(pending) = state.pending.remove(index) else {
                return Ok(None);
            };
            let leased = LeasedJob {
                job: pending.job.clone(),
                attempt: pending.attempts,
            };
            state.running.insert(
                pending.job.id,
                RunningJob {
                    job: pending.job,
                    attempts: pending.attempts,
                    leased_at: now,
                },
            );
            Ok(Some(leased))
        }

        async fn complete(&self, job_id: Uuid) -> StoreResult<()> {
            let mut state = self.state.lock().await;
            state.running.remove(&job_id);
            Ok(())
        }

        async fn fail(&self, job_id: Uuid, error_message: &str) -> StoreResult<()> {
            let mut state = self.state.lock().await;
            let Some(run) = state.running.remove(&job_id) else {
                return Ok(());
            };
            let attempts = run.attempts + 1;
            if attempts >= self.config.retry.max_attempts {
                state.failed.push(FailedJob {
                    job: run.job,
                    last_error: error_message.to_string(),
                    failed_at: Utc::now(),
                });
                let retention = self.config.failed_retention as usize;
                if state.failed.len() > retention {
                    state.failed.sort_by_key(|f| f.failed_at);
                    let excess = state.failed.len() - retention;
                    state.failed.drain(..excess);
                }
            } else {
                let delay = self.config.retry.delay_for_attempt(attempts - 1);
                let run_after = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                state.pending.push_back(PendingJob {
                    job: run.job,
                    attempts,
                    run_after,
                });
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryIpoDirectory {
        ipos: Mutex<HashMap<Uuid, IpoRecord>>,
    }

    impl MemoryIpoDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, ipo: IpoRecord) {
            self.ipos.lock().await.insert(ipo.ipo_id, ipo);
        }
    }

    #[async_trait]
    impl IpoDirectory for MemoryIpoDirectory {
        async fn lookup(&self, ipo_id: Uuid) -> StoreResult<Option<IpoRecord>> {
            Ok(self.ipos.lock().await.get(&ipo_id).cloned())
        }

        async fn in_window(
            &self,
            now: DateTime<Utc>,
            window_days: i64,
        ) -> StoreResult<Vec<IpoRecord>> {
            let cutoff = (now - chrono::Duration::days(window_days.max(0))).date_naive();
            let ipos = self.ipos.lock().await;
            let mut out: Vec<IpoRecord> = ipos
                .values()
                .filter(|ipo| ipo.listing_date >= cutoff || ipo.allotment_out)
                .cloned()
                .collect();
            out.sort_by(|a, b| b.listing_date.cmp(&a.listing_date));
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::memory::{MemoryIpoDirectory, MemoryJobQueue, MemoryResultStore};
    use super::*;

    fn job(ipo_id: Uuid, tax_id: &str) -> ScrapeJob {
        ScrapeJob {
            id: Uuid::new_v4(),
            ipo_id,
            tax_id: tax_id.to_string(),
            company_name: "Tata Technologies".into(),
            registrar_hint: Some("Link Intime India Pvt Ltd".into()),
            client_ref: None,
        }
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(200),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(200));
    }

    #[tokio::test]
    async fn concurrent_in_flight_marks_produce_a_single_row() {
        let store = Arc::new(MemoryResultStore::new());
        let ipo_id = Uuid::new_v4();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.upsert_in_flight(ipo_id, "abcde1234f").await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.upsert_in_flight(ipo_id, " ABCDE1234F ").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(store.len().await, 1);
        let row = store.get(ipo_id, "ABCDE1234F").await.unwrap();
        assert_eq!(row.status, AllotmentStatus::InFlight);
    }

    #[tokio::test]
    async fn outcome_upsert_is_idempotent() {
        let store = MemoryResultStore::new();
        let ipo_id = Uuid::new_v4();

        let first = store
            .upsert_outcome(ipo_id, "ABCDE1234F", AllotmentStatus::Allotted, 10, "ok")
            .await
            .unwrap();
        let second = store
            .upsert_outcome(ipo_id, "ABCDE1234F", AllotmentStatus::Allotted, 10, "ok")
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(second.status, first.status);
        assert_eq!(second.units, first.units);
        assert_eq!(second.message, first.message);
        assert!(second.last_checked >= first.last_checked);
    }

    #[tokio::test]
    async fn in_flight_mark_overwrites_a_previous_error() {
        let store = MemoryResultStore::new();
        let ipo_id = Uuid::new_v4();
        store
            .upsert_outcome(ipo_id, "ABCDE1234F", AllotmentStatus::Error, 0, "timeout")
            .await
            .unwrap();

        let row = store.upsert_in_flight(ipo_id, "ABCDE1234F").await.unwrap();
        assert_eq!(row.status, AllotmentStatus::InFlight);
        assert!(row.message.is_empty());
    }

    #[tokio::test]
    async fn negative_units_are_clamped() {
        let store = MemoryResultStore::new();
        let row = store
            .upsert_outcome(
                Uuid::new_v4(),
                "ABCDE1234F",
                AllotmentStatus::NotAllotted,
                -5,
                "",
            )
            .await
            .unwrap();
        assert_eq!(row.units, 0);
    }

    #[tokio::test]
    async fn queue_retries_with_backoff_then_parks_failed() {
        let queue = MemoryJobQueue::new(QueueConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..QueueConfig::default()
        });
        let ipo_id = Uuid::new_v4();
        queue
            .enqueue_batch(vec![job(ipo_id, "ABCDE1234F")])
            .await
            .unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.attempt, 0);
        queue.fail(first.job.id, "capability timeout").await.unwrap();

        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(second.attempt, 1);
        queue.fail(second.job.id, "capability timeout").await.unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        assert_eq!(queue.failed_count().await, 1);
        let failed = queue.failed_jobs().await;
        assert_eq!(failed[0].1, "capability timeout");
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn completed_jobs_leave_the_queue() {
        let queue = MemoryJobQueue::default();
        let ipo_id = Uuid::new_v4();
        queue
            .enqueue_batch(vec![job(ipo_id, "ABCDE1234F"), job(ipo_id, "FGHIJ5678K")])
            .await
            .unwrap();
        assert_eq!(queue.total_enqueued().await, 2);

        let leased = queue.claim_next().await.unwrap().unwrap();
        queue.complete(leased.job.id).await.unwrap();
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimable() {
        let queue = MemoryJobQueue::new(QueueConfig {
            lease_timeout: Duration::ZERO,
            ..QueueConfig::default()
        });
        let ipo_id = Uuid::new_v4();
        queue
            .enqueue_batch(vec![job(ipo_id, "ABCDE1234F")])
            .await
            .unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.job.id, second.job.id);
    }

    #[tokio::test]
    async fn directory_window_includes_flagged_and_recent_ipos() {
        let directory = MemoryIpoDirectory::new();
        let now = Utc::now();
        let recent = IpoRecord {
            ipo_id: Uuid::new_v4(),
            company_name: "Recent Listing".into(),
            registrar_name: "KFin Technologies".into(),
            listing_date: (now - chrono::Duration::days(2)).date_naive(),
            allotment_out: false,
        };
        let flagged = IpoRecord {
            ipo_id: Uuid::new_v4(),
            company_name: "Old But Flagged".into(),
            registrar_name: "Bigshare Services".into(),
            listing_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            allotment_out: true,
        };
        let stale = IpoRecord {
            ipo_id: Uuid::new_v4(),
            company_name: "Old And Quiet".into(),
            registrar_name: "KFin Technologies".into(),
            listing_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            allotment_out: false,
        };
        directory.insert(recent.clone()).await;
        directory.insert(flagged.clone()).await;
        directory.insert(stale).await;

        let window = directory.in_window(now, 7).await.unwrap();
        let ids: Vec<Uuid> = window.iter().map(|i| i.ipo_id).collect();
        assert!(ids.contains(&recent.ipo_id));
        assert!(ids.contains(&flagged.ipo_id));
        assert_eq!(window.len(), 2);
    }
}
