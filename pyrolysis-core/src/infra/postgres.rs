//! Postgres-backed record store.
//!
//! Conditions are evaluated in Rust against the row locked with
//! `SELECT ... FOR UPDATE`, and the write happens in the same transaction.
//! Create-if-absent goes through `INSERT ... ON CONFLICT DO NOTHING` so two
//! racing inserts cannot both win.

use std::fmt;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use pyrolysis_contracts::store::{
    ConditionalWrite, RunCondition, RunStore, RunUpdate, StoreError,
    TileJobCondition, TileJobStore, TileJobUpdate,
};
use pyrolysis_model::{Run, RunId, TileJob, TileJobKey};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresRecordStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

fn backend(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{context}: {e}"))
        }
        other => StoreError::Backend(format!("{context}: {other}")),
    }
}

impl PostgresRecordStore {
    /// Connects and verifies the database answers.
    pub async fn new(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(backend("record store failed Postgres health check"))?;
        info!("record store connected to Postgres");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_tile_job(
        tx: &mut Transaction<'_, Postgres>,
        key: &TileJobKey,
    ) -> Result<Option<TileJob>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT record
            FROM pyrolysis_tile_jobs
            WHERE run_id = $1 AND tile_id = $2
            FOR UPDATE
            "#,
        )
        .bind(key.run_id.as_str())
        .bind(key.tile_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend("tile job lookup failed"))?;
        row.map(|row| decode_record::<TileJob>(&row)).transpose()
    }

    async fn write_tile_job(
        tx: &mut Transaction<'_, Postgres>,
        job: &TileJob,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE pyrolysis_tile_jobs
            SET status = $3,
                lock_owner = $4,
                lock_expires_at = $5,
                attempt_count = $6,
                record = $7,
                updated_at = $8
            WHERE run_id = $1 AND tile_id = $2
            "#,
        )
        .bind(job.run_id.as_str())
        .bind(job.tile_id.as_str())
        .bind(job.status.as_str())
        .bind(job.lock_owner.map(|token| token.0))
        .bind(job.lock_expires_at)
        .bind(i32::try_from(job.attempt_count).unwrap_or(i32::MAX))
        .bind(Json(job))
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(backend("tile job update failed"))?;
        Ok(())
    }

    async fn insert_tile_job(&self, job: &TileJob) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pyrolysis_tile_jobs
                (run_id, tile_id, status, lock_owner, lock_expires_at,
                 attempt_count, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id, tile_id) DO NOTHING
            "#,
        )
        .bind(job.run_id.as_str())
        .bind(job.tile_id.as_str())
        .bind(job.status.as_str())
        .bind(job.lock_owner.map(|token| token.0))
        .bind(job.lock_expires_at)
        .bind(i32::try_from(job.attempt_count).unwrap_or(i32::MAX))
        .bind(Json(job))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend("tile job insert failed"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn lock_run(
        tx: &mut Transaction<'_, Postgres>,
        run_id: &RunId,
    ) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            "SELECT record FROM pyrolysis_runs WHERE run_id = $1 FOR UPDATE",
        )
        .bind(run_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend("run lookup failed"))?;
        row.map(|row| decode_record::<Run>(&row)).transpose()
    }

    async fn write_run(
        tx: &mut Transaction<'_, Postgres>,
        run: &Run,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE pyrolysis_runs
            SET status = $2,
                total_tiles = $3,
                pending_count = $4,
                record = $5,
                updated_at = $6
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.status.as_str())
        .bind(i64::try_from(run.total_tiles).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.pending_count).unwrap_or(i64::MAX))
        .bind(Json(run))
        .bind(run.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(backend("run update failed"))?;
        Ok(())
    }

    async fn insert_run(&self, run: &Run) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pyrolysis_runs
                (run_id, status, total_tiles, pending_count, record,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.status.as_str())
        .bind(i64::try_from(run.total_tiles).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.pending_count).unwrap_or(i64::MAX))
        .bind(Json(run))
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend("run insert failed"))?;
        Ok(result.rows_affected() == 1)
    }
}

fn decode_record<T: serde::de::DeserializeOwned>(
    row: &PgRow,
) -> Result<T, StoreError> {
    row.try_get::<Json<T>, _>("record")
        .map(|json| json.0)
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl TileJobStore for PostgresRecordStore {
    async fn get_tile_job(
        &self,
        key: &TileJobKey,
    ) -> Result<Option<TileJob>, StoreError> {
        let row = sqlx::query(
            "SELECT record FROM pyrolysis_tile_jobs WHERE run_id = $1 AND tile_id = $2",
        )
        .bind(key.run_id.as_str())
        .bind(key.tile_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend("tile job lookup failed"))?;
        row.map(|row| decode_record::<TileJob>(&row)).transpose()
    }

    async fn put_tile_job(
        &self,
        job: TileJob,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError> {
        let key = job.key();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(backend("failed to open transaction"))?;
        let current = Self::lock_tile_job(&mut tx, &key).await?;
        if !condition.evaluate(current.as_ref()) {
            return Ok(ConditionalWrite::Rejected(current));
        }
        if current.is_some() {
            Self::write_tile_job(&mut tx, &job).await?;
            tx.commit()
                .await
                .map_err(backend("tile job commit failed"))?;
            return Ok(ConditionalWrite::Applied(job));
        }
        // No row to lock; let the primary key arbitrate.
        drop(tx);
        if self.insert_tile_job(&job).await? {
            Ok(ConditionalWrite::Applied(job))
        } else {
            Ok(ConditionalWrite::Rejected(self.get_tile_job(&key).await?))
        }
    }

    async fn update_tile_job(
        &self,
        key: &TileJobKey,
        update: TileJobUpdate,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(backend("failed to open transaction"))?;
        let Some(mut job) = Self::lock_tile_job(&mut tx, key).await? else {
            return Ok(ConditionalWrite::Rejected(None));
        };
        if !condition.evaluate(Some(&job)) {
            return Ok(ConditionalWrite::Rejected(Some(job)));
        }
        update.apply(&mut job);
        Self::write_tile_job(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(backend("tile job commit failed"))?;
        Ok(ConditionalWrite::Applied(job))
    }

    async fn list_tile_jobs(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TileJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM pyrolysis_tile_jobs WHERE run_id = $1 ORDER BY tile_id",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend("tile job listing failed"))?;
        rows.iter().map(decode_record::<TileJob>).collect()
    }
}

#[async_trait]
impl RunStore for PostgresRecordStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT record FROM pyrolysis_runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend("run lookup failed"))?;
        row.map(|row| decode_record::<Run>(&row)).transpose()
    }

    async fn put_run(
        &self,
        run: Run,
        condition: RunCondition,
    ) -> Result<ConditionalWrite<Run>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(backend("failed to open transaction"))?;
        let current = Self::lock_run(&mut tx, &run.run_id).await?;
        if !condition.evaluate(current.as_ref()) {
            return Ok(ConditionalWrite::Rejected(current));
        }
        if current.is_some() {
            Self::write_run(&mut tx, &run).await?;
            tx.commit().await.map_err(backend("run commit failed"))?;
            return Ok(ConditionalWrite::Applied(run));
        }
        drop(tx);
        if self.insert_run(&run).await? {
            Ok(ConditionalWrite::Applied(run))
        } else {
            Ok(ConditionalWrite::Rejected(self.get_run(&run.run_id).await?))
        }
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        update: RunUpdate,
        condition: RunCondition,
    ) -> Result<ConditionalWrite<Run>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(backend("failed to open transaction"))?;
        let Some(mut run) = Self::lock_run(&mut tx, run_id).await? else {
            return Ok(ConditionalWrite::Rejected(None));
        };
        if !condition.evaluate(Some(&run)) {
            return Ok(ConditionalWrite::Rejected(Some(run)));
        }
        update.apply(&mut run);
        Self::write_run(&mut tx, &run).await?;
        tx.commit().await.map_err(backend("run commit failed"))?;
        Ok(ConditionalWrite::Applied(run))
    }
}
