use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use model::{Saga, SagaStatus, SagaType, Step};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{Page, SagaFilter, SagaStore},
};

/// Statuses a saga can still make progress in. Kept in sync with the
/// partial unique index in the migration.
const NON_TERMINAL: [&str; 3] = ["PENDING", "PROCESSING", "COMPENSATING"];

/// PostgreSQL-backed saga store.
///
/// Each saga is one row with its steps embedded as a JSONB document, which
/// gives atomic visibility of saga+steps on every read and write. Updates
/// are guarded by a version column; the at-most-one-active-saga-per-
/// correlation-id invariant is enforced by a partial unique index.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_saga(row: PgRow) -> Result<Saga> {
        let saga_type: String = row.try_get("saga_type")?;
        let saga_type: SagaType =
            serde_json::from_value(serde_json::Value::String(saga_type))?;
        let status: String = row.try_get("status")?;
        let status: SagaStatus = serde_json::from_value(serde_json::Value::String(status))?;
        let steps: serde_json::Value = row.try_get("steps")?;
        let steps: Vec<Step> = serde_json::from_value(steps)?;
        let timeout_ms: i64 = row.try_get("timeout_ms")?;
        let version: i64 = row.try_get("version")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Ok(Saga::restore(
            SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            saga_type,
            status,
            steps,
            std::time::Duration::from_millis(timeout_ms.max(0) as u64),
            row.try_get::<i32, _>("max_retries")?.max(0) as u32,
            version.max(0) as u64,
            created_at,
            updated_at,
        ))
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create(&self, saga: &Saga) -> Result<()> {
        let steps = serde_json::to_value(saga.steps())?;

        sqlx::query(
            r#"
            INSERT INTO sagas (id, correlation_id, saga_type, status, steps,
                               timeout_ms, max_retries, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(saga.id().as_uuid())
        .bind(saga.correlation_id().as_uuid())
        .bind(saga.saga_type().as_str())
        .bind(saga.status().as_str())
        .bind(steps)
        .bind(saga.timeout().as_millis() as i64)
        .bind(saga.max_retries() as i32)
        .bind(saga.version() as i64)
        .bind(saga.created_at())
        .bind(saga.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                // The partial unique index enforces the one-active-saga invariant
                if db_err.constraint() == Some("unique_active_correlation") {
                    return StoreError::DuplicateSaga(saga.correlation_id());
                }
                if db_err.constraint() == Some("sagas_pkey") {
                    return StoreError::DuplicateId(saga.id());
                }
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        let row = sqlx::query(
            r#"
            SELECT id, correlation_id, saga_type, status, steps,
                   timeout_ms, max_retries, version, created_at, updated_at
            FROM sagas
            WHERE id = $1
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn get_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Saga>> {
        let row = sqlx::query(
            r#"
            SELECT id, correlation_id, saga_type, status, steps,
                   timeout_ms, max_retries, version, created_at, updated_at
            FROM sagas
            WHERE correlation_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(correlation_id.as_uuid())
        .bind(&NON_TERMINAL[..])
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn update(&self, saga: &Saga) -> Result<u64> {
        let steps = serde_json::to_value(saga.steps())?;
        let expected = saga.version() as i64;
        let new_version = expected + 1;

        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $2, steps = $3, version = $4, updated_at = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(saga.id().as_uuid())
        .bind(saga.status().as_str())
        .bind(steps)
        .bind(new_version)
        .bind(saga.updated_at())
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM sagas WHERE id = $1")
                    .bind(saga.id().as_uuid())
                    .fetch_optional(&self.pool)
                    .await?;

            return match actual {
                None => Err(StoreError::NotFound(saga.id())),
                Some(actual) => Err(StoreError::ConcurrencyConflict {
                    saga_id: saga.id(),
                    expected: expected.max(0) as u64,
                    actual: actual.max(0) as u64,
                }),
            };
        }

        Ok(new_version as u64)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Saga>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, saga_type, status, steps,
                   timeout_ms, max_retries, version, created_at, updated_at
            FROM sagas
            WHERE status = ANY($1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(&NON_TERMINAL[..])
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn list(&self, filter: SagaFilter, page: Page) -> Result<Vec<Saga>> {
        let mut sql = String::from(
            "SELECT id, correlation_id, saga_type, status, steps, \
             timeout_ms, max_retries, version, created_at, updated_at \
             FROM sagas WHERE 1=1",
        );
        let mut param_count = 0;

        if filter.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if filter.correlation_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND correlation_id = ${param_count}"));
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            param_count + 1,
            param_count + 2
        ));

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(correlation_id) = filter.correlation_id {
            query = query.bind(correlation_id.as_uuid());
        }
        query = query.bind(page.limit as i64).bind(page.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }
}
