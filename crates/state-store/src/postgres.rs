use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    DispatchOutcome, IdempotencyKey, IdempotencyRecord, InstanceQuery, Result, SagaInstance,
    SagaStatus, StateStoreError, StepResult, Version,
    store::{IdempotencyStore, InstanceStream, StateStore},
};

/// Rows fetched per round trip while streaming in-flight instances.
const IN_FLIGHT_PAGE_SIZE: usize = 500;

const INSTANCE_COLUMNS: &str = "saga_id, definition_name, status, current_index, payload, \
     step_results, failure_reason, alert_pending, created_at, updated_at, version";

/// Converts a row count to a `BIGINT` bind, saturating instead of wrapping.
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// PostgreSQL-backed state store implementation.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

/// Keyset pagination state for streaming in-flight instances.
struct InFlightPages {
    pool: PgPool,
    cursor: Option<(DateTime<Utc>, Uuid)>,
    buffer: VecDeque<SagaInstance>,
    exhausted: bool,
}

impl PostgresStateStore {
    /// Creates a new PostgreSQL state store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<SagaStatus>()
            .map_err(StateStoreError::InvalidRecord)?;
        let current_index: i64 = row.try_get("current_index")?;
        let current_index = usize::try_from(current_index)
            .map_err(|_| StateStoreError::InvalidRecord(format!("current_index {current_index}")))?;
        let step_results: Vec<StepResult> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("step_results")?)?;

        Ok(SagaInstance {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            definition_name: row.try_get("definition_name")?,
            status,
            current_index,
            payload: row.try_get("payload")?,
            step_results,
            failure_reason: row.try_get("failure_reason")?,
            alert_pending: row.try_get("alert_pending")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: Version::new(row.try_get("version")?),
        })
    }

    async fn stored_version(&self, saga_id: SagaId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }

    async fn fetch_in_flight_page(
        pool: &PgPool,
        cursor: Option<(DateTime<Utc>, Uuid)>,
    ) -> Result<Vec<SagaInstance>> {
        let (after_created, after_id) = cursor.unzip();
        let sql = format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM saga_instances
            WHERE status IN ('RUNNING', 'COMPENSATING')
              AND ($1::timestamptz IS NULL OR (created_at, saga_id) > ($1, $2))
            ORDER BY created_at ASC, saga_id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(after_created)
            .bind(after_id)
            .bind(sql_count(IN_FLIGHT_PAGE_SIZE))
            .fetch_all(pool)
            .await?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }

    async fn next_in_flight(
        mut pages: InFlightPages,
    ) -> Result<Option<(SagaInstance, InFlightPages)>> {
        if pages.buffer.is_empty() && !pages.exhausted {
            let page = Self::fetch_in_flight_page(&pages.pool, pages.cursor).await?;
            pages.exhausted = page.len() < IN_FLIGHT_PAGE_SIZE;
            pages.buffer.extend(page);
        }

        match pages.buffer.pop_front() {
            Some(instance) => {
                pages.cursor = Some((instance.created_at, instance.saga_id.as_uuid()));
                Ok(Some((instance, pages)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.saga_id, version = %instance.version))]
    async fn save(&self, instance: &SagaInstance) -> Result<Version> {
        let expected = instance.version;
        let next = expected.next();
        let step_results = serde_json::to_value(&instance.step_results)?;

        let rows_affected = if expected.is_initial() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances (saga_id, definition_name, status, current_index, payload,
                                            step_results, failure_reason, alert_pending, created_at,
                                            updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (saga_id) DO NOTHING
                "#,
            )
            .bind(instance.saga_id.as_uuid())
            .bind(&instance.definition_name)
            .bind(instance.status.as_str())
            .bind(instance.current_index as i64)
            .bind(&instance.payload)
            .bind(&step_results)
            .bind(&instance.failure_reason)
            .bind(instance.alert_pending)
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .bind(next.as_i64())
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET status = $2, current_index = $3, payload = $4, step_results = $5,
                    failure_reason = $6, alert_pending = $7, updated_at = $8, version = $9
                WHERE saga_id = $1 AND version = $10
                "#,
            )
            .bind(instance.saga_id.as_uuid())
            .bind(instance.status.as_str())
            .bind(instance.current_index as i64)
            .bind(&instance.payload)
            .bind(&step_results)
            .bind(&instance.failure_reason)
            .bind(instance.alert_pending)
            .bind(instance.updated_at)
            .bind(next.as_i64())
            .bind(expected.as_i64())
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            let actual = self.stored_version(instance.saga_id).await?;
            metrics::counter!("state_store_conflicts_total").increment(1);
            tracing::debug!(%expected, %actual, "rejected stale write");
            return Err(StateStoreError::ConcurrentUpdate {
                saga_id: instance.saga_id,
                expected,
                actual,
            });
        }

        Ok(next)
    }

    async fn find(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE saga_id = $1");
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn list_in_flight(&self) -> Result<InstanceStream> {
        let pages = InFlightPages {
            pool: self.pool.clone(),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        let stream = futures_util::stream::try_unfold(pages, Self::next_in_flight);
        Ok(Box::pin(stream))
    }

    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        let mut sql = format!("SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.definition_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND definition_name = ${param_count}"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at < ${param_count}"));
        }
        if query.alert_pending.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND alert_pending = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, saga_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(name) = query.definition_name {
            sqlx_query = sqlx_query.bind(name);
        }
        if let Some(before) = query.updated_before {
            sqlx_query = sqlx_query.bind(before);
        }
        if let Some(pending) = query.alert_pending {
            sqlx_query = sqlx_query.bind(pending);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(sql_count(limit));
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(sql_count(offset));
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_instance).collect()
    }
}

/// PostgreSQL-backed idempotency store.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Creates a new PostgreSQL idempotency store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn try_claim(&self, key: &IdempotencyKey, window: chrono::Duration) -> Result<bool> {
        let now = Utc::now();
        let claimed: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO saga_idempotency (saga_id, step_name, direction, attempt, outcome, dispatched_at, updated_at)
            VALUES ($1, $2, $3, $4, 'DISPATCHED', $5, $5)
            ON CONFLICT (saga_id, step_name, direction, attempt) DO UPDATE SET
                dispatched_at = EXCLUDED.dispatched_at,
                updated_at = EXCLUDED.updated_at
            WHERE saga_idempotency.outcome = 'DISPATCHED'
              AND saga_idempotency.dispatched_at <= $6
            RETURNING attempt
            "#,
        )
        .bind(key.saga_id.as_uuid())
        .bind(&key.step_name)
        .bind(key.direction.as_str())
        .bind(key.attempt as i32)
        .bind(now)
        .bind(now - window)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn record_outcome(&self, key: &IdempotencyKey, outcome: DispatchOutcome) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO saga_idempotency (saga_id, step_name, direction, attempt, outcome, dispatched_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (saga_id, step_name, direction, attempt) DO UPDATE SET
                outcome = EXCLUDED.outcome,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key.saga_id.as_uuid())
        .bind(&key.step_name)
        .bind(key.direction.as_str())
        .bind(key.attempt as i32)
        .bind(outcome.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT outcome, dispatched_at, updated_at
            FROM saga_idempotency
            WHERE saga_id = $1 AND step_name = $2 AND direction = $3 AND attempt = $4
            "#,
        )
        .bind(key.saga_id.as_uuid())
        .bind(&key.step_name)
        .bind(key.direction.as_str())
        .bind(key.attempt as i32)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let outcome: String = row.try_get("outcome")?;
                Ok(Some(IdempotencyRecord {
                    key: key.clone(),
                    outcome: outcome
                        .parse()
                        .map_err(StateStoreError::InvalidRecord)?,
                    dispatched_at: row.try_get("dispatched_at")?,
                    updated_at: row.try_get("updated_at")?,
                }))
            }
            None => Ok(None),
        }
    }
}
