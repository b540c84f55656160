//! Postgres-backed forecast store.
//!
//! Table `forecasts` (see `migrations/0001_forecasts.sql`). Each transition is
//! one conditional `UPDATE`; zero affected rows means the precondition failed.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | any query failure | `Unavailable` |
//! | undecodable `type` / `status` / `output_json` | `Corrupt` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use farmflow_core::{ForecastId, GroupId};
use farmflow_forecast::{
    ForecastKind, ForecastOutput, ForecastRecord, ForecastStatus, Lease, LeaseToken, NewForecast,
};

use super::{to_chrono, ForecastStore, StoreError, Transition};

const SCHEMA: &str = include_str!("../../migrations/0001_forecasts.sql");

const SELECT_COLUMNS: &str = r#"
    id, group_id, type, model_name, input_json, status, output_json, score,
    run_at, error, lease_token, lease_expires_at, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresForecastStore {
    pool: Arc<PgPool>,
}

impl PostgresForecastStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the `forecasts` table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Status after a lost conditional write.
    async fn current_status(&self, id: ForecastId) -> Result<Transition, StoreError> {
        let row = sqlx::query("SELECT status FROM forecasts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        let current = match row {
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("current_status", e))?;
                Some(parse_status(id, &status)?)
            }
            None => None,
        };
        Ok(Transition::Lost { current })
    }

    async fn conditional(&self, id: ForecastId, rows_affected: u64) -> Result<Transition, StoreError> {
        if rows_affected == 1 {
            Ok(Transition::Applied)
        } else {
            self.current_status(id).await
        }
    }
}

#[async_trait]
impl ForecastStore for PostgresForecastStore {
    #[instrument(skip(self, new), fields(group_id = %new.group_id, kind = %new.kind), err)]
    async fn create(&self, new: NewForecast) -> Result<ForecastRecord, StoreError> {
        let record = ForecastRecord::new(new, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO forecasts (
                id, group_id, type, model_name, input_json, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.group_id.as_uuid())
        .bind(record.kind.as_str())
        .bind(&record.model_name)
        .bind(&record.input_json)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e))?;

        Ok(record)
    }

    async fn get(&self, id: ForecastId) -> Result<Option<ForecastRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM forecasts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn list_by_group(&self, group_id: GroupId) -> Result<Vec<ForecastRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM forecasts WHERE group_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(group_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_group", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, lease), fields(forecast_id = %id, lease = %lease), err)]
    async fn transition_to_running(
        &self,
        id: ForecastId,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> Result<Transition, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE forecasts
            SET status = 'running',
                lease_token = $2,
                lease_expires_at = $3,
                updated_at = $4
            WHERE id = $1
              AND (
                status = 'pending'
                OR (
                    status = 'running'
                    AND (lease_token = $2 OR lease_expires_at IS NULL OR lease_expires_at <= $4)
                )
              )
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease.as_str())
        .bind(now + to_chrono(ttl))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_to_running", e))?;

        self.conditional(id, result.rows_affected()).await
    }

    #[instrument(skip(self, lease, output), fields(forecast_id = %id, lease = %lease), err)]
    async fn complete(
        &self,
        id: ForecastId,
        lease: &LeaseToken,
        output: ForecastOutput,
    ) -> Result<Transition, StoreError> {
        let score = output.score();
        let output_json = serde_json::to_value(&output).map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("unserializable output: {e}"),
        })?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE forecasts
            SET status = 'completed',
                output_json = $3,
                score = $4,
                run_at = $5,
                error = NULL,
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = $5
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease.as_str())
        .bind(&output_json)
        .bind(score)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        self.conditional(id, result.rows_affected()).await
    }

    #[instrument(skip(self, lease), fields(forecast_id = %id, lease = %lease), err)]
    async fn fail(&self, id: ForecastId, lease: &LeaseToken, reason: &str) -> Result<Transition, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE forecasts
            SET status = 'failed',
                error = $3,
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'running' AND lease_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease.as_str())
        .bind(reason)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        self.conditional(id, result.rows_affected()).await
    }

    #[instrument(skip(self), fields(forecast_id = %id), err)]
    async fn fail_pending(&self, id: ForecastId, reason: &str) -> Result<Transition, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE forecasts
            SET status = 'failed', error = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_pending", e))?;

        self.conditional(id, result.rows_affected()).await
    }

    #[instrument(skip(self), err)]
    async fn sweep_stale_running(&self, older_than: Duration) -> Result<Vec<ForecastId>, StoreError> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            UPDATE forecasts
            SET status = 'failed',
                error = 'worker lease expired without a result',
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = $2
            WHERE status = 'running'
              AND COALESCE(lease_expires_at, updated_at) <= $1
            RETURNING id
            "#,
        )
        .bind(now - to_chrono(older_than))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sweep_stale_running", e))?;

        let mut ids = rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id").map(ForecastId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("sweep_stale_running", e))?;
        ids.sort();
        Ok(ids)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("connection pool closed in {operation}")),
        other => StoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn parse_status(id: ForecastId, raw: &str) -> Result<ForecastStatus, StoreError> {
    ForecastStatus::parse(raw).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unknown status {raw:?}"),
    })
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<ForecastRecord, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode forecast row", e);

    let id = ForecastId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?);
    let kind_raw: String = row.try_get("type").map_err(decode)?;
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let output_raw: Option<JsonValue> = row.try_get("output_json").map_err(decode)?;
    let lease_token: Option<String> = row.try_get("lease_token").map_err(decode)?;
    let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at").map_err(decode)?;

    let kind: ForecastKind = kind_raw.parse().map_err(|e| StoreError::Corrupt {
        id,
        reason: format!("{e}"),
    })?;
    let output_json = output_raw
        .map(serde_json::from_value::<ForecastOutput>)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("undecodable output_json: {e}"),
        })?;

    let lease = match (lease_token, lease_expires_at) {
        (Some(token), Some(expires_at)) => Some(Lease {
            token: LeaseToken::new(token),
            expires_at,
        }),
        _ => None,
    };

    Ok(ForecastRecord {
        id,
        group_id: GroupId::from_uuid(row.try_get::<Uuid, _>("group_id").map_err(decode)?),
        kind,
        model_name: row.try_get("model_name").map_err(decode)?,
        input_json: row.try_get("input_json").map_err(decode)?,
        status: parse_status(id, &status_raw)?,
        output_json,
        score: row.try_get("score").map_err(decode)?,
        run_at: row.try_get("run_at").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        lease,
    })
}
