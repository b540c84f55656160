//! Postgres-backed farm history reader (`animal_groups`, `animal_production`,
//! `animal_feed_records`, `species`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use farmflow_core::{GroupId, UserId};
use farmflow_forecast::{AnimalGroup, FarmDataError, FarmDataReader, FeedRecord, ProductionRecord};

const SCHEMA: &str = include_str!("../../migrations/0002_farm_history.sql");

#[derive(Debug, Clone)]
pub struct PostgresFarmData {
    pool: Arc<PgPool>,
}

impl PostgresFarmData {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the history tables if missing (local development only).
    pub async fn ensure_schema(&self) -> Result<(), FarmDataError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| unavailable("ensure_schema", e))?;
        Ok(())
    }
}

fn unavailable(operation: &str, err: sqlx::Error) -> FarmDataError {
    FarmDataError::Unavailable(format!("{operation}: {err}"))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl FarmDataReader for PostgresFarmData {
    #[instrument(skip(self), fields(group_id = %group_id), err)]
    async fn find_group(&self, group_id: GroupId) -> Result<Option<AnimalGroup>, FarmDataError> {
        let row = sqlx::query(
            r#"
            SELECT g.id, g.owner_id, g.name, s.slug AS species, g.quantity, g.start_date
            FROM animal_groups g
            JOIN species s ON s.id = g.species_id
            WHERE g.id = $1
            "#,
        )
        .bind(group_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| unavailable("find_group", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e: sqlx::Error| unavailable("decode animal_groups row", e);

        Ok(Some(AnimalGroup {
            id: GroupId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
            owner_id: UserId::from_uuid(row.try_get::<Uuid, _>("owner_id").map_err(decode)?),
            name: row.try_get("name").map_err(decode)?,
            species: row.try_get("species").map_err(decode)?,
            quantity: row.try_get("quantity").map_err(decode)?,
            start_date: row.try_get::<NaiveDate, _>("start_date").map_err(decode)?,
        }))
    }

    async fn recent_production(
        &self,
        group_id: GroupId,
        limit: usize,
    ) -> Result<Vec<ProductionRecord>, FarmDataError> {
        let rows = sqlx::query(
            r#"
            SELECT date, eggs, weight_kg, mortality
            FROM animal_production
            WHERE group_id = $1
            ORDER BY date DESC
            LIMIT $2
            "#,
        )
        .bind(group_id.as_uuid())
        .bind(limit_param(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| unavailable("recent_production", e))?;

        rows.iter()
            .map(|row| {
                Ok(ProductionRecord {
                    recorded_at: row.try_get::<DateTime<Utc>, _>("date")?,
                    eggs: row.try_get("eggs")?,
                    weight_kg: row.try_get("weight_kg")?,
                    mortality: row.try_get("mortality")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| unavailable("decode animal_production row", e))
    }

    async fn recent_feed(&self, group_id: GroupId, limit: usize) -> Result<Vec<FeedRecord>, FarmDataError> {
        let rows = sqlx::query(
            r#"
            SELECT date, feed_type, quantity_kg
            FROM animal_feed_records
            WHERE group_id = $1
            ORDER BY date DESC
            LIMIT $2
            "#,
        )
        .bind(group_id.as_uuid())
        .bind(limit_param(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| unavailable("recent_feed", e))?;

        rows.iter()
            .map(|row| {
                Ok(FeedRecord {
                    recorded_at: row.try_get::<DateTime<Utc>, _>("date")?,
                    feed_type: row.try_get("feed_type")?,
                    quantity_kg: row.try_get("quantity_kg")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| unavailable("decode animal_feed_records row", e))
    }
}
