//! Pipeline Repository
//!
//! Handles all database operations on the `pipelines` table.

use mosaic_core::domain::pipeline::{Pipeline, PipelineStatus};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Insert a pipeline row (steps are inserted separately)
pub async fn insert(conn: &mut PgConnection, pipeline: &Pipeline) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO pipelines (
            id, name, status, tags, favorite, hidden, cancel_requested,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(pipeline.id)
    .bind(&pipeline.name)
    .bind(pipeline.status.as_str())
    .bind(&pipeline.tags)
    .bind(pipeline.favorite)
    .bind(pipeline.hidden)
    .bind(pipeline.cancel_requested)
    .bind(pipeline.created_at)
    .bind(chrono::Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Find a pipeline by ID, without its steps
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>, sqlx::Error> {
    let row = sqlx::query_as::<_, PipelineRow>(
        r#"
        SELECT id, name, status, tags, favorite, hidden, cancel_requested, created_at
        FROM pipelines
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// IDs of pipelines whose stored status is still running
pub async fn list_running_ids(pool: &PgPool) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT id
        FROM pipelines
        WHERE status = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(PipelineStatus::Running.as_str())
    .fetch_all(pool)
    .await
}

/// Update the aggregate status
pub async fn update_status(
    pool: &PgPool,
    id: Uuid,
    status: PipelineStatus,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE pipelines SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status.as_str())
        .bind(chrono::Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Set the cancellation flag
pub async fn request_cancel(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE pipelines SET cancel_requested = TRUE, updated_at = $1 WHERE id = $2")
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Update favorite/hidden; `NULL` keeps the stored value
pub async fn set_flags(
    pool: &PgPool,
    id: Uuid,
    favorite: Option<bool>,
    hidden: Option<bool>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE pipelines
        SET favorite = COALESCE($1, favorite),
            hidden = COALESCE($2, hidden),
            updated_at = $3
        WHERE id = $4
        "#,
    )
    .bind(favorite)
    .bind(hidden)
    .bind(chrono::Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: Uuid,
    name: String,
    status: String,
    tags: Vec<String>,
    favorite: bool,
    hidden: bool,
    cancel_requested: bool,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        let status = PipelineStatus::parse(&row.status).unwrap_or_else(|| {
            tracing::warn!("Unknown pipeline status '{}' for {}", row.status, row.id);
            PipelineStatus::Running
        });

        Pipeline {
            id: row.id,
            name: row.name,
            steps: Vec::new(),
            status,
            tags: row.tags,
            favorite: row.favorite,
            hidden: row.hidden,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
        }
    }
}
