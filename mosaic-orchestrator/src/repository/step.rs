//! Step Repository
//!
//! Handles all database operations on the `steps` table.

use mosaic_core::domain::step::{ParentRef, Step, StepStatus, StepType};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Insert a step row
pub async fn insert(conn: &mut PgConnection, step: &Step) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO steps (
            id, pipeline_id, step_type, step_order, source_image_index,
            parent_order, parent_output_index, input_asset, config, status,
            retry_count, last_error, outputs, request_id, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(step.id)
    .bind(step.pipeline_id)
    .bind(step.step_type.as_str())
    .bind(step.step_order as i32)
    .bind(step.source_image_index as i32)
    .bind(step.parent.map(|p| p.step_order as i32))
    .bind(step.parent.map(|p| p.output_index as i32))
    .bind(&step.input_asset)
    .bind(sqlx::types::Json(&step.config))
    .bind(step.status.as_str())
    .bind(step.retry_count as i32)
    .bind(step.last_error.as_ref().map(sqlx::types::Json))
    .bind(&step.outputs)
    .bind(&step.request_id)
    .bind(step.created_at)
    .bind(step.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Steps of a pipeline ordered by `step_order`
pub async fn list_by_pipeline(pool: &PgPool, pipeline_id: Uuid) -> Result<Vec<StepRow>, sqlx::Error> {
    sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, pipeline_id, step_type, step_order, source_image_index,
               parent_order, parent_output_index, input_asset, config, status,
               retry_count, last_error, outputs, request_id, created_at, updated_at
        FROM steps
        WHERE pipeline_id = $1
        ORDER BY step_order ASC
        "#,
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await
}

/// Write every mutable field of a step
pub async fn update(pool: &PgPool, step: &Step) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE steps
        SET input_asset = $1, status = $2, retry_count = $3, last_error = $4,
            outputs = $5, request_id = $6, updated_at = $7
        WHERE id = $8 AND pipeline_id = $9
        "#,
    )
    .bind(&step.input_asset)
    .bind(step.status.as_str())
    .bind(step.retry_count as i32)
    .bind(step.last_error.as_ref().map(sqlx::types::Json))
    .bind(&step.outputs)
    .bind(&step.request_id)
    .bind(step.updated_at)
    .bind(step.id)
    .bind(step.pipeline_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
pub struct StepRow {
    id: Uuid,
    pipeline_id: Uuid,
    step_type: String,
    step_order: i32,
    source_image_index: i32,
    parent_order: Option<i32>,
    parent_output_index: Option<i32>,
    input_asset: Option<String>,
    config: serde_json::Value,
    status: String,
    retry_count: i32,
    last_error: Option<serde_json::Value>,
    outputs: Vec<String>,
    request_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<StepRow> for Step {
    type Error = String;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let step_type = StepType::parse(&row.step_type)
            .ok_or_else(|| format!("step {} has unknown type '{}'", row.id, row.step_type))?;
        let status = StepStatus::parse(&row.status)
            .ok_or_else(|| format!("step {} has unknown status '{}'", row.id, row.status))?;
        let config = serde_json::from_value(row.config)
            .map_err(|e| format!("step {} has an unreadable config: {}", row.id, e))?;
        let last_error = row
            .last_error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("step {} has an unreadable error: {}", row.id, e))?;

        let parent = match (row.parent_order, row.parent_output_index) {
            (Some(step_order), Some(output_index)) => Some(ParentRef {
                step_order: step_order as u32,
                output_index: output_index as u32,
            }),
            _ => None,
        };

        Ok(Step {
            id: row.id,
            pipeline_id: row.pipeline_id,
            step_type,
            step_order: row.step_order as u32,
            source_image_index: row.source_image_index as u32,
            parent,
            input_asset: row.input_asset,
            config,
            status,
            retry_count: row.retry_count as u32,
            last_error,
            outputs: row.outputs,
            request_id: row.request_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
