use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::routes::AppState;
use crate::tracker::{ExecutionMetrics, ExecutionSummary};

const DEFAULT_RECENT: usize = 10;

#[derive(Debug, Serialize)]
pub struct ExecutionMetricsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub metrics: ExecutionMetrics,
}

/// GET /api/v1/executions/{id}/metrics
pub async fn execution_metrics(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ExecutionMetricsResponse>, AppError> {
    let metrics = state.tracker.get_execution_metrics(&execution_id).await?;
    Ok(Json(ExecutionMetricsResponse {
        success: true,
        metrics,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecentMetricsResponse {
    pub success: bool,
    pub executions: Vec<ExecutionSummary>,
}

/// GET /api/v1/metrics/recent?limit=n
pub async fn recent_metrics(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<RecentMetricsResponse>, AppError> {
    let executions = state
        .tracker
        .get_recent_metrics(params.limit.unwrap_or(DEFAULT_RECENT))
        .await?;
    Ok(Json(RecentMetricsResponse {
        success: true,
        executions,
    }))
}
