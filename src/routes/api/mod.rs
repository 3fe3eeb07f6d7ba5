pub mod metrics;
pub mod tasks;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::require_admin_token;
use crate::routes::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        // Task lifecycle
        .route("/create-tasks", post(tasks::create_tasks))
        .route("/queue-status", get(tasks::queue_status))
        .route("/retry-failed-tasks", post(tasks::retry_failed_tasks))
        .route("/process-task-manual", post(tasks::process_task_manual))
        // Metrics
        .route("/executions/{id}/metrics", get(metrics::execution_metrics))
        .route("/metrics/recent", get(metrics::recent_metrics))
        .layer(middleware::from_fn_with_state(
            state.admin_token.clone(),
            require_admin_token,
        ))
        .with_state(state);

    Router::new().nest("/api/v1", protected)
}
