use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Source;
use crate::error::AppError;
use crate::models::execution::{BatchExecution, ExecutionView, Trigger};
use crate::models::fetch_task::{FetchTask, TaskFilter};
use crate::queue::{Delivery, FetchPayload, Outcome, QueueDepth, QueueName, TaskError, TaskHandler};
use crate::routes::AppState;
use crate::store::Document;
use crate::task_creator::ScheduleOutcome;
use crate::tracker::{RetryFilter, RetryReport, count_by_status};

#[derive(Debug, Default, Deserialize)]
pub struct CreateTasksParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTasksBody {
    #[serde(default)]
    pub sources: Option<Vec<Source>>,
}

/// POST /api/v1/create-tasks
///
/// Guarded batch creation. The body may carry a source list that replaces
/// the configured one for this run; `?force=true` bypasses the running check.
pub async fn create_tasks(
    State(state): State<AppState>,
    Query(params): Query<CreateTasksParams>,
    body: Option<Json<CreateTasksBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let override_sources = body.and_then(|Json(body)| body.sources);
    if let Some(sources) = &override_sources {
        for source in sources {
            source.validate().map_err(AppError::BadRequest)?;
        }
    }
    let sources = override_sources.as_deref().unwrap_or(state.sources.as_slice());

    let outcome = state
        .creator
        .run_scheduled(sources, params.force, Trigger::Api)
        .await?;

    let body = match outcome {
        ScheduleOutcome::Created(batch) => json!({
            "success": true,
            "created": true,
            "executionId": batch.execution_id,
            "batchId": batch.batch_id,
            "tasksCreated": batch.tasks_created,
        }),
        ScheduleOutcome::Skipped {
            running_execution_id,
        } => json!({
            "success": true,
            "created": false,
            "skipped": true,
            "runningExecutionId": running_execution_id,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub success: bool,
    pub execution: Option<ExecutionView>,
    pub task_counts: BTreeMap<&'static str, usize>,
    pub queues: BTreeMap<&'static str, QueueDepth>,
}

/// GET /api/v1/queue-status
pub async fn queue_status(
    State(state): State<AppState>,
) -> Result<Json<QueueStatusResponse>, AppError> {
    let execution = BatchExecution::latest(&*state.store).await?;
    let tasks = match &execution {
        Some(execution) => {
            FetchTask::list(
                &*state.store,
                &TaskFilter {
                    execution_id: Some(execution.execution_id.clone()),
                    ..Default::default()
                },
            )
            .await?
        }
        None => Vec::new(),
    };

    let mut queues = BTreeMap::new();
    for queue in [QueueName::Fetch, QueueName::Enrichment] {
        queues.insert(queue.as_str(), state.queues.depth(queue).await?);
    }

    Ok(Json(QueueStatusResponse {
        success: true,
        execution: execution.map(Into::into),
        task_counts: count_by_status(&tasks),
        queues,
    }))
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: RetryReport,
}

/// POST /api/v1/retry-failed-tasks
pub async fn retry_failed_tasks(
    State(state): State<AppState>,
    body: Option<Json<RetryFilter>>,
) -> Result<Json<RetryResponse>, AppError> {
    let filter = body.map(|Json(filter)| filter).unwrap_or_default();
    let report = state.tracker.retry_failed_tasks(&filter).await?;
    Ok(Json(RetryResponse {
        success: true,
        report,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ManualTaskRequest {
    pub provider: String,
    pub company: String,
    #[serde(default)]
    pub params: Document,
}

/// POST /api/v1/process-task-manual
///
/// Runs one fetch synchronously under its own single-task execution,
/// bypassing the queue. Failures are recorded exactly like an exhausted task.
pub async fn process_task_manual(
    State(state): State<AppState>,
    Json(input): Json<ManualTaskRequest>,
) -> Result<Response, AppError> {
    let source = Source {
        provider: input.provider.trim().to_string(),
        company: input.company.trim().to_string(),
        params: input.params,
    };
    source.validate().map_err(AppError::BadRequest)?;

    let execution_id = uuid::Uuid::new_v4().to_string();
    let batch_id = format!("manual_{}", Utc::now().format("%Y%m%dT%H%M%S"));
    BatchExecution::new(&execution_id, &batch_id, 1, Trigger::Manual)
        .create(&*state.store)
        .await?;
    let task = FetchTask::new(&source, &execution_id, &batch_id, 0);
    task.save(&*state.store).await?;

    let payload = FetchPayload {
        task_id: task.task_id.clone(),
        execution_id: execution_id.clone(),
        provider: task.provider.clone(),
        company: task.company.clone(),
    };
    let delivery = Delivery {
        id: 0,
        queue: QueueName::Fetch,
        payload: serde_json::to_value(&payload).map_err(|e| AppError::Internal(e.to_string()))?,
        attempt: 1,
        max_attempts: 1,
    };

    tracing::info!(
        execution_id = %execution_id,
        provider = %source.provider,
        company = %source.company,
        "Running manual fetch"
    );
    let timeout = state.queues.settings(QueueName::Fetch).timeout;
    let result = match tokio::time::timeout(timeout, state.fetch_worker.handle(&delivery)).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Retryable(format!(
            "Timed out after {}s",
            timeout.as_secs()
        ))),
    };

    let response = match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(manual_body(&execution_id, &task.task_id, Ok(&outcome))),
        ),
        Err(e) => {
            state.fetch_worker.on_exhausted(&delivery, e.message()).await;
            let status = match e {
                TaskError::Terminal(_) => StatusCode::UNPROCESSABLE_ENTITY,
                TaskError::Retryable(_) => StatusCode::BAD_GATEWAY,
            };
            (status, Json(manual_body(&execution_id, &task.task_id, Err(e.message()))))
        }
    };
    Ok(response.into_response())
}

fn manual_body(
    execution_id: &str,
    task_id: &str,
    result: Result<&Outcome, &str>,
) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    body.insert("success".into(), json!(result.is_ok()));
    body.insert("executionId".into(), json!(execution_id));
    body.insert("taskId".into(), json!(task_id));
    match result {
        Ok(outcome) => {
            if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(outcome) {
                body.extend(fields);
            }
        }
        Err(error) => {
            body.insert("error".into(), json!(error));
        }
    }
    serde_json::Value::Object(body)
}
