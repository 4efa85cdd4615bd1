/// 任务接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::models::TaskState;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::ApiError;
use crate::app_state::AppState;
use crate::db::models::task::{TaskAccepted, TaskSubmission};
use crate::services::task_service::TaskService;

/// 任务详情
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub uniqid: String,
    pub state: TaskState,
    pub desired_state: TaskState,
    pub return_data: Option<JsonValue>,
}

/// 任务路由
pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_task))
        .route("/:id", get(get_task))
        .route("/:id/stop", post(stop_task))
}

/// 提交任务
///
/// POST /api/tasks
pub async fn submit_task(
    State(state): State<AppState>,
    Json(submission): Json<TaskSubmission>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let task = TaskService::new(state).submit(submission).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted::from(&task))))
}

/// 查询任务
///
/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = TaskService::new(state).get(&id).await?;
    Ok(Json(TaskResponse {
        id: task.id,
        uniqid: task.uniqid,
        state: task.state,
        desired_state: task.desired_state,
        return_data: task.return_data,
    }))
}

/// 停止任务
///
/// POST /api/tasks/:id/stop
pub async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskAccepted>, ApiError> {
    let task = TaskService::new(state).stop(&id).await?;
    Ok(Json(TaskAccepted::from(&task)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestContext, APPKEY, CHANNEL};
    use axum::response::IntoResponse;
    use serde_json::json;

    fn submission(uniqid: &str, tasks: JsonValue) -> TaskSubmission {
        serde_json::from_value(json!({
            "appkey": APPKEY, "channel": CHANNEL, "uniqid": uniqid, "tasks": tasks
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_returns_accepted() {
        let ctx = TestContext::new();
        ctx.namespace().await;

        let (status, Json(accepted)) = submit_task(
            State(ctx.state.clone()),
            Json(submission("t1", json!([{"deploy_type": "namespace", "uniqid": "ns1", "action": "query"}]))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted.state, TaskState::Pending);

        ctx.run_jobs().await;
        let Json(task) = get_task(State(ctx.state.clone()), Path(accepted.id)).await.unwrap();
        assert_eq!(task.state, TaskState::Started);
    }

    #[tokio::test]
    async fn test_submit_with_missing_dependency_is_unprocessable() {
        let ctx = TestContext::new();
        let err = submit_task(
            State(ctx.state.clone()),
            Json(submission(
                "t1",
                json!([{"deploy_type": "namespace", "uniqid": "ns1", "action": "create", "cluster_uniqid": "cl1"}]),
            )),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
