pub mod resources;
pub mod tasks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use common::{Error, IndexedErrors};
use serde::Serialize;
use tracing::error;

use crate::app_state::AppState;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::task_routes())
        .nest("/resources", resources::resource_routes())
}

/// API 错误响应
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<IndexedErrors>,
}

#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Locked(_) => StatusCode::LOCKED,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidArgument(_) | Error::Dependency(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if !self.0.is_client_error() {
            error!("请求处理失败: {}", self.0);
        }

        let errors = match &self.0 {
            Error::Validation(errors) => Some(errors.clone()),
            _ => None,
        };
        let body = Json(ErrorResponse {
            error: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: self.0.to_string(),
            errors,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestContext, APPKEY, CHANNEL};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value as JsonValue};
    use tower::ServiceExt;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Locked("x".into()), StatusCode::LOCKED),
            (
                Error::Validation(IndexedErrors::from([(0, vec!["x".to_string()])])),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::Dependency("x".into()), StatusCode::BAD_REQUEST),
            (Error::Backend("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_router_reports_indexed_errors() {
        let ctx = TestContext::new();
        let app = Router::new()
            .nest("/api", api_routes())
            .with_state(ctx.state.clone());

        let body = json!({
            "appkey": APPKEY,
            "channel": CHANNEL,
            "uniqid": "t1",
            "tasks": [
                {"deploy_type": "cluster", "uniqid": "cl1", "action": "create", "api_server": "https://k8s.local:6443"},
                {"deploy_type": "redis", "uniqid": "r1", "action": "create", "namespace_uniqid": "ns9"}
            ]
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/tasks")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert!(payload["errors"].get("0").is_none());
        assert_eq!(payload["errors"]["1"][0], "namespace ns9 is not existed");
    }
}
