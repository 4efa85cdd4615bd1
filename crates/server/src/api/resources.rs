/// 资源接口：按租户与 uniqid 定位单个资源

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::models::{DeployType, ResourceKey};
use serde_json::Value as JsonValue;

use super::ApiError;
use crate::app_state::AppState;
use crate::db::models::resource::{CreateResourceDto, TenantQuery};
use crate::services::resource_service::ResourceService;

/// 资源路由
pub fn resource_routes() -> Router<AppState> {
    Router::new()
        .route("/:deploy_type", post(create_resource))
        .route(
            "/:deploy_type/:uniqid",
            get(get_resource).put(update_resource).delete(destroy_resource),
        )
        .route("/:deploy_type/:uniqid/start", post(start_resource))
        .route("/:deploy_type/:uniqid/stop", post(stop_resource))
        .route("/:deploy_type/:uniqid/restart", post(restart_resource))
}

fn resource_key(deploy_type: DeployType, uniqid: &str, tenant: &TenantQuery) -> ResourceKey {
    ResourceKey::new(deploy_type, &tenant.appkey, &tenant.channel, uniqid)
}

/// 创建资源
///
/// POST /api/resources/:deploy_type
pub async fn create_resource(
    State(state): State<AppState>,
    Path(deploy_type): Path<DeployType>,
    Json(dto): Json<CreateResourceDto>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let resource = ResourceService::new(state).create(deploy_type, dto).await?;
    Ok((StatusCode::CREATED, Json(resource.view())))
}

/// GET /api/resources/:deploy_type/:uniqid?appkey=..&channel=..
pub async fn get_resource(
    State(state): State<AppState>,
    Path((deploy_type, uniqid)): Path<(DeployType, String)>,
    Query(tenant): Query<TenantQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let resource = ResourceService::new(state)
        .get(&resource_key(deploy_type, &uniqid, &tenant))
        .await?;
    Ok(Json(resource.view()))
}

/// PUT /api/resources/:deploy_type/:uniqid
pub async fn update_resource(
    State(state): State<AppState>,
    Path((deploy_type, uniqid)): Path<(DeployType, String)>,
    Query(tenant): Query<TenantQuery>,
    Json(fields): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let resource = ResourceService::new(state)
        .update(&resource_key(deploy_type, &uniqid, &tenant), &fields)
        .await?;
    Ok(Json(resource.view()))
}

/// DELETE /api/resources/:deploy_type/:uniqid
pub async fn destroy_resource(
    State(state): State<AppState>,
    Path((deploy_type, uniqid)): Path<(DeployType, String)>,
    Query(tenant): Query<TenantQuery>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let resource = ResourceService::new(state)
        .destroy(&resource_key(deploy_type, &uniqid, &tenant))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(resource.view())))
}

pub async fn start_resource(
    State(state): State<AppState>,
    Path((deploy_type, uniqid)): Path<(DeployType, String)>,
    Query(tenant): Query<TenantQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let resource = ResourceService::new(state)
        .start(&resource_key(deploy_type, &uniqid, &tenant))
        .await?;
    Ok(Json(resource.view()))
}

pub async fn stop_resource(
    State(state): State<AppState>,
    Path((deploy_type, uniqid)): Path<(DeployType, String)>,
    Query(tenant): Query<TenantQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let resource = ResourceService::new(state)
        .stop(&resource_key(deploy_type, &uniqid, &tenant))
        .await?;
    Ok(Json(resource.view()))
}

pub async fn restart_resource(
    State(state): State<AppState>,
    Path((deploy_type, uniqid)): Path<(DeployType, String)>,
    Query(tenant): Query<TenantQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let resource = ResourceService::new(state)
        .restart(&resource_key(deploy_type, &uniqid, &tenant))
        .await?;
    Ok(Json(resource.view()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dto, TestContext, APPKEY, CHANNEL};
    use axum::response::IntoResponse;
    use common::models::ResourceState;
    use serde_json::json;

    fn tenant() -> Query<TenantQuery> {
        Query(TenantQuery {
            appkey: APPKEY.to_string(),
            channel: CHANNEL.to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let ctx = TestContext::new();
        let (status, Json(created)) = create_resource(
            State(ctx.state.clone()),
            Path(DeployType::Cluster),
            Json(dto("cl1", json!({"api_server": "https://k8s.local:6443"}))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["state"], "pending");

        // 首轮 apply 后等待后端就绪，下一轮巡检确认收敛
        let id = created["id"].as_str().unwrap();
        ctx.run_jobs().await;
        assert_eq!(ctx.reload(id).await.state, ResourceState::Pending);
        ctx.sweep().await;

        let Json(view) = get_resource(
            State(ctx.state.clone()),
            Path((DeployType::Cluster, "cl1".to_string())),
            tenant(),
        )
        .await
        .unwrap();
        assert_eq!(view["state"], "started");
    }

    #[tokio::test]
    async fn test_other_tenant_sees_not_found() {
        let ctx = TestContext::new();
        ctx.namespace().await;

        let err = get_resource(
            State(ctx.state.clone()),
            Path((DeployType::Namespace, "ns1".to_string())),
            Query(TenantQuery {
                appkey: "other".to_string(),
                channel: CHANNEL.to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
