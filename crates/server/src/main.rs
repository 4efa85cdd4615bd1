/// Easy Deploy - Server
///
/// 多租户部署控制面：接收任务、编排任务项，并由收敛引擎把资源推进到目标状态

mod api;
mod app_state;
mod config;
mod db;
mod metrics;
mod provisioner;
mod queue;
mod services;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    app_state::AppState,
    db::{establish_connection, sync_schema, MemoryStore, SeaOrmStore, Store},
    metrics::Metrics,
    provisioner::{MemoryBackend, ProvisionerRegistry},
    queue::{ChannelQueue, JobDispatcher, WorkerPool},
    services::{callback_service::HttpCallbackReporter, sweep_service::SweepService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = config::Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 Easy Deploy Server...");
    info!("✅ 配置加载成功");

    // 存储：配置了数据库时使用 SeaORM，否则使用内存存储
    let store: Arc<dyn Store> = if cfg.database_url.is_empty() {
        info!("⚠️ 未配置 DATABASE_URL，使用内存存储");
        Arc::new(MemoryStore::new())
    } else {
        let db = establish_connection(&cfg.database_url).await?;
        sync_schema(&db).await?;
        info!("✅ SeaORM 数据库连接成功");
        Arc::new(SeaOrmStore::new(db))
    };

    let engine = cfg.engine();
    let provisioners = ProvisionerRegistry::with_backend(Arc::new(MemoryBackend::new()), engine.clone());
    let metrics = Metrics::new()?;
    let notifier = Arc::new(HttpCallbackReporter::new(cfg.callback_timeout_secs, metrics.clone()));

    // 作业队列与应用状态
    let (queue, receiver) = ChannelQueue::new();
    let app_state = AppState::new(
        store,
        Arc::new(queue.clone()),
        provisioners,
        notifier,
        metrics,
        engine,
    );

    let cancel = CancellationToken::new();
    let workers = WorkerPool::start(
        queue,
        receiver,
        Arc::new(JobDispatcher::new(app_state.clone())),
        cfg.worker_count,
        cfg.queue_max_retries,
        cancel.clone(),
    );

    // 启动定时巡检
    let sweepers = SweepService::start(
        app_state.clone(),
        cfg.sweep_interval_secs,
        cfg.task_sweep_interval_secs,
        cancel.clone(),
    );
    info!("✅ 后台 worker 与定时巡检已启动");

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 构建应用路由
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("正在停止后台任务...");
    cancel.cancel();
    futures::future::join_all(sweepers).await;
    workers.shutdown().await;
    info!("👋 服务器已退出");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
    }
}

async fn root_handler() -> &'static str {
    "Easy Deploy Server API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .render()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
