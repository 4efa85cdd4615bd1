/// 应用全局状态

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Store;
use crate::metrics::Metrics;
use crate::provisioner::ProvisionerRegistry;
use crate::queue::JobQueue;
use crate::services::callback_service::Notifier;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 资源、任务、任务项的持久化
    pub store: Arc<dyn Store>,
    /// 作业队列
    pub queue: Arc<dyn JobQueue>,
    pub provisioners: ProvisionerRegistry,
    /// 回调发送
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Metrics,
    pub engine: EngineConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        provisioners: ProvisionerRegistry,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        engine: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            provisioners,
            notifier,
            metrics,
            engine,
        }
    }
}
