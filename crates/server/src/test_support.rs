/// 测试辅助：记录型队列与回调、确定性地执行作业

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::models::DeployType;
use common::Result;
use serde_json::Value as JsonValue;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::db::models::resource::{CreateResourceDto, Resource};
use crate::db::models::spec::ResourceSpec;
use crate::db::models::task::{Task, TaskSubmission};
use crate::db::models::task_item::TaskItem;
use crate::db::MemoryStore;
use crate::metrics::Metrics;
use crate::provisioner::{MemoryBackend, ProvisionerRegistry};
use crate::queue::{Job, JobDispatcher, JobHandler, JobQueue};
use crate::services::callback_service::Notifier;
use crate::services::reconcile_service::ReconcileService;
use crate::services::resource_service::ResourceService;
use crate::services::sweep_service::SweepService;

pub const APPKEY: &str = "app1";
pub const CHANNEL: &str = "c1";

#[derive(Clone, Default)]
pub struct RecordingQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl RecordingQueue {
    pub fn pop(&self) -> Option<Job> {
        self.jobs.lock().unwrap().pop_front()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.jobs.lock().unwrap().clear();
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.jobs.lock().unwrap().push_back(job);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingReporter {
    sent: Arc<Mutex<Vec<(String, JsonValue)>>>,
}

impl RecordingReporter {
    pub fn sent(&self) -> Vec<(String, JsonValue)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingReporter {
    fn notify(&self, url: &str, body: JsonValue) {
        self.sent.lock().unwrap().push((url.to_string(), body));
    }
}

pub struct TestContext {
    pub state: AppState,
    pub store: MemoryStore,
    pub backend: MemoryBackend,
    pub queue: RecordingQueue,
    pub reporter: RecordingReporter,
}

impl TestContext {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let backend = MemoryBackend::new();
        let queue = RecordingQueue::default();
        let reporter = RecordingReporter::default();
        let engine = EngineConfig::default();
        let provisioners = ProvisionerRegistry::with_backend(Arc::new(backend.clone()), engine.clone());

        let state = AppState::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            provisioners,
            Arc::new(reporter.clone()),
            Metrics::new().unwrap(),
            engine,
        );

        Self {
            state,
            store,
            backend,
            queue,
            reporter,
        }
    }

    /// 按入队顺序执行作业直到队列为空，返回执行数量
    pub async fn run_jobs(&self) -> usize {
        let dispatcher = JobDispatcher::new(self.state.clone());
        let mut count = 0;
        while let Some(job) = self.queue.pop() {
            dispatcher.handle(&job).await.unwrap();
            count += 1;
            assert!(count < 1000, "job loop did not settle");
        }
        count
    }

    /// 模拟一轮定时巡检
    pub async fn sweep(&self) {
        let sweeper = SweepService::new(self.state.clone());
        for deploy_type in DeployType::ALL {
            sweeper.sweep_resources(deploy_type).await.unwrap();
        }
        sweeper.sweep_tasks().await.unwrap();
        self.run_jobs().await;
    }

    /// 创建资源并执行到收敛
    pub async fn create(&self, deploy_type: DeployType, uniqid: &str, fields: JsonValue) -> Resource {
        let resource = ResourceService::new(self.state.clone())
            .create(deploy_type, dto(uniqid, fields))
            .await
            .unwrap();
        self.converge(&resource.id).await
    }

    /// 反复执行收敛直到 state == desired_state（最多几轮）
    pub async fn converge(&self, id: &str) -> Resource {
        self.run_jobs().await;
        for _ in 0..3 {
            let resource = self.reload(id).await;
            if resource.state == resource.desired_state {
                return resource;
            }
            ReconcileService::new(self.state.clone())
                .reconcile(id, resource.guard())
                .await
                .unwrap();
            self.run_jobs().await;
        }
        self.reload(id).await
    }

    pub async fn reload(&self, id: &str) -> Resource {
        use crate::db::Store;
        self.store.get_resource(id).await.unwrap().unwrap()
    }

    /// 绕过控制器直接改写资源行
    pub async fn overwrite(&self, resource: &Resource) {
        use crate::db::Store;
        let expected = self.reload(&resource.id).await.guard();
        let mut resource = resource.clone();
        resource.touch();
        assert!(self
            .store
            .compare_and_update_resource(&resource, expected)
            .await
            .unwrap());
    }

    /// 常用的 cluster + namespace
    pub async fn namespace(&self) -> (Resource, Resource) {
        let cluster = self
            .create(DeployType::Cluster, "cl1", serde_json::json!({"api_server": "https://k8s.local:6443"}))
            .await;
        let namespace = self
            .create(DeployType::Namespace, "ns1", serde_json::json!({"cluster_uniqid": "cl1"}))
            .await;
        (cluster, namespace)
    }
}

pub fn dto(uniqid: &str, fields: JsonValue) -> CreateResourceDto {
    let fields = match fields {
        JsonValue::Object(map) => map,
        _ => Default::default(),
    };
    CreateResourceDto {
        appkey: APPKEY.to_string(),
        channel: CHANNEL.to_string(),
        uniqid: uniqid.to_string(),
        callback_url: None,
        fields,
    }
}

/// 未入库的 cluster 资源
pub fn cluster(uniqid: &str) -> Resource {
    let spec = ResourceSpec::from_fields(
        DeployType::Cluster,
        &serde_json::json!({"api_server": "https://k8s.local:6443"}),
    )
    .unwrap();
    Resource::new(APPKEY, CHANNEL, uniqid, spec, None, None)
}

/// 未入库的单项任务：创建一个 cluster
pub fn task(uniqid: &str, cluster_uniqid: &str) -> (Task, Vec<TaskItem>) {
    let submission: TaskSubmission = serde_json::from_value(serde_json::json!({
        "appkey": APPKEY,
        "channel": CHANNEL,
        "uniqid": uniqid,
        "tasks": [{
            "deploy_type": "cluster",
            "action": "create",
            "uniqid": cluster_uniqid,
            "api_server": "https://k8s.local:6443"
        }]
    }))
    .unwrap();
    let task = Task::from_submission(&submission);
    let items = submission
        .tasks
        .iter()
        .enumerate()
        .map(|(index, op)| TaskItem::new(&task.id, index, op, APPKEY, CHANNEL))
        .collect();
    (task, items)
}
