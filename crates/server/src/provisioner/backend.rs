/// 后端对象接口
///
/// 类 Kubernetes 的最小对象 API。真实集群客户端在外部实现该接口，
/// 内置的 [`MemoryBackend`] 用于开发模式和测试。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ProvisionError, ProvisionResult};

/// 后端对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Namespace,
    ResourceQuota,
    Deployment,
    StatefulSet,
    Service,
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    Job,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "namespace",
            ObjectKind::ResourceQuota => "resourcequota",
            ObjectKind::Deployment => "deployment",
            ObjectKind::StatefulSet => "statefulset",
            ObjectKind::Service => "service",
            ObjectKind::ConfigMap => "configmap",
            ObjectKind::Secret => "secret",
            ObjectKind::PersistentVolumeClaim => "pvc",
            ObjectKind::Job => "job",
        }
    }

    /// 是否为带副本数的工作负载
    pub fn is_workload(&self) -> bool {
        matches!(self, ObjectKind::Deployment | ObjectKind::StatefulSet)
    }
}

/// Job 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

/// 对象定位
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

/// 后端对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendObject {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub body: JsonValue,
    pub ready_replicas: i32,
    pub job_status: Option<JobStatus>,
    /// 删除中（优雅删除尚未完成）
    pub terminating: bool,
    pub created_at: DateTime<Utc>,
}

impl BackendObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// 后端客户端
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    async fn get(&self, cluster: &str, object: &ObjectRef) -> ProvisionResult<Option<BackendObject>>;

    /// 创建或整体替换对象
    async fn apply(&self, cluster: &str, object: BackendObject) -> ProvisionResult<()>;

    /// 删除对象，对象不存在时视为成功
    async fn delete(&self, cluster: &str, object: &ObjectRef) -> ProvisionResult<()>;
}

struct BackendState {
    objects: HashMap<(String, ObjectRef), BackendObject>,
    /// 工作负载 apply 后立即就绪、Job 立即成功
    auto_ready: bool,
    /// 第一次 delete 只标记删除中，第二次才真正移除
    graceful_deletion: bool,
    unreachable: bool,
    apply_count: usize,
}

/// 内存后端
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BackendState {
                objects: HashMap::new(),
                auto_ready: true,
                graceful_deletion: false,
                unreachable: false,
                apply_count: 0,
            })),
        }
    }

    pub async fn set_auto_ready(&self, auto_ready: bool) {
        self.state.write().await.auto_ready = auto_ready;
    }

    pub async fn set_graceful_deletion(&self, graceful: bool) {
        self.state.write().await.graceful_deletion = graceful;
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.write().await.unreachable = unreachable;
    }

    /// 累计 apply 次数
    pub async fn apply_count(&self) -> usize {
        self.state.read().await.apply_count
    }

    pub async fn object_count(&self) -> usize {
        self.state.read().await.objects.len()
    }

    /// 修改对象（测试中模拟副本就绪、Job 状态变化或外部篡改）
    pub async fn modify<F>(&self, cluster: &str, object: &ObjectRef, f: F) -> bool
    where
        F: FnOnce(&mut BackendObject),
    {
        let mut state = self.state.write().await;
        match state.objects.get_mut(&(cluster.to_string(), object.clone())) {
            Some(existing) => {
                f(existing);
                true
            }
            None => false,
        }
    }

    /// 某集群下的全部对象
    pub async fn list(&self, cluster: &str) -> Vec<BackendObject> {
        let state = self.state.read().await;
        let mut objects: Vec<BackendObject> = state
            .objects
            .iter()
            .filter(|((c, _), _)| c == cluster)
            .map(|(_, o)| o.clone())
            .collect();
        objects.sort_by(|a, b| (a.kind.as_str(), &a.name).cmp(&(b.kind.as_str(), &b.name)));
        objects
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    async fn get(&self, cluster: &str, object: &ObjectRef) -> ProvisionResult<Option<BackendObject>> {
        let state = self.state.read().await;
        if state.unreachable {
            return Err(ProvisionError::Transient(format!("集群 {} 不可达", cluster)));
        }
        Ok(state.objects.get(&(cluster.to_string(), object.clone())).cloned())
    }

    async fn apply(&self, cluster: &str, mut object: BackendObject) -> ProvisionResult<()> {
        let mut state = self.state.write().await;
        if state.unreachable {
            return Err(ProvisionError::Transient(format!("集群 {} 不可达", cluster)));
        }

        let key = (cluster.to_string(), object.object_ref());
        if let Some(existing) = state.objects.get(&key) {
            if existing.terminating {
                return Err(ProvisionError::Transient(format!(
                    "{} {} 正在删除中",
                    object.kind.as_str(),
                    object.name
                )));
            }
            // Job 替换视为重新创建
            if object.kind != ObjectKind::Job {
                object.created_at = existing.created_at;
            }
        }

        if object.kind.is_workload() {
            object.ready_replicas = if state.auto_ready { 1 } else { 0 };
        }
        if object.kind == ObjectKind::Job {
            object.job_status = Some(if state.auto_ready {
                JobStatus::Succeeded
            } else {
                JobStatus::Running
            });
        }
        object.terminating = false;

        debug!("后端 apply: cluster={}, {} {}/{}", cluster, object.kind.as_str(), object.namespace, object.name);
        state.objects.insert(key, object);
        state.apply_count += 1;
        Ok(())
    }

    async fn delete(&self, cluster: &str, object: &ObjectRef) -> ProvisionResult<()> {
        let mut state = self.state.write().await;
        if state.unreachable {
            return Err(ProvisionError::Transient(format!("集群 {} 不可达", cluster)));
        }

        let key = (cluster.to_string(), object.clone());
        let graceful = state.graceful_deletion;
        match state.objects.get(&key).map(|o| o.terminating) {
            Some(false) if graceful => {
                if let Some(existing) = state.objects.get_mut(&key) {
                    existing.terminating = true;
                }
            }
            Some(_) => {
                state.objects.remove(&key);
            }
            None => {}
        }
        Ok(())
    }
}
