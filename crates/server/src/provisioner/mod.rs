/// 资源供应层
///
/// Provisioner 把资源映射为后端具体对象：创建或修补、检查可用性、清理。
/// 引擎只通过 [`Provisioner`] 接口调用，不关心具体清单内容。

pub mod backend;
pub mod manifest;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use common::models::constants::OWNER_LABEL;
use common::models::DeployType;
use common::Fingerprint;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::db::models::resource::Resource;

pub use backend::{BackendClient, MemoryBackend};
pub use manifest::ManifestProvisioner;

/// 供应错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProvisionError {
    /// 可重试，计入 attempt_times
    #[error("暂时性错误: {0}")]
    Transient(String),

    /// 不可恢复，资源直接置为 failed
    #[error("永久性错误: {0}")]
    Permanent(String),
}

impl ProvisionError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProvisionError::Permanent(_))
    }
}

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

/// 清理进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStatus {
    /// 对象已全部消失
    Complete,
    /// 仍有对象在删除中
    InProgress,
}

/// 资源在后端的位置
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placement {
    /// 集群资源 id，后端按它区分集群
    pub cluster_id: String,
    pub api_server: String,
    /// 对象所在命名空间；集群级对象使用系统命名空间
    pub namespace: String,
}

/// 资源供应接口
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// 幂等地创建或修补全部子对象，并打上当前指纹
    async fn apply(&self, resource: &Resource, placement: &Placement) -> ProvisionResult<()>;

    /// 子对象齐全、指纹一致且主工作负载至少一个副本就绪
    async fn available(&self, resource: &Resource, placement: &Placement) -> ProvisionResult<bool>;

    /// 删除子对象，keep_persistent 为真时保留持久化存储
    async fn teardown(
        &self,
        resource: &Resource,
        placement: &Placement,
        keep_persistent: bool,
    ) -> ProvisionResult<TeardownStatus>;
}

/// 资源类型 -> Provisioner
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    provisioners: HashMap<DeployType, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为所有资源类型注册基于清单的 Provisioner
    pub fn with_backend(backend: Arc<dyn BackendClient>, config: EngineConfig) -> Self {
        let mut registry = Self::new();
        for deploy_type in DeployType::ALL {
            registry.register(
                deploy_type,
                Arc::new(ManifestProvisioner::new(deploy_type, backend.clone(), config.clone())),
            );
        }
        registry
    }

    pub fn register(&mut self, deploy_type: DeployType, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.insert(deploy_type, provisioner);
    }

    pub fn get(&self, deploy_type: DeployType) -> Option<Arc<dyn Provisioner>> {
        self.provisioners.get(&deploy_type).cloned()
    }
}

/// 后端对象上的标签：公共标签 + 归属信息 + 用户标签
pub fn resource_labels(resource: &Resource, config: &EngineConfig) -> BTreeMap<String, String> {
    let mut labels = config.common_labels.clone();
    labels.insert(OWNER_LABEL.to_string(), resource.id.clone());
    labels.insert("easy-deploy/deploy-type".to_string(), resource.deploy_type.to_string());
    labels.insert("easy-deploy/appkey".to_string(), resource.appkey.clone());
    labels.insert("easy-deploy/channel".to_string(), resource.channel.clone());
    labels.insert("easy-deploy/uniqid".to_string(), resource.uniqid.clone());
    labels.extend(resource.spec.labels());
    labels
}

/// 资源当前指纹
pub fn resource_fingerprint(
    resource: &Resource,
    config: &EngineConfig,
) -> ProvisionResult<Fingerprint> {
    let fields = resource
        .spec
        .mutable_fields()
        .map_err(|e| ProvisionError::Permanent(format!("配置序列化失败: {}", e)))?;
    Ok(Fingerprint::compute(&resource_labels(resource, config), &fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::spec::ResourceSpec;
    use serde_json::json;

    fn deployment(labels: serde_json::Value) -> Resource {
        let spec = ResourceSpec::from_fields(
            DeployType::Deployment,
            &json!({"namespace_uniqid": "ns1", "image": "nginx", "labels": labels}),
        )
        .unwrap();
        Resource::new("app1", "c1", "web", spec, Some("ns-id".into()), None)
    }

    #[test]
    fn test_labels_include_owner_and_user_labels() {
        let resource = deployment(json!({"team": "infra"}));
        let labels = resource_labels(&resource, &EngineConfig::default());
        assert_eq!(labels[OWNER_LABEL], resource.id);
        assert_eq!(labels["team"], "infra");
        assert_eq!(labels["easy-deploy/uniqid"], "web");
    }

    #[test]
    fn test_fingerprint_tracks_labels() {
        let config = EngineConfig::default();
        let mut resource = deployment(json!({"team": "infra"}));
        let before = resource_fingerprint(&resource, &config).unwrap();

        if let ResourceSpec::Deployment(spec) = &mut resource.spec {
            spec.labels.insert("team".into(), "web".into());
        }
        let after = resource_fingerprint(&resource, &config).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_registry_covers_all_types() {
        let registry = ProvisionerRegistry::with_backend(
            Arc::new(MemoryBackend::new()),
            EngineConfig::default(),
        );
        for deploy_type in DeployType::ALL {
            assert!(registry.get(deploy_type).is_some());
        }
    }
}
