/// 基于子对象清单的通用 Provisioner
///
/// 每种资源类型对应一张静态的子对象表；具体的镜像、端口、挂载等清单内容
/// 视为数据，原样放进对象 body。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::models::constants::FINGERPRINT_ANNOTATION;
use common::models::DeployType;
use common::utils::to_object_name;
use common::Fingerprint;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::backend::{BackendClient, BackendObject, JobStatus, ObjectKind, ObjectRef};
use super::{
    resource_fingerprint, resource_labels, Placement, ProvisionError, ProvisionResult,
    Provisioner, TeardownStatus,
};
use crate::config::EngineConfig;
use crate::db::models::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Plain,
    /// 主工作负载，需要至少一个就绪副本
    Workload,
    /// 持久化存储，stop 时保留
    Persistent,
    /// 一次性任务
    Job,
}

#[derive(Debug, Clone, Copy)]
struct SubObject {
    kind: ObjectKind,
    suffix: &'static str,
    role: Role,
}

const fn sub(kind: ObjectKind, suffix: &'static str, role: Role) -> SubObject {
    SubObject { kind, suffix, role }
}

const CLUSTER: &[SubObject] = &[sub(ObjectKind::Secret, "credentials", Role::Plain)];

const NAMESPACE: &[SubObject] = &[
    sub(ObjectKind::Namespace, "", Role::Plain),
    sub(ObjectKind::ResourceQuota, "quota", Role::Plain),
];

const STATELESS: &[SubObject] = &[
    sub(ObjectKind::Deployment, "", Role::Workload),
    sub(ObjectKind::Service, "", Role::Plain),
];

const WORKSPACE: &[SubObject] = &[
    sub(ObjectKind::StatefulSet, "", Role::Workload),
    sub(ObjectKind::Service, "", Role::Plain),
    sub(ObjectKind::PersistentVolumeClaim, "data", Role::Persistent),
];

const CONFIG: &[SubObject] = &[sub(ObjectKind::ConfigMap, "", Role::Plain)];

const STATEFUL_INSTANCE: &[SubObject] = &[
    sub(ObjectKind::Secret, "auth", Role::Plain),
    sub(ObjectKind::StatefulSet, "", Role::Workload),
    sub(ObjectKind::Service, "", Role::Plain),
    sub(ObjectKind::PersistentVolumeClaim, "data", Role::Persistent),
];

const DATABASE_ACCOUNT: &[SubObject] = &[
    sub(ObjectKind::Secret, "auth", Role::Plain),
    sub(ObjectKind::Job, "init", Role::Job),
];

const MIGRATION: &[SubObject] = &[sub(ObjectKind::Job, "", Role::Job)];

fn sub_objects(deploy_type: DeployType) -> &'static [SubObject] {
    match deploy_type {
        DeployType::Cluster => CLUSTER,
        DeployType::Namespace => NAMESPACE,
        DeployType::Deployment | DeployType::Memcached => STATELESS,
        DeployType::Workspace => WORKSPACE,
        DeployType::ModelConfig => CONFIG,
        DeployType::Mysql | DeployType::Mongodb | DeployType::Redis | DeployType::Rabbitmq => {
            STATEFUL_INSTANCE
        }
        DeployType::MysqlDatabase | DeployType::MongodbDatabase => DATABASE_ACCOUNT,
        DeployType::DataMigration => MIGRATION,
    }
}

pub struct ManifestProvisioner {
    deploy_type: DeployType,
    backend: Arc<dyn BackendClient>,
    config: EngineConfig,
}

impl ManifestProvisioner {
    pub fn new(deploy_type: DeployType, backend: Arc<dyn BackendClient>, config: EngineConfig) -> Self {
        Self {
            deploy_type,
            backend,
            config,
        }
    }

    fn object_ref(&self, resource: &Resource, placement: &Placement, sub: &SubObject) -> ObjectRef {
        match sub.kind {
            ObjectKind::Namespace => ObjectRef {
                kind: sub.kind,
                namespace: String::new(),
                name: placement.namespace.clone(),
            },
            _ => ObjectRef {
                kind: sub.kind,
                namespace: placement.namespace.clone(),
                name: to_object_name(&[self.deploy_type.as_str(), &resource.uniqid, sub.suffix]),
            },
        }
    }

    fn build_object(
        &self,
        resource: &Resource,
        object_ref: ObjectRef,
        sub: &SubObject,
        labels: &BTreeMap<String, String>,
        fingerprint: &Fingerprint,
    ) -> ProvisionResult<BackendObject> {
        let fields = resource
            .spec
            .mutable_fields()
            .map_err(|e| ProvisionError::Permanent(format!("配置序列化失败: {}", e)))?;

        Ok(BackendObject {
            kind: object_ref.kind,
            namespace: object_ref.namespace,
            name: object_ref.name,
            labels: labels.clone(),
            annotations: BTreeMap::from([(
                FINGERPRINT_ANNOTATION.to_string(),
                fingerprint.to_string(),
            )]),
            body: json!({
                "component": sub.suffix,
                "spec": fields,
            }),
            ready_replicas: 0,
            job_status: None,
            terminating: false,
            created_at: Utc::now(),
        })
    }

    /// 检查 Job 状态：失败或超时视为永久错误并删除
    async fn check_job(
        &self,
        placement: &Placement,
        object: &BackendObject,
    ) -> ProvisionResult<bool> {
        match object.job_status {
            Some(JobStatus::Succeeded) => Ok(true),
            Some(JobStatus::Failed) => {
                self.backend.delete(&placement.cluster_id, &object.object_ref()).await?;
                Err(ProvisionError::Permanent(format!("Job {} 执行失败", object.name)))
            }
            _ => {
                if Utc::now() - object.created_at > self.config.job_timeout {
                    warn!("Job {} 超时未结束，删除并判定失败", object.name);
                    self.backend.delete(&placement.cluster_id, &object.object_ref()).await?;
                    return Err(ProvisionError::Permanent(format!("Job {} 执行超时", object.name)));
                }
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Provisioner for ManifestProvisioner {
    async fn apply(&self, resource: &Resource, placement: &Placement) -> ProvisionResult<()> {
        let labels = resource_labels(resource, &self.config);
        let fingerprint = resource_fingerprint(resource, &self.config)?;

        for sub in sub_objects(self.deploy_type) {
            let object_ref = self.object_ref(resource, placement, sub);
            let existing = self.backend.get(&placement.cluster_id, &object_ref).await?;

            if let Some(existing) = &existing {
                if fingerprint.matches(existing.annotation(FINGERPRINT_ANNOTATION)) {
                    continue;
                }
                // Job 不可原地修改，先删后建
                if sub.role == Role::Job {
                    self.backend.delete(&placement.cluster_id, &object_ref).await?;
                }
            }

            debug!(
                "apply {} {}/{} (resource={})",
                object_ref.kind.as_str(),
                object_ref.namespace,
                object_ref.name,
                resource.id
            );
            let object = self.build_object(resource, object_ref, sub, &labels, &fingerprint)?;
            self.backend.apply(&placement.cluster_id, object).await?;
        }

        info!("资源已 apply: {} {} ({})", resource.deploy_type, resource.uniqid, resource.id);
        Ok(())
    }

    async fn available(&self, resource: &Resource, placement: &Placement) -> ProvisionResult<bool> {
        let fingerprint = resource_fingerprint(resource, &self.config)?;

        for sub in sub_objects(self.deploy_type) {
            let object_ref = self.object_ref(resource, placement, sub);
            let Some(object) = self.backend.get(&placement.cluster_id, &object_ref).await? else {
                return Ok(false);
            };

            if object.terminating || !fingerprint.matches(object.annotation(FINGERPRINT_ANNOTATION)) {
                return Ok(false);
            }

            match sub.role {
                Role::Workload if object.ready_replicas < 1 => return Ok(false),
                Role::Job => {
                    if !self.check_job(placement, &object).await? {
                        return Ok(false);
                    }
                }
                _ => {}
            }
        }
        Ok(true)
    }

    async fn teardown(
        &self,
        resource: &Resource,
        placement: &Placement,
        keep_persistent: bool,
    ) -> ProvisionResult<TeardownStatus> {
        let targets: Vec<ObjectRef> = sub_objects(self.deploy_type)
            .iter()
            .filter(|sub| !(keep_persistent && sub.role == Role::Persistent))
            .map(|sub| self.object_ref(resource, placement, sub))
            .collect();

        for object_ref in &targets {
            if self.backend.get(&placement.cluster_id, object_ref).await?.is_some() {
                self.backend.delete(&placement.cluster_id, object_ref).await?;
            }
        }

        for object_ref in &targets {
            if self.backend.get(&placement.cluster_id, object_ref).await?.is_some() {
                return Ok(TeardownStatus::InProgress);
            }
        }
        Ok(TeardownStatus::Complete)
    }
}
