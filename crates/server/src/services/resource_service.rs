/// 资源控制器
///
/// 每个入口只修改 (state, desired_state) 与配置并投递收敛作业，真正的后端操作由收敛引擎完成。
/// 写入以行版本为条件，不会覆盖收敛引擎的并发写入。

use std::collections::HashSet;

use common::models::{DeployType, ResourceKey, ResourceState};
use common::{Error, Result};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::db::models::resource::{CreateResourceDto, Resource};
use crate::db::models::spec::ResourceSpec;
use crate::queue::Job;
use crate::services::dependency_service::DependencyService;

/// 控制器写入与收敛引擎冲突时的最大尝试次数
const MAX_WRITE_ATTEMPTS: usize = 5;

pub struct ResourceService {
    state: AppState,
}

impl ResourceService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 创建资源
    pub async fn create(&self, deploy_type: DeployType, dto: CreateResourceDto) -> Result<Resource> {
        if dto.uniqid.is_empty() || dto.appkey.is_empty() || dto.channel.is_empty() {
            return Err(Error::InvalidArgument("appkey、channel、uniqid 不能为空".to_string()));
        }

        let spec = ResourceSpec::from_fields(deploy_type, &JsonValue::Object(dto.fields))?;
        let superior = DependencyService::new(self.state.clone())
            .resolve_superiors(&dto.appkey, &dto.channel, &spec)
            .await?;

        let resource = Resource::new(
            dto.appkey,
            dto.channel,
            dto.uniqid,
            spec,
            superior.map(|s| s.id),
            dto.callback_url,
        );
        self.state.store.insert_resource(&resource).await?;
        self.state.queue.enqueue(Job::reconcile(&resource)).await?;

        info!(
            "资源已创建: {} {} (id={})",
            resource.deploy_type, resource.uniqid, resource.id
        );
        Ok(resource)
    }

    /// 合并更新配置，重新进入收敛
    pub async fn update(&self, key: &ResourceKey, fields: &JsonValue) -> Result<Resource> {
        self.modify(key, |resource| {
            ensure_not_destroying(resource)?;
            resource.spec = resource.spec.merged(fields)?;
            let desired = match resource.desired_state {
                ResourceState::Failed | ResourceState::Pending => ResourceState::Started,
                other => other,
            };
            retarget(resource, desired);
            Ok(())
        })
        .await
    }

    pub async fn start(&self, key: &ResourceKey) -> Result<Resource> {
        self.transition(key, ResourceState::Started).await
    }

    pub async fn restart(&self, key: &ResourceKey) -> Result<Resource> {
        self.transition(key, ResourceState::Restarted).await
    }

    pub async fn stop(&self, key: &ResourceKey) -> Result<Resource> {
        self.transition(key, ResourceState::Stopped).await
    }

    /// 销毁资源，依赖它的资源一并标记为销毁
    pub async fn destroy(&self, key: &ResourceKey) -> Result<Resource> {
        let resource = self.get(key).await?;
        if resource.desired_state == ResourceState::Destroyed {
            return Ok(resource);
        }

        let dependencies = DependencyService::new(self.state.clone());
        let mut visited = HashSet::from([resource.id.clone()]);
        let mut pending = vec![resource];
        while let Some(parent) = pending.pop() {
            for child in dependencies.dependents(&parent).await? {
                if !visited.insert(child.id.clone()) {
                    continue;
                }
                if child.desired_state != ResourceState::Destroyed {
                    info!("级联销毁: {} {} (依赖 {})", child.deploy_type, child.uniqid, parent.key());
                    self.modify(&child.key(), |r| {
                        retarget(r, ResourceState::Destroyed);
                        Ok(())
                    })
                    .await?;
                }
                pending.push(child);
            }
        }

        self.modify(key, |r| {
            retarget(r, ResourceState::Destroyed);
            Ok(())
        })
        .await
    }

    /// 按租户与 uniqid 读取
    pub async fn get(&self, key: &ResourceKey) -> Result<Resource> {
        self.state
            .store
            .find_resource(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {} is not existed", key.deploy_type, key.uniqid)))
    }

    async fn transition(&self, key: &ResourceKey, desired: ResourceState) -> Result<Resource> {
        self.modify(key, |resource| {
            ensure_not_destroying(resource)?;
            retarget(resource, desired);
            Ok(())
        })
        .await
    }

    /// 读取最新行、修改、按行版本条件写回；与收敛引擎的写入冲突时重读重试
    async fn modify<F>(&self, key: &ResourceKey, mut change: F) -> Result<Resource>
    where
        F: FnMut(&mut Resource) -> Result<()> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut resource = self.get(key).await?;
            let expected = resource.guard();
            change(&mut resource)?;
            resource.touch();

            if self
                .state
                .store
                .compare_and_update_resource(&resource, expected)
                .await?
            {
                self.state.queue.enqueue(Job::reconcile(&resource)).await?;
                info!(
                    "资源进入收敛: {} {} -> {}",
                    resource.deploy_type, resource.uniqid, resource.desired_state
                );
                return Ok(resource);
            }
            debug!("资源写入冲突，重新读取: {}", key);
        }
        Err(Error::Conflict(format!("{} {}", key.deploy_type, key.uniqid)))
    }
}

/// 重新进入 pending，目标状态改为 desired
fn retarget(resource: &mut Resource, desired: ResourceState) {
    resource.state = ResourceState::Pending;
    resource.desired_state = desired;
    resource.attempt_times = 0;
}

fn ensure_not_destroying(resource: &Resource) -> Result<()> {
    if resource.desired_state == ResourceState::Destroyed {
        return Err(Error::InvalidArgument(format!(
            "{} {} 正在销毁",
            resource.deploy_type, resource.uniqid
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::test_support::{dto, TestContext, APPKEY, CHANNEL};
    use serde_json::json;

    fn key(deploy_type: DeployType, uniqid: &str) -> ResourceKey {
        ResourceKey::new(deploy_type, APPKEY, CHANNEL, uniqid)
    }

    #[tokio::test]
    async fn test_create_enqueues_reconcile() {
        let ctx = TestContext::new();
        let service = ResourceService::new(ctx.state.clone());
        let cluster = service
            .create(DeployType::Cluster, dto("cl1", json!({"api_server": "https://k8s.local"})))
            .await
            .unwrap();

        assert_eq!(cluster.state, ResourceState::Pending);
        assert_eq!(cluster.desired_state, ResourceState::Started);
        assert_eq!(ctx.queue.jobs(), vec![Job::reconcile(&cluster)]);
    }

    #[tokio::test]
    async fn test_create_requires_superior() {
        let ctx = TestContext::new();
        let service = ResourceService::new(ctx.state.clone());
        let err = service
            .create(DeployType::Namespace, dto("ns1", json!({"cluster_uniqid": "cl1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dependency(ref msg) if msg == "cluster cl1 is not existed"));
        assert!(ctx.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let err = ResourceService::new(ctx.state.clone())
            .create(DeployType::Namespace, dto("ns1", json!({"cluster_uniqid": "cl1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_resets_failed_resource() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let redis = ctx
            .create(DeployType::Redis, "r1", json!({"namespace_uniqid": "ns1"}))
            .await;

        let mut failed = redis.clone();
        failed.state = ResourceState::Failed;
        failed.attempt_times = 3;
        ctx.overwrite(&failed).await;

        let updated = ResourceService::new(ctx.state.clone())
            .update(&key(DeployType::Redis, "r1"), &json!({"password": "new-password"}))
            .await
            .unwrap();
        assert_eq!(updated.state, ResourceState::Pending);
        assert_eq!(updated.desired_state, ResourceState::Started);
        assert_eq!(updated.attempt_times, 0);
    }

    #[tokio::test]
    async fn test_destroy_cascades_to_children() {
        let ctx = TestContext::new();
        let (_, namespace) = ctx.namespace().await;
        let redis = ctx
            .create(DeployType::Redis, "r1", json!({"namespace_uniqid": "ns1"}))
            .await;
        ctx.queue.clear();

        ResourceService::new(ctx.state.clone())
            .destroy(&key(DeployType::Namespace, "ns1"))
            .await
            .unwrap();

        assert_eq!(ctx.reload(&namespace.id).await.desired_state, ResourceState::Destroyed);
        assert_eq!(ctx.reload(&redis.id).await.desired_state, ResourceState::Destroyed);
        assert_eq!(ctx.queue.jobs().len(), 2);

        let err = ResourceService::new(ctx.state.clone())
            .start(&key(DeployType::Redis, "r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_destroy_destination_cascades_to_migration() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let fields = json!({"namespace_uniqid": "ns1", "password": "secret-pass", "storage_size": "10Gi"});
        let source = ctx.create(DeployType::Mysql, "m1", fields.clone()).await;
        let destination = ctx.create(DeployType::Mysql, "m2", fields).await;
        let migration = ctx
            .create(
                DeployType::DataMigration,
                "mig1",
                json!({"source_uniqid": "m1", "destination_uniqid": "m2", "backing_type": "mysql"}),
            )
            .await;
        assert_eq!(migration.superior_id.as_deref(), Some(source.id.as_str()));

        ResourceService::new(ctx.state.clone())
            .destroy(&key(DeployType::Mysql, "m2"))
            .await
            .unwrap();
        assert_eq!(ctx.reload(&migration.id).await.desired_state, ResourceState::Destroyed);

        ctx.run_jobs().await;
        ctx.sweep().await;
        assert!(ctx.store.get_resource(&migration.id).await.unwrap().is_none());
        assert!(ctx.store.get_resource(&destination.id).await.unwrap().is_none());
        assert_eq!(ctx.reload(&source.id).await.state, ResourceState::Started);
    }
}
