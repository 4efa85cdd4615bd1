/// 收敛引擎
///
/// 每个出队的 Reconcile 作业执行一次 [`ReconcileService::reconcile`]：
/// 重新加载资源并与投递时的 (state, desired_state, version) 比较，不一致即为过期作业直接放弃；
/// 否则根据后端是否可用推进状态机。所有写入都以加载时的行版本为条件（乐观并发），
/// 没有分布式锁。

use common::models::ResourceState;
use common::{Error, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::db::models::resource::{Resource, StateGuard, StatusMessage};
use crate::provisioner::{ProvisionError, TeardownStatus};
use crate::queue::Job;
use crate::services::callback_service::CallbackPayload;
use crate::services::dependency_service::{placement, DependencyService};

/// 单次收敛的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// 资源已不存在或状态已变化
    Stale,
    /// 上级缺失或正在销毁
    Blocked,
    Converged,
    /// 稳定状态下后端不再匹配，重新进入收敛
    Drifted,
    /// 已 apply，等待后端就绪
    Applied,
    /// 清理尚未完成
    Waiting,
    /// 暂时性错误，已计入 attempt_times
    Retrying,
    Failed,
    Destroyed,
    /// failed 且后端仍不可用
    Inert,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassOutcome::Stale => "stale",
            PassOutcome::Blocked => "blocked",
            PassOutcome::Converged => "converged",
            PassOutcome::Drifted => "drifted",
            PassOutcome::Applied => "applied",
            PassOutcome::Waiting => "waiting",
            PassOutcome::Retrying => "retrying",
            PassOutcome::Failed => "failed",
            PassOutcome::Destroyed => "destroyed",
            PassOutcome::Inert => "inert",
        }
    }
}

pub struct ReconcileService {
    state: AppState,
}

impl ReconcileService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 对资源执行一次收敛
    pub async fn reconcile(&self, resource_id: &str, expected: StateGuard) -> Result<PassOutcome> {
        let Some(resource) = self.state.store.get_resource(resource_id).await? else {
            debug!("资源已不存在，忽略过期作业: {}", resource_id);
            return Ok(PassOutcome::Stale);
        };
        if resource.guard() != expected {
            debug!(
                "资源状态已变化，忽略过期作业: {} (期望 {}/{} v{}，实际 {}/{} v{})",
                resource_id,
                expected.state,
                expected.desired_state,
                expected.version,
                resource.state,
                resource.desired_state,
                resource.version
            );
            return Ok(PassOutcome::Stale);
        }

        let deploy_type = resource.deploy_type;
        let outcome = self.pass(resource).await?;
        self.state
            .metrics
            .reconcile_passes
            .with_label_values(&[deploy_type.as_str(), outcome.as_str()])
            .inc();
        Ok(outcome)
    }

    async fn pass(&self, resource: Resource) -> Result<PassOutcome> {
        let provisioner = self
            .state
            .provisioners
            .get(resource.deploy_type)
            .ok_or_else(|| Error::Internal(format!("{} 没有注册 provisioner", resource.deploy_type)))?;
        let destroying = resource.desired_state == ResourceState::Destroyed;
        let dependencies = DependencyService::new(self.state.clone());

        let Some(ancestors) = dependencies.ancestors(&resource).await? else {
            if destroying {
                // 上级已删除，后端对象随上级一起清理
                return self.finish_destroy(resource).await;
            }
            debug!("上级资源不存在，暂不处理: {}", resource.key());
            return Ok(PassOutcome::Blocked);
        };
        if !destroying
            && ancestors
                .iter()
                .any(|a| a.desired_state == ResourceState::Destroyed)
        {
            debug!("上级资源正在销毁，暂不处理: {}", resource.key());
            return Ok(PassOutcome::Blocked);
        }
        if !destroying && !dependencies.secondary_superiors_ready(&resource).await? {
            debug!("引用的其他上级缺失或正在销毁，暂不处理: {}", resource.key());
            return Ok(PassOutcome::Blocked);
        }

        let placement = placement(&resource, &ancestors, &self.state.engine)?;
        let guard = resource.guard();

        if resource.state == ResourceState::Failed {
            if !resource.desired_state.is_running() {
                return Ok(PassOutcome::Inert);
            }
            return match provisioner.available(&resource, &placement).await {
                Ok(true) => {
                    info!("failed 资源已恢复可用: {}", resource.key());
                    self.settle(resource, guard).await
                }
                Ok(false) => Ok(PassOutcome::Inert),
                Err(e) => {
                    debug!("failed 资源检查出错: {}: {}", resource.key(), e);
                    Ok(PassOutcome::Inert)
                }
            };
        }

        if resource.state == resource.desired_state && resource.state.is_stable() {
            if !resource.state.is_running() {
                return Ok(PassOutcome::Converged);
            }
            return match provisioner.available(&resource, &placement).await {
                Ok(true) => Ok(PassOutcome::Converged),
                Ok(false) => self.drift(resource, guard).await,
                Err(e) => self.record_error(resource, guard, e).await,
            };
        }

        match resource.desired_state {
            ResourceState::Started | ResourceState::Restarted => {
                match provisioner.available(&resource, &placement).await {
                    Ok(true) => self.settle(resource, guard).await,
                    Ok(false) => match provisioner.apply(&resource, &placement).await {
                        Ok(()) => {
                            self.escalate(resource, guard, "后端未就绪".to_string(), PassOutcome::Applied)
                                .await
                        }
                        Err(e) => self.record_error(resource, guard, e).await,
                    },
                    Err(e) => self.record_error(resource, guard, e).await,
                }
            }
            ResourceState::Stopped => match provisioner.teardown(&resource, &placement, true).await {
                Ok(TeardownStatus::Complete) => self.settle(resource, guard).await,
                Ok(TeardownStatus::InProgress) => Ok(PassOutcome::Waiting),
                Err(e) => self.record_error(resource, guard, e).await,
            },
            ResourceState::Destroyed => {
                if !dependencies.dependents(&resource).await?.is_empty() {
                    debug!("等待下级资源清理: {}", resource.key());
                    return Ok(PassOutcome::Waiting);
                }
                match provisioner.teardown(&resource, &placement, false).await {
                    Ok(TeardownStatus::Complete) => self.finish_destroy(resource).await,
                    Ok(TeardownStatus::InProgress) => Ok(PassOutcome::Waiting),
                    Err(e) => self.record_error(resource, guard, e).await,
                }
            }
            ResourceState::Pending | ResourceState::Failed => {
                warn!(
                    "无效的目标状态 {}: {}",
                    resource.desired_state,
                    resource.key()
                );
                Ok(PassOutcome::Inert)
            }
        }
    }

    /// 到达目标状态
    async fn settle(&self, mut resource: Resource, guard: StateGuard) -> Result<PassOutcome> {
        resource.state = resource.desired_state;
        resource.attempt_times = 0;
        resource.message = Some(StatusMessage::new(
            200,
            resource.deploy_type,
            &resource.uniqid,
            json!({"state": resource.state}),
        ));
        resource.touch();
        if !self.save(&resource, guard).await? {
            return Ok(PassOutcome::Stale);
        }

        info!(
            "资源已收敛: {} {} -> {}",
            resource.deploy_type, resource.uniqid, resource.state
        );
        self.report(&resource)?;
        self.publish_settled(&resource).await?;
        Ok(PassOutcome::Converged)
    }

    /// 漂移：回到 pending 并立即再投递一次
    async fn drift(&self, mut resource: Resource, guard: StateGuard) -> Result<PassOutcome> {
        resource.state = ResourceState::Pending;
        resource.touch();
        if !self.save(&resource, guard).await? {
            return Ok(PassOutcome::Stale);
        }

        info!("检测到漂移，重新收敛: {}", resource.key());
        self.state.queue.enqueue(Job::reconcile(&resource)).await?;
        Ok(PassOutcome::Drifted)
    }

    async fn record_error(
        &self,
        resource: Resource,
        guard: StateGuard,
        err: ProvisionError,
    ) -> Result<PassOutcome> {
        if err.is_permanent() {
            warn!("资源收敛出现永久性错误: {}: {}", resource.key(), err);
            return self.fail(resource, guard, err.to_string()).await;
        }
        warn!("资源收敛出错: {}: {}", resource.key(), err);
        self.escalate(resource, guard, err.to_string(), PassOutcome::Retrying)
            .await
    }

    /// attempt_times + 1，达到阈值时置为 failed
    async fn escalate(
        &self,
        mut resource: Resource,
        guard: StateGuard,
        detail: String,
        outcome: PassOutcome,
    ) -> Result<PassOutcome> {
        resource.attempt_times += 1;
        if resource.attempt_times >= self.state.engine.max_attempt_times {
            let detail = format!("{} (已尝试 {} 次)", detail, resource.attempt_times);
            return self.fail(resource, guard, detail).await;
        }

        if outcome == PassOutcome::Retrying {
            resource.message = Some(StatusMessage::new(
                500,
                resource.deploy_type,
                &resource.uniqid,
                json!({"error": detail}),
            ));
        }
        resource.touch();
        if !self.save(&resource, guard).await? {
            return Ok(PassOutcome::Stale);
        }
        debug!(
            "资源收敛中: {} (attempt_times={})",
            resource.key(),
            resource.attempt_times
        );
        Ok(outcome)
    }

    async fn fail(&self, mut resource: Resource, guard: StateGuard, detail: String) -> Result<PassOutcome> {
        resource.state = ResourceState::Failed;
        resource.message = Some(StatusMessage::new(
            500,
            resource.deploy_type,
            &resource.uniqid,
            json!({"error": detail}),
        ));
        resource.touch();
        if !self.save(&resource, guard).await? {
            return Ok(PassOutcome::Stale);
        }

        warn!("资源已置为 failed: {}: {}", resource.key(), detail);
        self.report(&resource)?;
        self.publish_settled(&resource).await?;
        Ok(PassOutcome::Failed)
    }

    async fn finish_destroy(&self, mut resource: Resource) -> Result<PassOutcome> {
        self.state.store.delete_resource(&resource.id).await?;
        resource.message = Some(StatusMessage::new(
            200,
            resource.deploy_type,
            &resource.uniqid,
            json!({"state": ResourceState::Destroyed}),
        ));

        info!("资源已销毁: {} {}", resource.deploy_type, resource.uniqid);
        self.report(&resource)?;
        self.publish_settled(&resource).await?;
        Ok(PassOutcome::Destroyed)
    }

    async fn save(&self, resource: &Resource, guard: StateGuard) -> Result<bool> {
        let saved = self
            .state
            .store
            .compare_and_update_resource(resource, guard)
            .await?;
        if !saved {
            debug!("资源已被其他操作修改，放弃写入: {}", resource.key());
        }
        Ok(saved)
    }

    fn report(&self, resource: &Resource) -> Result<()> {
        if let (Some(url), Some(message)) = (&resource.callback_url, &resource.message) {
            let payload = serde_json::to_value(CallbackPayload::from(message))?;
            self.state.notifier.notify(url, payload);
        }
        Ok(())
    }

    async fn publish_settled(&self, resource: &Resource) -> Result<()> {
        self.state
            .queue
            .enqueue(Job::ResourceSettled { key: resource.key() })
            .await
    }
}
