/// 定时巡检
///
/// 每种资源类型一个定时器，周期性地为该类型的全部资源重新投递收敛作业；
/// 另有一个定时器推进所有仍在执行的任务。用于兜底丢失的作业和发现漂移。

use std::time::Duration;

use common::models::DeployType;
use common::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app_state::AppState;
use crate::queue::Job;

pub struct SweepService {
    state: AppState,
}

impl SweepService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 为某类型的全部资源投递收敛作业，返回投递数量
    pub async fn sweep_resources(&self, deploy_type: DeployType) -> Result<usize> {
        let resources = self.state.store.list_resources(deploy_type).await?;
        for resource in &resources {
            self.state.queue.enqueue(Job::reconcile(resource)).await?;
        }
        Ok(resources.len())
    }

    /// 为全部执行中的任务投递推进作业
    pub async fn sweep_tasks(&self) -> Result<usize> {
        let tasks = self.state.store.list_live_tasks().await?;
        for task in &tasks {
            self.state
                .queue
                .enqueue(Job::AdvanceTask {
                    task_id: task.id.clone(),
                })
                .await?;
        }
        Ok(tasks.len())
    }

    /// 启动全部定时器
    pub fn start(
        state: AppState,
        resource_interval_secs: u64,
        task_interval_secs: u64,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = DeployType::ALL
            .into_iter()
            .map(|deploy_type| {
                Self::start_resource_sweeper(
                    state.clone(),
                    deploy_type,
                    resource_interval_secs,
                    cancel.clone(),
                )
            })
            .collect();
        handles.push(Self::start_task_sweeper(state, task_interval_secs, cancel));

        info!(
            "定时巡检已启动：资源每 {} 秒，任务每 {} 秒",
            resource_interval_secs, task_interval_secs
        );
        handles
    }

    fn start_resource_sweeper(
        state: AppState,
        deploy_type: DeployType,
        interval_secs: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match SweepService::new(state.clone()).sweep_resources(deploy_type).await {
                    Ok(0) => {}
                    Ok(count) => debug!("巡检 {}: 已投递 {} 个收敛作业", deploy_type, count),
                    Err(e) => error!("巡检 {} 失败: {}", deploy_type, e),
                }
            }
        })
    }

    fn start_task_sweeper(state: AppState, interval_secs: u64, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match SweepService::new(state.clone()).sweep_tasks().await {
                    Ok(0) => {}
                    Ok(count) => debug!("任务巡检: 已投递 {} 个推进作业", count),
                    Err(e) => error!("任务巡检失败: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestContext;

    #[tokio::test]
    async fn test_sweep_enqueues_every_resource_of_kind() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        ctx.queue.clear();

        let sweeper = SweepService::new(ctx.state.clone());
        assert_eq!(sweeper.sweep_resources(DeployType::Namespace).await.unwrap(), 1);
        assert_eq!(sweeper.sweep_resources(DeployType::Redis).await.unwrap(), 0);
        assert!(matches!(ctx.queue.jobs()[0], Job::Reconcile { .. }));
    }

    #[tokio::test]
    async fn test_sweepers_stop_on_cancel() {
        let ctx = TestContext::new();
        let cancel = CancellationToken::new();
        let handles = SweepService::start(ctx.state.clone(), 3600, 3600, cancel.clone());
        assert_eq!(handles.len(), DeployType::ALL.len() + 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
