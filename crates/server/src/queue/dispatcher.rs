/// 作业分发：把出队的作业交给对应服务

use async_trait::async_trait;
use common::Result;

use super::{Job, JobHandler};
use crate::app_state::AppState;
use crate::services::reconcile_service::ReconcileService;
use crate::services::task_service::TaskService;

#[derive(Clone)]
pub struct JobDispatcher {
    state: AppState,
}

impl JobDispatcher {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job {
            Job::Reconcile { resource_id, guard } => {
                ReconcileService::new(self.state.clone())
                    .reconcile(resource_id, *guard)
                    .await?;
            }
            Job::AdvanceTask { task_id } => {
                TaskService::new(self.state.clone()).advance(task_id).await?;
            }
            Job::ResourceSettled { key } => {
                TaskService::new(self.state.clone())
                    .on_resource_settled(key)
                    .await?;
            }
        }
        Ok(())
    }
}
