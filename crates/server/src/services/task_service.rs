/// 任务编排服务
///
/// 一个任务拆成按 index 排序的任务项，同一时刻最多一个任务项处于 pending，
/// 前一项结束后才启动下一项；任一项失败即终止整个任务（不回滚）。

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use common::models::{Action, ResourceKey, ResourceState, TaskItemState, TaskState};
use common::{Error, Result};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::db::models::resource::{CreateResourceDto, Resource};
use crate::db::models::task::{ReportLevel, Task, TaskSubmission};
use crate::db::models::task_item::TaskItem;
use crate::queue::Job;
use crate::services::callback_service::CallbackPayload;
use crate::services::dependency_service::DependencyService;
use crate::services::resource_service::ResourceService;

/// 任务项进展
enum ItemProgress {
    Done(JsonValue),
    Waiting,
    Failed(String),
}

/// 任务的聚合视图
fn aggregate(task: &Task, items: &[TaskItem]) -> JsonValue {
    json!({
        "id": task.id,
        "uniqid": task.uniqid,
        "appkey": task.appkey,
        "channel": task.channel,
        "state": task.state,
        "desired_state": task.desired_state,
        "attempt_times": task.attempt_times,
        "times": task.times,
        "items": items.iter().map(TaskItem::view).collect::<Vec<_>>(),
    })
}

fn failure_reason(resource: &Resource) -> String {
    match &resource.message {
        Some(message) => format!("{} 失败: {}", resource.key(), message.detail),
        None => format!("{} 失败", resource.key()),
    }
}

pub struct TaskService {
    state: AppState,
}

impl TaskService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 受理任务：校验、单飞检查、依赖解析通过后原子写入
    pub async fn submit(&self, submission: TaskSubmission) -> Result<Task> {
        submission
            .validate()
            .map_err(|e| Error::InvalidArgument(format!("任务参数无效: {}", e)))?;

        let store = &self.state.store;
        if store
            .find_task(&submission.appkey, &submission.channel, &submission.uniqid)
            .await?
            .is_some()
        {
            return Err(Error::AlreadyExists(format!("task {}", submission.uniqid)));
        }

        self.check_single_flight(&submission).await?;
        DependencyService::new(self.state.clone())
            .validate_batch(&submission.appkey, &submission.channel, &submission.tasks)
            .await?;

        let mut task = Task::from_submission(&submission);
        let items: Vec<TaskItem> = submission
            .tasks
            .iter()
            .enumerate()
            .map(|(index, op)| {
                TaskItem::new(&task.id, index, op, &submission.appkey, &submission.channel)
            })
            .collect();
        task.return_data = Some(aggregate(&task, &items));

        store.insert_task(&task, &items).await?;
        self.state
            .queue
            .enqueue(Job::AdvanceTask {
                task_id: task.id.clone(),
            })
            .await?;

        info!(
            "任务已受理: {} (id={}, {} 项)",
            task.uniqid,
            task.id,
            items.len()
        );
        Ok(task)
    }

    /// 同一资源键上不允许存在两个执行中的任务（写入时存储层在同一原子操作内再次检查）
    async fn check_single_flight(&self, submission: &TaskSubmission) -> Result<()> {
        let mut checked = HashSet::new();
        let mut conflicts = Vec::new();

        for op in &submission.tasks {
            let key = ResourceKey::new(
                op.deploy_type,
                op.appkey.as_deref().unwrap_or(&submission.appkey),
                op.channel.as_deref().unwrap_or(&submission.channel),
                &op.uniqid,
            );
            if !checked.insert(key.clone()) {
                continue;
            }

            for item in self.state.store.list_items_by_key(&key).await? {
                let owner = self.state.store.get_task(&item.task_id).await?;
                if let Some(owner) = owner.filter(Task::is_live) {
                    conflicts.push(format!("{} 正被任务 {} 占用", key, owner.uniqid));
                    break;
                }
            }
        }

        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(Error::Locked(conflicts.join("; ")))
        }
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.state
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// 停止任务：不再启动后续任务项，已启动的资源继续自行收敛
    pub async fn stop(&self, task_id: &str) -> Result<Task> {
        let mut task = self.get(task_id).await?;
        if !task.is_live() {
            return Err(Error::InvalidArgument(format!("任务 {} 已结束", task.uniqid)));
        }

        task.desired_state = TaskState::Stopped;
        task.touch();
        self.state.store.update_task(&task).await?;
        self.state
            .queue
            .enqueue(Job::AdvanceTask {
                task_id: task.id.clone(),
            })
            .await?;

        info!("任务停止中: {} (id={})", task.uniqid, task.id);
        Ok(task)
    }

    /// 资源状态变化后，推进引用它的 pending 任务项所在的任务
    pub async fn on_resource_settled(&self, key: &ResourceKey) -> Result<()> {
        let task_ids: BTreeSet<String> = self
            .state
            .store
            .list_items_by_key(key)
            .await?
            .into_iter()
            .filter(|item| item.state == TaskItemState::Pending)
            .map(|item| item.task_id)
            .collect();

        for task_id in task_ids {
            debug!("资源 {} 已变化，推进任务 {}", key, task_id);
            self.state.queue.enqueue(Job::AdvanceTask { task_id }).await?;
        }
        Ok(())
    }

    /// 推进任务
    pub async fn advance(&self, task_id: &str) -> Result<()> {
        let Some(mut task) = self.state.store.get_task(task_id).await? else {
            debug!("任务不存在，忽略: {}", task_id);
            return Ok(());
        };
        if !task.is_live() {
            return Ok(());
        }
        let mut items = self.state.store.list_task_items(task_id).await?;

        if task.desired_state == TaskState::Stopped {
            task.state = TaskState::Stopped;
            info!("任务已停止: {} (id={})", task.uniqid, task.id);
            return self.finish(task, &items).await;
        }

        for index in 0..items.len() {
            if items[index].is_done() {
                continue;
            }

            let progress = match items[index].state {
                TaskItemState::Failed => ItemProgress::Failed(format!("第 {} 项失败", index)),
                TaskItemState::Pending => self.check_pending(&items[index]).await?,
                _ if items[index].action == Action::Query => self.query(&items[index]).await?,
                _ => return self.start_item(task, items, index).await,
            };

            match progress {
                ItemProgress::Done(view) => {
                    self.complete_item(&task, &mut items[index], view).await?;
                }
                ItemProgress::Waiting => return Ok(()),
                ItemProgress::Failed(reason) => {
                    if items[index].state != TaskItemState::Failed {
                        self.fail_item(&task, &mut items[index], &reason).await?;
                    }
                    return self.fail(task, &items, reason).await;
                }
            }
        }

        task.state = task.desired_state;
        task.times.completed_at = Some(Utc::now());
        info!("任务已完成: {} (id={})", task.uniqid, task.id);
        self.finish(task, &items).await
    }

    /// pending 任务项：按弱引用键查看资源是否到达目标
    async fn check_pending(&self, item: &TaskItem) -> Result<ItemProgress> {
        let resource = self.state.store.find_resource(&item.key()).await?;
        Ok(match resource {
            None if item.action == Action::Delete => ItemProgress::Done(json!({
                "deploy_type": item.deploy_type,
                "uniqid": item.uniqid,
                "state": ResourceState::Destroyed,
            })),
            None => ItemProgress::Failed(format!("{} 已不存在", item.key())),
            Some(r) if r.state == ResourceState::Failed => ItemProgress::Failed(failure_reason(&r)),
            Some(r) if item.action != Action::Delete && r.state == r.desired_state => {
                ItemProgress::Done(r.view())
            }
            Some(_) => ItemProgress::Waiting,
        })
    }

    async fn query(&self, item: &TaskItem) -> Result<ItemProgress> {
        Ok(match self.state.store.find_resource(&item.key()).await? {
            Some(resource) => ItemProgress::Done(resource.view()),
            None => ItemProgress::Failed(format!("{} is not existed", item.key())),
        })
    }

    /// 启动任务项：调用对应的资源控制器
    async fn start_item(&self, mut task: Task, mut items: Vec<TaskItem>, index: usize) -> Result<()> {
        match self.invoke_controller(&items[index]).await {
            Ok(resource) => {
                let item = &mut items[index];
                item.state = TaskItemState::Pending;
                item.message = None;
                item.return_data = Some(resource.view());
                item.touch();
                self.state.store.update_task_item(item).await?;

                task.attempt_times = 0;
                task.return_data = Some(aggregate(&task, &items));
                task.touch();
                self.state.store.update_task(&task).await?;

                info!(
                    "任务项已启动: task={}, index={}, {} {} {}",
                    task.id, index, items[index].action, items[index].deploy_type, items[index].uniqid
                );
                self.report_item(&task, &items[index])
            }
            Err(e) => {
                task.attempt_times += 1;
                warn!(
                    "任务项启动失败 ({}/{}): task={}, index={}: {}",
                    task.attempt_times, self.state.engine.max_attempt_times, task.id, index, e
                );

                if task.attempt_times >= self.state.engine.max_attempt_times {
                    let reason = e.to_string();
                    self.fail_item(&task, &mut items[index], &reason).await?;
                    return self.fail(task, &items, reason).await;
                }
                task.touch();
                self.state.store.update_task(&task).await
            }
        }
    }

    async fn invoke_controller(&self, item: &TaskItem) -> Result<Resource> {
        let controller = ResourceService::new(self.state.clone());
        let key = item.key();

        match item.action {
            Action::Create | Action::Update => {
                let mut fields = item.data.fields.clone();
                DependencyService::new(self.state.clone())
                    .inject_links(&item.appkey, &item.channel, &item.data.links, &mut fields)
                    .await?;

                if item.action == Action::Create {
                    let dto = CreateResourceDto {
                        appkey: item.appkey.clone(),
                        channel: item.channel.clone(),
                        uniqid: item.uniqid.clone(),
                        callback_url: None,
                        fields,
                    };
                    controller.create(item.deploy_type, dto).await
                } else {
                    controller.update(&key, &JsonValue::Object(fields)).await
                }
            }
            Action::Start => controller.start(&key).await,
            Action::Stop => controller.stop(&key).await,
            Action::Delete => controller.destroy(&key).await,
            Action::Query => controller.get(&key).await,
        }
    }

    async fn complete_item(&self, task: &Task, item: &mut TaskItem, view: JsonValue) -> Result<()> {
        item.state = item.desired_state;
        item.return_data = Some(view);
        item.message = None;
        item.touch();
        self.state.store.update_task_item(item).await?;

        self.state
            .metrics
            .task_items
            .with_label_values(&[item.action.as_str(), "done"])
            .inc();
        info!(
            "任务项已完成: task={}, index={}, state={}",
            task.id, item.index, item.state
        );
        self.report_item(task, item)
    }

    async fn fail_item(&self, task: &Task, item: &mut TaskItem, reason: &str) -> Result<()> {
        item.state = TaskItemState::Failed;
        item.message = Some(json!({"error": reason}));
        item.touch();
        self.state.store.update_task_item(item).await?;

        self.state
            .metrics
            .task_items
            .with_label_values(&[item.action.as_str(), "failed"])
            .inc();
        warn!(
            "任务项失败: task={}, index={}: {}",
            task.id, item.index, reason
        );
        self.report_item(task, item)
    }

    async fn fail(&self, mut task: Task, items: &[TaskItem], reason: String) -> Result<()> {
        task.state = TaskState::Failed;
        task.times.completed_at = Some(Utc::now());
        warn!("任务失败: {} (id={}): {}", task.uniqid, task.id, reason);
        self.finish(task, items).await
    }

    /// 写入最终状态并发送整体回调
    async fn finish(&self, mut task: Task, items: &[TaskItem]) -> Result<()> {
        if task.callback_url.is_some() {
            task.times.reported_at = Some(Utc::now());
        }
        let view = aggregate(&task, items);
        task.return_data = Some(view.clone());
        task.touch();
        self.state.store.update_task(&task).await?;

        if let Some(url) = &task.callback_url {
            let mut body = view;
            body["code"] = json!(if task.state == TaskState::Failed { 500 } else { 200 });
            self.state.notifier.notify(url, body);
        }
        Ok(())
    }

    /// 单个任务项的回调，仅在 report_level = 2 时发送
    fn report_item(&self, task: &Task, item: &TaskItem) -> Result<()> {
        if task.report_level != ReportLevel::Item {
            return Ok(());
        }
        let Some(url) = &task.callback_url else {
            return Ok(());
        };

        let code = match item.state {
            TaskItemState::Failed => 500,
            _ if item.is_done() => 200,
            _ => 202,
        };
        let payload = CallbackPayload::new(
            code,
            item.deploy_type,
            &item.uniqid,
            json!({
                "task_id": task.id,
                "task_uniqid": task.uniqid,
                "index": item.index,
                "action": item.action,
                "state": item.state,
                "return_data": item.return_data,
            }),
        );
        self.state.notifier.notify(url, serde_json::to_value(payload)?);
        Ok(())
    }
}
