/// 内存存储
///
/// 未配置数据库时使用，也是测试中的默认存储

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::models::{DeployType, ResourceKey};
use common::{Error, Result};
use tokio::sync::RwLock;

use super::models::resource::{Resource, StateGuard};
use super::models::task::Task;
use super::models::task_item::TaskItem;
use super::Store;

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Resource>,
    tasks: HashMap<String, Task>,
    task_items: HashMap<String, TaskItem>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_resource(&self, id: &str) -> Result<Option<Resource>> {
        Ok(self.inner.read().await.resources.get(id).cloned())
    }

    async fn find_resource(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner.resources.values().find(|r| &r.key() == key).cloned())
    }

    async fn insert_resource(&self, resource: &Resource) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = resource.key();
        if inner.resources.values().any(|r| r.key() == key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        inner.resources.insert(resource.id.clone(), resource.clone());
        Ok(())
    }

    async fn compare_and_update_resource(
        &self,
        resource: &Resource,
        expected: StateGuard,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.resources.get_mut(&resource.id) {
            Some(existing) if existing.guard() == expected => {
                *existing = resource.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_resource(&self, id: &str) -> Result<()> {
        self.inner.write().await.resources.remove(id);
        Ok(())
    }

    async fn list_resources(&self, deploy_type: DeployType) -> Result<Vec<Resource>> {
        let inner = self.inner.read().await;
        let mut resources: Vec<Resource> = inner
            .resources
            .values()
            .filter(|r| r.deploy_type == deploy_type)
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(resources)
    }

    async fn list_children(&self, superior_id: &str) -> Result<Vec<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|r| r.superior_id.as_deref() == Some(superior_id))
            .cloned()
            .collect())
    }

    async fn insert_task(&self, task: &Task, items: &[TaskItem]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.values().any(|t| {
            t.appkey == task.appkey && t.channel == task.channel && t.uniqid == task.uniqid
        }) {
            return Err(Error::AlreadyExists(format!("task {}", task.uniqid)));
        }
        for item in items {
            let key = item.key();
            let holder = inner
                .task_items
                .values()
                .filter(|held| held.key() == key)
                .filter_map(|held| inner.tasks.get(&held.task_id))
                .find(|owner| owner.is_live());
            if let Some(owner) = holder {
                return Err(Error::Locked(format!("{} 正被任务 {} 占用", key, owner.uniqid)));
            }
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        for item in items {
            inner.task_items.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn find_task(&self, appkey: &str, channel: &str, uniqid: &str) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .find(|t| t.appkey == appkey && t.channel == channel && t.uniqid == uniqid)
            .cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("任务 {}", task.id))),
        }
    }

    async fn list_live_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.values().filter(|t| t.is_live()).cloned().collect())
    }

    async fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<TaskItem> = inner
            .task_items
            .values()
            .filter(|i| i.task_id == task_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.index);
        Ok(items)
    }

    async fn update_task_item(&self, item: &TaskItem) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.task_items.get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("任务项 {}", item.id))),
        }
    }

    async fn list_items_by_key(&self, key: &ResourceKey) -> Result<Vec<TaskItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .task_items
            .values()
            .filter(|i| &i.key() == key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cluster, task};
    use common::models::{ResourceState, TaskState};

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let store = MemoryStore::new();
        store.insert_resource(&cluster("cl1")).await.unwrap();
        let err = store.insert_resource(&cluster("cl1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_compare_and_update() {
        let store = MemoryStore::new();
        let mut resource = cluster("cl1");
        store.insert_resource(&resource).await.unwrap();

        let stale = StateGuard {
            state: ResourceState::Stopped,
            desired_state: ResourceState::Started,
            version: 0,
        };
        let current = resource.guard();
        resource.state = ResourceState::Started;
        resource.touch();
        assert!(!store.compare_and_update_resource(&resource, stale).await.unwrap());

        assert!(store.compare_and_update_resource(&resource, current).await.unwrap());
        let saved = store.get_resource(&resource.id).await.unwrap().unwrap();
        assert_eq!(saved.state, ResourceState::Started);
        assert_eq!(saved.version, 1);
    }

    #[tokio::test]
    async fn test_same_state_different_version_is_stale() {
        let store = MemoryStore::new();
        let mut resource = cluster("cl1");
        store.insert_resource(&resource).await.unwrap();
        let scheduled = resource.guard();

        resource.attempt_times = 1;
        resource.touch();
        assert!(store.compare_and_update_resource(&resource, scheduled).await.unwrap());

        // 状态未变但版本已前进，旧快照不能再次写入
        resource.attempt_times = 2;
        resource.touch();
        assert!(!store.compare_and_update_resource(&resource, scheduled).await.unwrap());
        let saved = store.get_resource(&resource.id).await.unwrap().unwrap();
        assert_eq!(saved.attempt_times, 1);
    }

    #[tokio::test]
    async fn test_insert_task_claims_resource_keys() {
        let store = MemoryStore::new();
        let (first, first_items) = task("t1", "cl1");
        store.insert_task(&first, &first_items).await.unwrap();

        let (again, again_items) = task("t1", "cl9");
        let err = store.insert_task(&again, &again_items).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let (second, second_items) = task("t2", "cl1");
        let err = store.insert_task(&second, &second_items).await.unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
        assert!(store.get_task(&second.id).await.unwrap().is_none());

        let mut finished = first.clone();
        finished.state = TaskState::Started;
        store.update_task(&finished).await.unwrap();
        store.insert_task(&second, &second_items).await.unwrap();
    }
}
