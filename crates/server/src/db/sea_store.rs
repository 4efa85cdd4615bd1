/// SeaORM 存储实现

use std::collections::HashSet;

use async_trait::async_trait;
use common::models::{DeployType, ResourceKey, TaskState};
use common::{Error, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, SqlErr, TransactionTrait,
};

use super::models::resource::{
    self, ActiveModel as ResourceActiveModel, Column as ResourceColumn, Entity as ResourceEntity,
    Resource, StateGuard,
};
use super::models::resource_claim::{
    self, Column as ClaimColumn, Entity as ClaimEntity,
};
use super::models::task::{
    ActiveModel as TaskActiveModel, Column as TaskColumn, Entity as TaskEntity, Task,
};
use super::models::task_item::{
    ActiveModel as TaskItemActiveModel, Column as TaskItemColumn, Entity as TaskItemEntity,
    TaskItem,
};
use super::Store;

fn db_err(err: DbErr) -> Error {
    Error::Database(err.to_string())
}

/// 唯一索引冲突转换为业务错误，其余按数据库错误处理
fn unique_err(err: DbErr, conflict: impl FnOnce() -> Error) -> Error {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => conflict(),
        _ => db_err(err),
    }
}

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn to_resources(models: Vec<resource::Model>) -> Result<Vec<Resource>> {
        models.into_iter().map(Resource::try_from).collect()
    }
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn get_resource(&self, id: &str) -> Result<Option<Resource>> {
        ResourceEntity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Resource::try_from)
            .transpose()
    }

    async fn find_resource(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        ResourceEntity::find()
            .filter(ResourceColumn::DeployType.eq(key.deploy_type.as_str()))
            .filter(ResourceColumn::Appkey.eq(&key.appkey))
            .filter(ResourceColumn::Channel.eq(&key.channel))
            .filter(ResourceColumn::Uniqid.eq(&key.uniqid))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Resource::try_from)
            .transpose()
    }

    async fn insert_resource(&self, resource: &Resource) -> Result<()> {
        ResourceActiveModel::try_from(resource)?
            .insert(&self.db)
            .await
            .map_err(|e| unique_err(e, || Error::AlreadyExists(resource.key().to_string())))?;
        Ok(())
    }

    async fn compare_and_update_resource(
        &self,
        resource: &Resource,
        expected: StateGuard,
    ) -> Result<bool> {
        let result = ResourceEntity::update_many()
            .set(ResourceActiveModel::try_from(resource)?)
            .filter(ResourceColumn::Id.eq(&resource.id))
            .filter(ResourceColumn::State.eq(expected.state.as_str()))
            .filter(ResourceColumn::DesiredState.eq(expected.desired_state.as_str()))
            .filter(ResourceColumn::Version.eq(expected.version))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected == 1)
    }

    async fn delete_resource(&self, id: &str) -> Result<()> {
        ResourceEntity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_resources(&self, deploy_type: DeployType) -> Result<Vec<Resource>> {
        let models = ResourceEntity::find()
            .filter(ResourceColumn::DeployType.eq(deploy_type.as_str()))
            .order_by_asc(ResourceColumn::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Self::to_resources(models)
    }

    async fn list_children(&self, superior_id: &str) -> Result<Vec<Resource>> {
        let models = ResourceEntity::find()
            .filter(ResourceColumn::SuperiorId.eq(superior_id))
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Self::to_resources(models)
    }

    async fn insert_task(&self, task: &Task, items: &[TaskItem]) -> Result<()> {
        // 任务、任务项、资源占用在同一事务中写入，任一冲突整体回滚
        let txn = self.db.begin().await.map_err(db_err)?;
        TaskActiveModel::try_from(task)?
            .insert(&txn)
            .await
            .map_err(|e| unique_err(e, || Error::AlreadyExists(format!("task {}", task.uniqid))))?;

        let mut claimed = HashSet::new();
        for item in items {
            TaskItemActiveModel::try_from(item)?
                .insert(&txn)
                .await
                .map_err(db_err)?;

            let key = item.key();
            if !claimed.insert(resource_claim::claim_key(&key)) {
                continue;
            }
            resource_claim::new_claim(&key, &task.id)
                .insert(&txn)
                .await
                .map_err(|e| unique_err(e, || Error::Locked(format!("{} 已被其他任务占用", key))))?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        TaskEntity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Task::try_from)
            .transpose()
    }

    async fn find_task(&self, appkey: &str, channel: &str, uniqid: &str) -> Result<Option<Task>> {
        TaskEntity::find()
            .filter(TaskColumn::Appkey.eq(appkey))
            .filter(TaskColumn::Channel.eq(channel))
            .filter(TaskColumn::Uniqid.eq(uniqid))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Task::try_from)
            .transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let txn = self.db.begin().await.map_err(db_err)?;
        TaskActiveModel::try_from(task)?
            .update(&txn)
            .await
            .map_err(db_err)?;
        if !task.is_live() {
            ClaimEntity::delete_many()
                .filter(ClaimColumn::TaskId.eq(&task.id))
                .exec(&txn)
                .await
                .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_live_tasks(&self) -> Result<Vec<Task>> {
        let models = TaskEntity::find()
            .filter(TaskColumn::State.ne(TaskState::Failed.as_str()))
            .order_by_asc(TaskColumn::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;

        let mut tasks = Vec::with_capacity(models.len());
        for model in models {
            let task = Task::try_from(model)?;
            if task.is_live() {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>> {
        TaskItemEntity::find()
            .filter(TaskItemColumn::TaskId.eq(task_id))
            .order_by_asc(TaskItemColumn::Index)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(TaskItem::try_from)
            .collect()
    }

    async fn update_task_item(&self, item: &TaskItem) -> Result<()> {
        TaskItemActiveModel::try_from(item)?
            .update(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_items_by_key(&self, key: &ResourceKey) -> Result<Vec<TaskItem>> {
        TaskItemEntity::find()
            .filter(TaskItemColumn::DeployType.eq(key.deploy_type.as_str()))
            .filter(TaskItemColumn::Appkey.eq(&key.appkey))
            .filter(TaskItemColumn::Channel.eq(&key.channel))
            .filter(TaskItemColumn::Uniqid.eq(&key.uniqid))
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(TaskItem::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sync_schema;
    use crate::test_support::{cluster, task};
    use common::models::ResourceState;
    use sea_orm::{ConnectOptions, Database};

    async fn store() -> SeaOrmStore {
        // 内存库只存在于单个连接上
        let mut options = ConnectOptions::new("sqlite::memory:");
        options
            .max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let db = Database::connect(options).await.unwrap();
        sync_schema(&db).await.unwrap();
        SeaOrmStore::new(db)
    }

    #[tokio::test]
    async fn test_sync_schema_is_idempotent() {
        let store = store().await;
        sync_schema(&store.db).await.unwrap();
        assert!(store.list_live_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resource_key_is_unique() {
        let store = store().await;
        let resource = cluster("cl1");
        store.insert_resource(&resource).await.unwrap();

        let found = store.find_resource(&resource.key()).await.unwrap().unwrap();
        assert_eq!(found.id, resource.id);
        assert_eq!(found.spec, resource.spec);
        assert_eq!(found.version, 0);

        let err = store.insert_resource(&cluster("cl1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(store.list_resources(DeployType::Cluster).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_guarded_update_checks_version() {
        let store = store().await;
        let mut resource = cluster("cl1");
        store.insert_resource(&resource).await.unwrap();
        let scheduled = resource.guard();

        resource.attempt_times = 1;
        resource.touch();
        assert!(store.compare_and_update_resource(&resource, scheduled).await.unwrap());

        let mut late = resource.clone();
        late.state = ResourceState::Failed;
        late.touch();
        assert!(!store.compare_and_update_resource(&late, scheduled).await.unwrap());

        let saved = store.get_resource(&resource.id).await.unwrap().unwrap();
        assert_eq!(saved.state, ResourceState::Pending);
        assert_eq!(saved.attempt_times, 1);
        assert_eq!(saved.version, 1);
    }

    #[tokio::test]
    async fn test_task_insert_is_atomic_and_claims_keys() {
        let store = store().await;
        let (first, first_items) = task("t1", "cl1");
        store.insert_task(&first, &first_items).await.unwrap();
        assert_eq!(store.list_task_items(&first.id).await.unwrap().len(), 1);

        let (again, again_items) = task("t1", "cl9");
        let err = store.insert_task(&again, &again_items).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let (second, second_items) = task("t2", "cl1");
        let err = store.insert_task(&second, &second_items).await.unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
        assert!(store.get_task(&second.id).await.unwrap().is_none());
        assert!(store.list_task_items(&second.id).await.unwrap().is_empty());

        let live = store.list_live_tasks().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, first.id);

        let mut finished = first.clone();
        finished.state = TaskState::Started;
        store.update_task(&finished).await.unwrap();
        assert!(store.list_live_tasks().await.unwrap().is_empty());

        store.insert_task(&second, &second_items).await.unwrap();
        let items = store
            .list_items_by_key(&second_items[0].key())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }
}
