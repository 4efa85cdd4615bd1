/// 数据库访问层
///
/// 引擎与编排器只通过 [`Store`] 读写资源、任务、任务项，
/// 不持有数据库连接等全局状态

pub mod memory;
pub mod models;
pub mod sea_store;

use async_trait::async_trait;
use common::models::{DeployType, ResourceKey};
use common::Result;
use sea_orm::sea_query::Index;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use tracing::info;

use self::models::resource::{Column as ResourceColumn, Resource, StateGuard};
use self::models::task::{Column as TaskColumn, Task};
use self::models::task_item::TaskItem;

pub use memory::MemoryStore;
pub use sea_store::SeaOrmStore;

/// 持久化接口
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// 按 ID 读取资源
    async fn get_resource(&self, id: &str) -> Result<Option<Resource>>;

    /// 按弱引用键读取资源
    async fn find_resource(&self, key: &ResourceKey) -> Result<Option<Resource>>;

    /// 插入资源，键重复时返回 AlreadyExists
    async fn insert_resource(&self, resource: &Resource) -> Result<()>;

    /// 仅当库中 (state, desired_state, version) 仍等于 expected 时更新，返回是否写入
    async fn compare_and_update_resource(
        &self,
        resource: &Resource,
        expected: StateGuard,
    ) -> Result<bool>;

    async fn delete_resource(&self, id: &str) -> Result<()>;

    /// 列出某类型的全部资源
    async fn list_resources(&self, deploy_type: DeployType) -> Result<Vec<Resource>>;

    /// 列出以 superior_id 为主上级的资源
    async fn list_children(&self, superior_id: &str) -> Result<Vec<Resource>>;

    /// 原子地插入任务及其全部任务项
    ///
    /// uniqid 重复返回 AlreadyExists；任一资源键已被活跃任务占用返回 Locked
    async fn insert_task(&self, task: &Task, items: &[TaskItem]) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn find_task(&self, appkey: &str, channel: &str, uniqid: &str) -> Result<Option<Task>>;

    /// 更新任务，任务结束时一并释放其占用的资源键
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// 仍在执行中的任务
    async fn list_live_tasks(&self) -> Result<Vec<Task>>;

    /// 按 index 升序返回任务项
    async fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>>;

    async fn update_task_item(&self, item: &TaskItem) -> Result<()>;

    /// 引用某资源键的全部任务项
    async fn list_items_by_key(&self, key: &ResourceKey) -> Result<Vec<TaskItem>>;
}

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    info!("正在连接数据库: {}", database_url);

    let db = Database::connect(database_url).await?;
    info!("数据库连接成功");

    Ok(db)
}

/// 根据实体定义建表（已存在则跳过）
pub async fn sync_schema(db: &DatabaseConnection) -> anyhow::Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut resources = schema.create_table_from_entity(models::resource::Entity);
    let mut tasks = schema.create_table_from_entity(models::task::Entity);
    let mut task_items = schema.create_table_from_entity(models::task_item::Entity);
    let mut claims = schema.create_table_from_entity(models::resource_claim::Entity);

    for stmt in [
        resources.if_not_exists(),
        tasks.if_not_exists(),
        task_items.if_not_exists(),
        claims.if_not_exists(),
    ] {
        db.execute(backend.build(&*stmt)).await?;
    }

    let indexes = [
        Index::create()
            .name("uk_resources_key")
            .table(models::resource::Entity)
            .col(ResourceColumn::DeployType)
            .col(ResourceColumn::Appkey)
            .col(ResourceColumn::Channel)
            .col(ResourceColumn::Uniqid)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("uk_tasks_key")
            .table(models::task::Entity)
            .col(TaskColumn::Appkey)
            .col(TaskColumn::Channel)
            .col(TaskColumn::Uniqid)
            .unique()
            .if_not_exists()
            .to_owned(),
    ];
    for stmt in indexes {
        db.execute(backend.build(&stmt)).await?;
    }

    info!("数据表结构已同步");
    Ok(())
}
