/// 任务项数据模型

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::models::{Action, DeployType, ResourceKey, TaskItemState};
use common::utils::generate_id;
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::task::TaskOperation;

/// 任务项模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "task_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub task_id: String,
    pub index: i32,

    // 资源弱引用 (deploy_type, appkey, channel, uniqid)
    pub deploy_type: String,
    pub uniqid: String,
    pub appkey: String,
    pub channel: String,

    pub action: String,
    pub data: JsonValue,
    pub state: String,
    pub desired_state: String,
    pub message: Option<JsonValue>,
    pub return_data: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::task::Entity",
        from = "Column::TaskId",
        to = "super::task::Column::Id"
    )]
    Task,
}

impl Related<super::task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Task.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// 任务项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub task_id: String,
    pub index: usize,
    pub deploy_type: DeployType,
    pub uniqid: String,
    pub appkey: String,
    pub channel: String,
    pub action: Action,
    pub data: TaskOperation,
    pub state: TaskItemState,
    pub desired_state: TaskItemState,
    pub message: Option<JsonValue>,
    pub return_data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskItem {
    /// 由操作生成任务项，租户字段缺省继承任务
    pub fn new(task_id: &str, index: usize, op: &TaskOperation, appkey: &str, channel: &str) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            task_id: task_id.to_string(),
            index,
            deploy_type: op.deploy_type,
            uniqid: op.uniqid.clone(),
            appkey: op.appkey.clone().unwrap_or_else(|| appkey.to_string()),
            channel: op.channel.clone().unwrap_or_else(|| channel.to_string()),
            action: op.action,
            data: op.clone(),
            state: TaskItemState::Waiting,
            desired_state: op.action.done_state(),
            message: None,
            return_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.deploy_type, &self.appkey, &self.channel, &self.uniqid)
    }

    pub fn is_done(&self) -> bool {
        self.state == self.desired_state
    }

    /// 聚合视图中的一行
    pub fn view(&self) -> JsonValue {
        serde_json::json!({
            "index": self.index,
            "deploy_type": self.deploy_type,
            "uniqid": self.uniqid,
            "action": self.action,
            "state": self.state,
            "desired_state": self.desired_state,
            "message": self.message,
            "return_data": self.return_data,
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl TryFrom<Model> for TaskItem {
    type Error = Error;

    fn try_from(model: Model) -> common::Result<Self> {
        Ok(Self {
            id: model.id,
            task_id: model.task_id,
            index: usize::try_from(model.index)
                .map_err(|_| Error::Internal(format!("任务项下标无效: {}", model.index)))?,
            deploy_type: DeployType::from_str(&model.deploy_type)?,
            uniqid: model.uniqid,
            appkey: model.appkey,
            channel: model.channel,
            action: Action::from_str(&model.action)?,
            data: serde_json::from_value(model.data)?,
            state: TaskItemState::from_str(&model.state)?,
            desired_state: TaskItemState::from_str(&model.desired_state)?,
            message: model.message,
            return_data: model.return_data,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}

impl TryFrom<&TaskItem> for ActiveModel {
    type Error = Error;

    fn try_from(item: &TaskItem) -> common::Result<Self> {
        Ok(ActiveModel {
            id: Set(item.id.clone()),
            task_id: Set(item.task_id.clone()),
            index: Set(item.index as i32),
            deploy_type: Set(item.deploy_type.as_str().to_string()),
            uniqid: Set(item.uniqid.clone()),
            appkey: Set(item.appkey.clone()),
            channel: Set(item.channel.clone()),
            action: Set(item.action.as_str().to_string()),
            data: Set(serde_json::to_value(&item.data)?),
            state: Set(item.state.as_str().to_string()),
            desired_state: Set(item.desired_state.as_str().to_string()),
            message: Set(item.message.clone()),
            return_data: Set(item.return_data.clone()),
            created_at: Set(item.created_at.into()),
            updated_at: Set(item.updated_at.into()),
        })
    }
}
