/// 任务数据模型

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::models::{Action, DeployType, TaskState};
use common::utils::generate_id;
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

/// 任务模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub uniqid: String,
    pub appkey: String,
    pub channel: String,

    // 原始操作列表
    pub tasks: JsonValue,
    pub report_level: i32,
    pub rollback_on_failure: bool,
    pub callback_url: Option<String>,

    // 状态机
    pub attempt_times: i32,
    pub state: String,
    pub desired_state: String,

    // 时间与聚合视图
    pub times: JsonValue,
    pub return_data: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::task_item::Entity")]
    TaskItem,
}

impl Related<super::task_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TaskItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// 回调级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ReportLevel {
    /// 只在任务结束时回调
    Task = 1,
    /// 每个任务项状态变化都回调
    Item = 2,
}

impl Default for ReportLevel {
    fn default() -> Self {
        ReportLevel::Item
    }
}

impl TryFrom<i32> for ReportLevel {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(ReportLevel::Task),
            2 => Ok(ReportLevel::Item),
            other => Err(format!("report_level 只能为 1 或 2，实际为 {}", other)),
        }
    }
}

impl From<ReportLevel> for i32 {
    fn from(level: ReportLevel) -> Self {
        level as i32
    }
}

/// 任务时间线
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTimes {
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reported_at: Option<DateTime<Utc>>,
}

/// 任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub uniqid: String,
    pub appkey: String,
    pub channel: String,
    pub tasks: Vec<TaskOperation>,
    pub report_level: ReportLevel,
    /// 已解析但不生效：失败时不做回滚
    pub rollback_on_failure: bool,
    pub callback_url: Option<String>,
    pub attempt_times: i32,
    pub state: TaskState,
    pub desired_state: TaskState,
    pub times: TaskTimes,
    pub return_data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_submission(submission: &TaskSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            uniqid: submission.uniqid.clone(),
            appkey: submission.appkey.clone(),
            channel: submission.channel.clone(),
            tasks: submission.tasks.clone(),
            report_level: submission.report_level.unwrap_or_default(),
            rollback_on_failure: submission.rollback_on_failure,
            callback_url: submission.callback_url.clone(),
            attempt_times: 0,
            state: TaskState::Pending,
            desired_state: TaskState::Started,
            times: TaskTimes {
                submitted_at: Some(now),
                ..Default::default()
            },
            return_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        TaskState::is_live(self.state, self.desired_state)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl TryFrom<Model> for Task {
    type Error = Error;

    fn try_from(model: Model) -> common::Result<Self> {
        Ok(Self {
            id: model.id,
            uniqid: model.uniqid,
            appkey: model.appkey,
            channel: model.channel,
            tasks: serde_json::from_value(model.tasks)?,
            report_level: ReportLevel::try_from(model.report_level).map_err(Error::Internal)?,
            rollback_on_failure: model.rollback_on_failure,
            callback_url: model.callback_url,
            attempt_times: model.attempt_times,
            state: TaskState::from_str(&model.state)?,
            desired_state: TaskState::from_str(&model.desired_state)?,
            times: serde_json::from_value(model.times)?,
            return_data: model.return_data,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}

impl TryFrom<&Task> for ActiveModel {
    type Error = Error;

    fn try_from(task: &Task) -> common::Result<Self> {
        Ok(ActiveModel {
            id: Set(task.id.clone()),
            uniqid: Set(task.uniqid.clone()),
            appkey: Set(task.appkey.clone()),
            channel: Set(task.channel.clone()),
            tasks: Set(serde_json::to_value(&task.tasks)?),
            report_level: Set(task.report_level.into()),
            rollback_on_failure: Set(task.rollback_on_failure),
            callback_url: Set(task.callback_url.clone()),
            attempt_times: Set(task.attempt_times),
            state: Set(task.state.as_str().to_string()),
            desired_state: Set(task.desired_state.as_str().to_string()),
            times: Set(serde_json::to_value(&task.times)?),
            return_data: Set(task.return_data.clone()),
            created_at: Set(task.created_at.into()),
            updated_at: Set(task.updated_at.into()),
        })
    }
}

/// 链接声明：把其他资源的连接信息注入为环境变量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Link {
    #[validate(length(min = 1))]
    pub uniqid: String,
    pub deploy_type: DeployType,
    #[validate(length(min = 1, max = 32))]
    pub alias: String,
}

/// 任务中的单个操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TaskOperation {
    pub deploy_type: DeployType,
    #[validate(length(min = 1, max = 64))]
    pub uniqid: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    /// 资源类型相关字段
    #[serde(flatten)]
    pub fields: serde_json::Map<String, JsonValue>,
}

impl TaskOperation {
    pub fn fields_value(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TaskSubmission {
    #[validate(length(min = 1))]
    pub appkey: String,
    #[validate(length(min = 1))]
    pub channel: String,
    #[validate(length(min = 1, max = 64))]
    pub uniqid: String,
    #[validate(length(min = 1, max = 100))]
    pub tasks: Vec<TaskOperation>,
    #[serde(default)]
    pub report_level: Option<ReportLevel>,
    #[validate(url)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub rollback_on_failure: bool,
}

/// 任务提交响应
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub id: String,
    pub uniqid: String,
    pub state: TaskState,
}

impl From<&Task> for TaskAccepted {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            uniqid: task.uniqid.clone(),
            state: task.state,
        }
    }
}
