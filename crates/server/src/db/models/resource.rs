/// 资源数据模型

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::models::{DeployType, ResourceKey, ResourceState};
use common::utils::{generate_id, occurrence_time_now};
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::spec::ResourceSpec;

/// 资源表模型，所有资源类型共用一张表
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "resources")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub deploy_type: String,
    pub uniqid: String,
    pub appkey: String,
    pub channel: String,

    // 状态机
    pub state: String,
    pub desired_state: String,
    pub attempt_times: i32,
    pub message: Option<JsonValue>,
    /// 行版本，每次写入递增
    pub version: i64,

    // 配置
    pub spec: JsonValue,
    pub superior_id: Option<String>,
    pub callback_url: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// 状态消息（最近一次结构化状态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub code: u16,
    pub kind: DeployType,
    pub uniqid: String,
    pub detail: JsonValue,
    pub timestamp: String,
}

impl StatusMessage {
    pub fn new(code: u16, kind: DeployType, uniqid: &str, detail: impl Into<JsonValue>) -> Self {
        Self {
            code,
            kind,
            uniqid: uniqid.to_string(),
            detail: detail.into(),
            timestamp: occurrence_time_now(),
        }
    }
}

/// 资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub deploy_type: DeployType,
    pub uniqid: String,
    pub appkey: String,
    pub channel: String,
    pub state: ResourceState,
    pub desired_state: ResourceState,
    pub attempt_times: i32,
    pub message: Option<StatusMessage>,
    pub version: i64,
    pub spec: ResourceSpec,
    pub superior_id: Option<String>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// 新建资源，初始为 pending -> started
    pub fn new(
        appkey: impl Into<String>,
        channel: impl Into<String>,
        uniqid: impl Into<String>,
        spec: ResourceSpec,
        superior_id: Option<String>,
        callback_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            deploy_type: spec.deploy_type(),
            uniqid: uniqid.into(),
            appkey: appkey.into(),
            channel: channel.into(),
            state: ResourceState::Pending,
            desired_state: ResourceState::Started,
            attempt_times: 0,
            message: None,
            version: 0,
            spec,
            superior_id,
            callback_url,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.deploy_type, &self.appkey, &self.channel, &self.uniqid)
    }

    /// 当前的 (state, desired_state, version)
    pub fn guard(&self) -> StateGuard {
        StateGuard {
            state: self.state,
            desired_state: self.desired_state,
            version: self.version,
        }
    }

    /// 标记一次写入：递增行版本并刷新 updated_at
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// 对外展示（轮询接口与任务项结果）
    pub fn view(&self) -> JsonValue {
        serde_json::json!({
            "id": self.id,
            "deploy_type": self.deploy_type,
            "uniqid": self.uniqid,
            "appkey": self.appkey,
            "channel": self.channel,
            "state": self.state,
            "desired_state": self.desired_state,
            "attempt_times": self.attempt_times,
            "message": self.message,
            "spec": self.spec,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }
}

/// 乐观并发检查用的快照，任何一次写入都会使旧快照失效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateGuard {
    pub state: ResourceState,
    pub desired_state: ResourceState,
    pub version: i64,
}

impl TryFrom<Model> for Resource {
    type Error = Error;

    fn try_from(model: Model) -> common::Result<Self> {
        let deploy_type = DeployType::from_str(&model.deploy_type)?;
        let spec: ResourceSpec = serde_json::from_value(model.spec)?;
        if spec.deploy_type() != deploy_type {
            return Err(Error::Internal(format!(
                "资源 {} 的配置类型与 deploy_type 不一致",
                model.id
            )));
        }

        Ok(Self {
            id: model.id,
            deploy_type,
            uniqid: model.uniqid,
            appkey: model.appkey,
            channel: model.channel,
            state: ResourceState::from_str(&model.state)?,
            desired_state: ResourceState::from_str(&model.desired_state)?,
            attempt_times: model.attempt_times,
            message: model.message.map(serde_json::from_value).transpose()?,
            version: model.version,
            spec,
            superior_id: model.superior_id,
            callback_url: model.callback_url,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}

impl TryFrom<&Resource> for ActiveModel {
    type Error = Error;

    fn try_from(resource: &Resource) -> common::Result<Self> {
        Ok(ActiveModel {
            id: Set(resource.id.clone()),
            deploy_type: Set(resource.deploy_type.as_str().to_string()),
            uniqid: Set(resource.uniqid.clone()),
            appkey: Set(resource.appkey.clone()),
            channel: Set(resource.channel.clone()),
            state: Set(resource.state.as_str().to_string()),
            desired_state: Set(resource.desired_state.as_str().to_string()),
            attempt_times: Set(resource.attempt_times),
            message: Set(resource
                .message
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?),
            version: Set(resource.version),
            spec: Set(serde_json::to_value(&resource.spec)?),
            superior_id: Set(resource.superior_id.clone()),
            callback_url: Set(resource.callback_url.clone()),
            created_at: Set(resource.created_at.into()),
            updated_at: Set(resource.updated_at.into()),
        })
    }
}

/// 创建资源请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResourceDto {
    pub appkey: String,
    pub channel: String,
    pub uniqid: String,
    pub callback_url: Option<String>,
    /// 资源类型相关字段
    #[serde(flatten)]
    pub fields: serde_json::Map<String, JsonValue>,
}

/// 租户定位参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantQuery {
    pub appkey: String,
    pub channel: String,
}
