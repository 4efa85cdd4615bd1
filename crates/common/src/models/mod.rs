/// 共享数据模型
/// 
/// 定义资源、任务、任务项的状态机与资源类型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// 资源状态
///
/// `state` 记录最近一次确认的状态，`desired_state` 记录客户端请求的目标状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Pending,
    Started,
    Restarted,
    Stopped,
    Destroyed,
    Failed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Pending => "pending",
            ResourceState::Started => "started",
            ResourceState::Restarted => "restarted",
            ResourceState::Stopped => "stopped",
            ResourceState::Destroyed => "destroyed",
            ResourceState::Failed => "failed",
        }
    }

    /// 稳定终态：到达后只做漂移检测
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            ResourceState::Started | ResourceState::Restarted | ResourceState::Stopped
        )
    }

    /// 运行态（started/restarted）
    pub fn is_running(&self) -> bool {
        matches!(self, ResourceState::Started | ResourceState::Restarted)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResourceState::Pending),
            "started" => Ok(ResourceState::Started),
            "restarted" => Ok(ResourceState::Restarted),
            "stopped" => Ok(ResourceState::Stopped),
            "destroyed" => Ok(ResourceState::Destroyed),
            "failed" => Ok(ResourceState::Failed),
            other => Err(Error::InvalidArgument(format!("未知资源状态: {}", other))),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Started,
    Stopped,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Started => "started",
            TaskState::Stopped => "stopped",
            TaskState::Failed => "failed",
        }
    }

    /// 任务是否仍持有对资源的占用
    pub fn is_live(state: TaskState, desired_state: TaskState) -> bool {
        state != desired_state && state != TaskState::Failed
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "started" => Ok(TaskState::Started),
            "stopped" => Ok(TaskState::Stopped),
            "failed" => Ok(TaskState::Failed),
            other => Err(Error::InvalidArgument(format!("未知任务状态: {}", other))),
        }
    }
}

/// 任务项状态：waiting -> pending -> {与动作对应的完成态 | failed}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskItemState {
    Waiting,
    Pending,
    Created,
    Updated,
    Started,
    Stopped,
    Deleted,
    Queried,
    Failed,
}

impl TaskItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskItemState::Waiting => "waiting",
            TaskItemState::Pending => "pending",
            TaskItemState::Created => "created",
            TaskItemState::Updated => "updated",
            TaskItemState::Started => "started",
            TaskItemState::Stopped => "stopped",
            TaskItemState::Deleted => "deleted",
            TaskItemState::Queried => "queried",
            TaskItemState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskItemState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskItemState::Waiting),
            "pending" => Ok(TaskItemState::Pending),
            "created" => Ok(TaskItemState::Created),
            "updated" => Ok(TaskItemState::Updated),
            "started" => Ok(TaskItemState::Started),
            "stopped" => Ok(TaskItemState::Stopped),
            "deleted" => Ok(TaskItemState::Deleted),
            "queried" => Ok(TaskItemState::Queried),
            "failed" => Ok(TaskItemState::Failed),
            other => Err(Error::InvalidArgument(format!("未知任务项状态: {}", other))),
        }
    }
}

/// 任务项动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Start,
    Stop,
    Delete,
    Query,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Delete => "delete",
            Action::Query => "query",
        }
    }

    /// 任务项完成时的状态
    pub fn done_state(&self) -> TaskItemState {
        match self {
            Action::Create => TaskItemState::Created,
            Action::Update => TaskItemState::Updated,
            Action::Start => TaskItemState::Started,
            Action::Stop => TaskItemState::Stopped,
            Action::Delete => TaskItemState::Deleted,
            Action::Query => TaskItemState::Queried,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "delete" => Ok(Action::Delete),
            "query" => Ok(Action::Query),
            other => Err(Error::InvalidArgument(format!("未知动作: {}", other))),
        }
    }
}

/// 资源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DeployType {
    Cluster,
    Namespace,
    Deployment,
    Workspace,
    ModelConfig,
    Mysql,
    MysqlDatabase,
    Mongodb,
    MongodbDatabase,
    Redis,
    Memcached,
    Rabbitmq,
    DataMigration,
}

impl DeployType {
    pub const ALL: [DeployType; 13] = [
        DeployType::Cluster,
        DeployType::Namespace,
        DeployType::Deployment,
        DeployType::Workspace,
        DeployType::ModelConfig,
        DeployType::Mysql,
        DeployType::MysqlDatabase,
        DeployType::Mongodb,
        DeployType::MongodbDatabase,
        DeployType::Redis,
        DeployType::Memcached,
        DeployType::Rabbitmq,
        DeployType::DataMigration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployType::Cluster => "cluster",
            DeployType::Namespace => "namespace",
            DeployType::Deployment => "deployment",
            DeployType::Workspace => "workspace",
            DeployType::ModelConfig => "model_config",
            DeployType::Mysql => "mysql",
            DeployType::MysqlDatabase => "mysql_database",
            DeployType::Mongodb => "mongodb",
            DeployType::MongodbDatabase => "mongodb_database",
            DeployType::Redis => "redis",
            DeployType::Memcached => "memcached",
            DeployType::Rabbitmq => "rabbitmq",
            DeployType::DataMigration => "data_migration",
        }
    }

    /// 链接注入时使用的环境变量前缀
    pub fn env_prefix(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for DeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeployType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("未知资源类型: {}", s)))
    }
}

/// 资源的弱引用键：(deploy_type, appkey, channel, uniqid)
///
/// 任务项通过该键查找资源，不持有外键
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub deploy_type: DeployType,
    pub appkey: String,
    pub channel: String,
    pub uniqid: String,
}

impl ResourceKey {
    pub fn new(
        deploy_type: DeployType,
        appkey: impl Into<String>,
        channel: impl Into<String>,
        uniqid: impl Into<String>,
    ) -> Self {
        Self {
            deploy_type,
            appkey: appkey.into(),
            channel: channel.into(),
            uniqid: uniqid.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.deploy_type, self.uniqid)
    }
}

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 连续收敛失败多少次后强制置为 failed
    pub const DEFAULT_MAX_ATTEMPT_TIMES: i32 = 3;

    /// 后端 Job 超时（秒），超时未结束视为失败并删除
    pub const DEFAULT_JOB_TIMEOUT_SECS: i64 = 600;

    /// 默认资源巡检间隔（秒）
    pub const DEFAULT_SWEEP_INTERVAL: u64 = 60;

    /// 默认任务巡检间隔（秒）
    pub const DEFAULT_TASK_SWEEP_INTERVAL: u64 = 10;

    /// 指纹注解名
    pub const FINGERPRINT_ANNOTATION: &str = "easy-deploy/fingerprint";

    /// 归属标签名
    pub const OWNER_LABEL: &str = "easy-deploy/owner";

    /// 管理方标签
    pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "easy-deploy";
}
