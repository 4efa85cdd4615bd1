/// 资源配置（按资源类型区分的可变字段）

use std::collections::BTreeMap;

use common::models::DeployType;
use common::utils::merge_json;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

/// 资源配额
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClusterSpec {
    #[validate(length(min = 1))]
    pub api_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NamespaceSpec {
    #[validate(length(min = 1))]
    pub cluster_uniqid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<ResourceLimits>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DeploymentSpec {
    #[validate(length(min = 1))]
    pub namespace_uniqid: String,
    #[validate(length(min = 1))]
    pub image: String,
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, max = 100))]
    pub replicas: u32,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct WorkspaceSpec {
    #[validate(length(min = 1))]
    pub namespace_uniqid: String,
    #[validate(length(min = 1))]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelConfigSpec {
    #[validate(length(min = 1))]
    pub namespace_uniqid: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// 有状态实例（mysql / mongodb / rabbitmq）的公共配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct InstanceSpec {
    #[validate(length(min = 1))]
    pub namespace_uniqid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[validate(length(min = 8))]
    pub password: String,
    #[validate(length(min = 1))]
    pub storage_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// 缓存实例（redis / memcached）配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CacheSpec {
    #[validate(length(min = 1))]
    pub namespace_uniqid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MysqlDatabaseSpec {
    #[validate(length(min = 1))]
    pub mysql_uniqid: String,
    #[validate(length(min = 1, max = 64))]
    pub database: String,
    #[validate(length(min = 1, max = 32))]
    pub username: String,
    #[validate(length(min = 8))]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MongodbDatabaseSpec {
    #[validate(length(min = 1))]
    pub mongodb_uniqid: String,
    #[validate(length(min = 1, max = 64))]
    pub database: String,
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 8))]
    pub password: String,
}

/// 数据迁移的后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingType {
    Mysql,
    Mongodb,
}

impl BackingType {
    pub fn instance_type(&self) -> DeployType {
        match self {
            BackingType::Mysql => DeployType::Mysql,
            BackingType::Mongodb => DeployType::Mongodb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DataMigrationSpec {
    #[validate(length(min = 1))]
    pub source_uniqid: String,
    #[validate(length(min = 1))]
    pub destination_uniqid: String,
    pub backing_type: BackingType,
    #[serde(default)]
    pub databases: Vec<String>,
}

/// 资源配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "deploy_type", rename_all = "snake_case")]
pub enum ResourceSpec {
    Cluster(ClusterSpec),
    Namespace(NamespaceSpec),
    Deployment(DeploymentSpec),
    Workspace(WorkspaceSpec),
    ModelConfig(ModelConfigSpec),
    Mysql(InstanceSpec),
    MysqlDatabase(MysqlDatabaseSpec),
    Mongodb(InstanceSpec),
    MongodbDatabase(MongodbDatabaseSpec),
    Redis(CacheSpec),
    Memcached(CacheSpec),
    Rabbitmq(InstanceSpec),
    DataMigration(DataMigrationSpec),
}

fn default_replicas() -> u32 {
    1
}

/// 客户端请求中与资源配置无关的字段
const OPERATION_FIELDS: &[&str] = &["uniqid", "action", "appkey", "channel", "links", "callback_url"];

impl ResourceSpec {
    /// 从请求字段解析指定类型的配置
    pub fn from_fields(deploy_type: DeployType, fields: &JsonValue) -> Result<Self> {
        let mut value = match fields {
            JsonValue::Object(map) => {
                let mut map = map.clone();
                for key in OPERATION_FIELDS {
                    map.remove(*key);
                }
                JsonValue::Object(map)
            }
            JsonValue::Null => JsonValue::Object(Default::default()),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{} 配置必须是对象",
                    deploy_type
                )))
            }
        };
        value["deploy_type"] = JsonValue::String(deploy_type.as_str().to_string());

        let spec: ResourceSpec = serde_json::from_value(value).map_err(|e| {
            Error::InvalidArgument(format!("{} 配置无效: {}", deploy_type, e))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// 合并更新字段，返回新配置；上级引用不可修改
    pub fn merged(&self, patch: &JsonValue) -> Result<Self> {
        let mut value = serde_json::to_value(self)?;
        merge_json(&mut value, patch);
        let updated = Self::from_fields(self.deploy_type(), &value)?;

        if updated.superiors() != self.superiors() {
            return Err(Error::InvalidArgument(format!(
                "{} 的上级资源不允许修改",
                self.deploy_type()
            )));
        }
        Ok(updated)
    }

    pub fn deploy_type(&self) -> DeployType {
        match self {
            ResourceSpec::Cluster(_) => DeployType::Cluster,
            ResourceSpec::Namespace(_) => DeployType::Namespace,
            ResourceSpec::Deployment(_) => DeployType::Deployment,
            ResourceSpec::Workspace(_) => DeployType::Workspace,
            ResourceSpec::ModelConfig(_) => DeployType::ModelConfig,
            ResourceSpec::Mysql(_) => DeployType::Mysql,
            ResourceSpec::MysqlDatabase(_) => DeployType::MysqlDatabase,
            ResourceSpec::Mongodb(_) => DeployType::Mongodb,
            ResourceSpec::MongodbDatabase(_) => DeployType::MongodbDatabase,
            ResourceSpec::Redis(_) => DeployType::Redis,
            ResourceSpec::Memcached(_) => DeployType::Memcached,
            ResourceSpec::Rabbitmq(_) => DeployType::Rabbitmq,
            ResourceSpec::DataMigration(_) => DeployType::DataMigration,
        }
    }

    /// 字段级校验
    pub fn validate(&self) -> Result<()> {
        let result = match self {
            ResourceSpec::Cluster(s) => s.validate(),
            ResourceSpec::Namespace(s) => s.validate(),
            ResourceSpec::Deployment(s) => s.validate(),
            ResourceSpec::Workspace(s) => s.validate(),
            ResourceSpec::ModelConfig(s) => s.validate(),
            ResourceSpec::Mysql(s) | ResourceSpec::Mongodb(s) | ResourceSpec::Rabbitmq(s) => {
                s.validate()
            }
            ResourceSpec::MysqlDatabase(s) => s.validate(),
            ResourceSpec::MongodbDatabase(s) => s.validate(),
            ResourceSpec::Redis(s) | ResourceSpec::Memcached(s) => s.validate(),
            ResourceSpec::DataMigration(s) => s.validate(),
        };
        result.map_err(|e| {
            Error::InvalidArgument(format!("{} 配置无效: {}", self.deploy_type(), e))
        })?;

        if let ResourceSpec::DataMigration(s) = self {
            if s.source_uniqid == s.destination_uniqid {
                return Err(Error::InvalidArgument(
                    "data_migration 的源与目标不能相同".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// 上级资源引用，第一个为主上级
    pub fn superiors(&self) -> Vec<(DeployType, &str)> {
        match self {
            ResourceSpec::Cluster(_) => vec![],
            ResourceSpec::Namespace(s) => vec![(DeployType::Cluster, s.cluster_uniqid.as_str())],
            ResourceSpec::Deployment(s) => vec![(DeployType::Namespace, s.namespace_uniqid.as_str())],
            ResourceSpec::Workspace(s) => vec![(DeployType::Namespace, s.namespace_uniqid.as_str())],
            ResourceSpec::ModelConfig(s) => vec![(DeployType::Namespace, s.namespace_uniqid.as_str())],
            ResourceSpec::Mysql(s) | ResourceSpec::Mongodb(s) | ResourceSpec::Rabbitmq(s) => {
                vec![(DeployType::Namespace, s.namespace_uniqid.as_str())]
            }
            ResourceSpec::Redis(s) | ResourceSpec::Memcached(s) => {
                vec![(DeployType::Namespace, s.namespace_uniqid.as_str())]
            }
            ResourceSpec::MysqlDatabase(s) => vec![(DeployType::Mysql, s.mysql_uniqid.as_str())],
            ResourceSpec::MongodbDatabase(s) => {
                vec![(DeployType::Mongodb, s.mongodb_uniqid.as_str())]
            }
            ResourceSpec::DataMigration(s) => {
                let instance_type = s.backing_type.instance_type();
                vec![
                    (instance_type, s.source_uniqid.as_str()),
                    (instance_type, s.destination_uniqid.as_str()),
                ]
            }
        }
    }

    /// 用户自定义标签
    pub fn labels(&self) -> BTreeMap<String, String> {
        match self {
            ResourceSpec::Cluster(s) => s.labels.clone(),
            ResourceSpec::Namespace(s) => s.labels.clone(),
            ResourceSpec::Deployment(s) => s.labels.clone(),
            ResourceSpec::Workspace(s) => s.labels.clone(),
            ResourceSpec::ModelConfig(s) => s.labels.clone(),
            ResourceSpec::Mysql(s) | ResourceSpec::Mongodb(s) | ResourceSpec::Rabbitmq(s) => {
                s.labels.clone()
            }
            ResourceSpec::Redis(s) | ResourceSpec::Memcached(s) => s.labels.clone(),
            ResourceSpec::MysqlDatabase(_)
            | ResourceSpec::MongodbDatabase(_)
            | ResourceSpec::DataMigration(_) => BTreeMap::new(),
        }
    }

    /// 参与指纹计算的可变字段
    pub fn mutable_fields(&self) -> Result<JsonValue> {
        let mut value = serde_json::to_value(self)?;
        if let JsonValue::Object(map) = &mut value {
            map.remove("labels");
        }
        Ok(value)
    }

    /// 可注入环境变量的资源
    pub fn envs_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        match self {
            ResourceSpec::Deployment(s) => Some(&mut s.envs),
            ResourceSpec::Workspace(s) => Some(&mut s.envs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_fields_strips_operation_fields() {
        let spec = ResourceSpec::from_fields(
            DeployType::Namespace,
            &json!({"uniqid": "ns1", "action": "create", "cluster_uniqid": "cl1"}),
        )
        .unwrap();
        assert_eq!(spec.deploy_type(), DeployType::Namespace);
        assert_eq!(spec.superiors(), vec![(DeployType::Cluster, "cl1")]);
    }

    #[test]
    fn test_missing_superior_field_rejected() {
        let err = ResourceSpec::from_fields(DeployType::Deployment, &json!({"image": "nginx"}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_field_validation() {
        let err = ResourceSpec::from_fields(
            DeployType::Deployment,
            &json!({"namespace_uniqid": "ns1", "image": "nginx", "replicas": 0}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_data_migration_superiors() {
        let spec = ResourceSpec::from_fields(
            DeployType::DataMigration,
            &json!({"source_uniqid": "m1", "destination_uniqid": "m2", "backing_type": "mysql"}),
        )
        .unwrap();
        assert_eq!(
            spec.superiors(),
            vec![(DeployType::Mysql, "m1"), (DeployType::Mysql, "m2")]
        );

        let same = ResourceSpec::from_fields(
            DeployType::DataMigration,
            &json!({"source_uniqid": "m1", "destination_uniqid": "m1", "backing_type": "mysql"}),
        );
        assert!(same.is_err());
    }

    #[test]
    fn test_merged_updates_fields_but_not_superior() {
        let spec = ResourceSpec::from_fields(
            DeployType::Deployment,
            &json!({"namespace_uniqid": "ns1", "image": "nginx:1.25"}),
        )
        .unwrap();

        let updated = spec.merged(&json!({"replicas": 3})).unwrap();
        match &updated {
            ResourceSpec::Deployment(d) => {
                assert_eq!(d.replicas, 3);
                assert_eq!(d.image, "nginx:1.25");
            }
            other => panic!("unexpected spec: {:?}", other),
        }
        assert_ne!(spec.mutable_fields().unwrap(), updated.mutable_fields().unwrap());

        assert!(spec.merged(&json!({"namespace_uniqid": "ns2"})).is_err());
    }
}
