/// 依赖解析
///
/// 上级资源与 links 必须已持久化（且未在销毁中），或者出现在同一批次中更靠前、
/// 仍然有效的操作里。links 的连接信息在任务项启动时才计算。

use std::collections::BTreeMap;

use common::models::{Action, DeployType, ResourceKey, ResourceState};
use common::utils::to_object_name;
use common::{Error, IndexedErrors, Result};
use serde_json::{Map, Value as JsonValue};
use validator::Validate;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::db::models::resource::Resource;
use crate::db::models::spec::ResourceSpec;
use crate::db::models::task::{Link, TaskOperation};
use crate::provisioner::Placement;

/// 批次中的一次声明
struct Claim<'a> {
    deploy_type: DeployType,
    uniqid: &'a str,
    appkey: &'a str,
    channel: &'a str,
    action: Action,
}

fn not_existed(deploy_type: DeployType, uniqid: &str) -> String {
    format!("{} {} is not existed", deploy_type, uniqid)
}

/// 操作所属租户，未指定时继承任务
fn tenant<'a>(op: &'a TaskOperation, appkey: &'a str, channel: &'a str) -> (&'a str, &'a str) {
    (
        op.appkey.as_deref().unwrap_or(appkey),
        op.channel.as_deref().unwrap_or(channel),
    )
}

fn default_port(deploy_type: DeployType) -> Option<u16> {
    match deploy_type {
        DeployType::Mysql => Some(3306),
        DeployType::Mongodb => Some(27017),
        DeployType::Redis => Some(6379),
        DeployType::Memcached => Some(11211),
        DeployType::Rabbitmq => Some(5672),
        _ => None,
    }
}

/// 在主上级之外还会引用该类型的资源类型
fn secondary_referrers(deploy_type: DeployType) -> &'static [DeployType] {
    match deploy_type {
        DeployType::Mysql | DeployType::Mongodb => &[DeployType::DataMigration],
        _ => &[],
    }
}

/// 命名空间资源在后端的名字
pub fn namespace_name(namespace: &Resource) -> String {
    to_object_name(&[&namespace.uniqid])
}

/// 资源对外服务的主机名
pub fn service_host(resource: &Resource, namespace: &str) -> String {
    format!(
        "{}.{}",
        to_object_name(&[resource.deploy_type.as_str(), &resource.uniqid]),
        namespace
    )
}

/// 由资源及其祖先链确定后端位置
pub fn placement(resource: &Resource, ancestors: &[Resource], config: &EngineConfig) -> Result<Placement> {
    let lineage = || std::iter::once(resource).chain(ancestors.iter());

    let cluster = lineage()
        .find(|r| r.deploy_type == DeployType::Cluster)
        .ok_or_else(|| Error::Internal(format!("资源 {} 没有所属集群", resource.key())))?;
    let api_server = match &cluster.spec {
        ResourceSpec::Cluster(spec) => spec.api_server.clone(),
        _ => String::new(),
    };

    let namespace = if resource.deploy_type == DeployType::Cluster {
        config.system_namespace.clone()
    } else {
        let namespace = lineage()
            .find(|r| r.deploy_type == DeployType::Namespace)
            .ok_or_else(|| Error::Internal(format!("资源 {} 没有所属命名空间", resource.key())))?;
        namespace_name(namespace)
    };

    Ok(Placement {
        cluster_id: cluster.id.clone(),
        api_server,
        namespace,
    })
}

/// 主机与端口
fn endpoint(resource: &Resource, namespace: &str) -> (String, Option<u16>) {
    let port = match &resource.spec {
        ResourceSpec::Mysql(s) | ResourceSpec::Mongodb(s) | ResourceSpec::Rabbitmq(s) => {
            s.port.or_else(|| default_port(resource.deploy_type))
        }
        ResourceSpec::Redis(s) | ResourceSpec::Memcached(s) => {
            s.port.or_else(|| default_port(resource.deploy_type))
        }
        ResourceSpec::Deployment(s) => s.ports.first().copied(),
        _ => None,
    };
    (service_host(resource, namespace), port)
}

pub struct DependencyService {
    state: AppState,
}

impl DependencyService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 校验整个批次，任一项失败时返回按下标归类的错误
    pub async fn validate_batch(
        &self,
        appkey: &str,
        channel: &str,
        ops: &[TaskOperation],
    ) -> Result<()> {
        let claims: Vec<Claim> = ops
            .iter()
            .map(|op| {
                let (appkey, channel) = tenant(op, appkey, channel);
                Claim {
                    deploy_type: op.deploy_type,
                    uniqid: &op.uniqid,
                    appkey,
                    channel,
                    action: op.action,
                }
            })
            .collect();

        let mut errors = IndexedErrors::new();
        for (index, op) in ops.iter().enumerate() {
            let problems = self.check_operation(op, &claims[index], &claims[..index]).await?;
            if !problems.is_empty() {
                errors.insert(index, problems);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    async fn check_operation(
        &self,
        op: &TaskOperation,
        claim: &Claim<'_>,
        earlier: &[Claim<'_>],
    ) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        if let Err(e) = op.validate() {
            problems.push(format!("参数无效: {}", e));
        }
        for link in &op.links {
            if let Err(e) = link.validate() {
                problems.push(format!("links 参数无效: {}", e));
            }
        }
        if !op.links.is_empty()
            && !matches!(op.deploy_type, DeployType::Deployment | DeployType::Workspace)
        {
            problems.push(format!("{} 不支持 links", op.deploy_type));
        }

        let (appkey, channel) = (claim.appkey, claim.channel);
        if op.action == Action::Create {
            match ResourceSpec::from_fields(op.deploy_type, &op.fields_value()) {
                Ok(spec) => {
                    for (kind, uniqid) in spec.superiors() {
                        if !self.resolvable(kind, uniqid, appkey, channel, earlier).await? {
                            problems.push(not_existed(kind, uniqid));
                        }
                    }
                }
                Err(e) => problems.push(e.to_string()),
            }
            if self
                .resolvable(op.deploy_type, &op.uniqid, appkey, channel, earlier)
                .await?
            {
                problems.push(format!("{} {} is existed", op.deploy_type, op.uniqid));
            }
        } else if !self
            .resolvable(op.deploy_type, &op.uniqid, appkey, channel, earlier)
            .await?
        {
            problems.push(not_existed(op.deploy_type, &op.uniqid));
        }

        for link in &op.links {
            if !self
                .resolvable(link.deploy_type, &link.uniqid, appkey, channel, earlier)
                .await?
            {
                problems.push(not_existed(link.deploy_type, &link.uniqid));
            }
        }
        Ok(problems)
    }

    /// 批次内最近一次声明优先，否则看持久化的资源
    async fn resolvable(
        &self,
        deploy_type: DeployType,
        uniqid: &str,
        appkey: &str,
        channel: &str,
        earlier: &[Claim<'_>],
    ) -> Result<bool> {
        let claim = earlier.iter().rev().find(|c| {
            c.deploy_type == deploy_type
                && c.uniqid == uniqid
                && c.appkey == appkey
                && c.channel == channel
        });
        if let Some(claim) = claim {
            return Ok(claim.action != Action::Delete);
        }

        let key = ResourceKey::new(deploy_type, appkey, channel, uniqid);
        let resource = self.state.store.find_resource(&key).await?;
        Ok(matches!(resource, Some(r) if r.desired_state != ResourceState::Destroyed))
    }

    /// 解析资源规格中的上级引用，返回主上级
    pub async fn resolve_superiors(
        &self,
        appkey: &str,
        channel: &str,
        spec: &ResourceSpec,
    ) -> Result<Option<Resource>> {
        let mut primary = None;
        for (kind, uniqid) in spec.superiors() {
            let key = ResourceKey::new(kind, appkey, channel, uniqid);
            let superior = self
                .state
                .store
                .find_resource(&key)
                .await?
                .filter(|r| r.desired_state != ResourceState::Destroyed)
                .ok_or_else(|| Error::Dependency(not_existed(kind, uniqid)))?;
            if primary.is_none() {
                primary = Some(superior);
            }
        }
        Ok(primary)
    }

    /// 沿 superior_id 向上的祖先链（近的在前），任一上级行缺失时返回 None
    pub async fn ancestors(&self, resource: &Resource) -> Result<Option<Vec<Resource>>> {
        let mut chain: Vec<Resource> = Vec::new();
        let mut next = resource.superior_id.clone();
        while let Some(id) = next {
            if chain.len() > DeployType::ALL.len() {
                return Err(Error::Internal(format!("资源 {} 的上级链存在环", resource.id)));
            }
            let Some(parent) = self.state.store.get_resource(&id).await? else {
                return Ok(None);
            };
            next = parent.superior_id.clone();
            chain.push(parent);
        }
        Ok(Some(chain))
    }

    /// 依赖该资源的全部资源：以它为主上级的下级，以及通过其他上级引用它的资源
    pub async fn dependents(&self, resource: &Resource) -> Result<Vec<Resource>> {
        let mut dependents = self.state.store.list_children(&resource.id).await?;
        for referrer in secondary_referrers(resource.deploy_type) {
            for candidate in self.state.store.list_resources(*referrer).await? {
                let references = candidate.appkey == resource.appkey
                    && candidate.channel == resource.channel
                    && candidate
                        .spec
                        .superiors()
                        .iter()
                        .skip(1)
                        .any(|(kind, uniqid)| *kind == resource.deploy_type && *uniqid == resource.uniqid);
                if references && !dependents.iter().any(|d| d.id == candidate.id) {
                    dependents.push(candidate);
                }
            }
        }
        Ok(dependents)
    }

    /// 主上级以外的上级是否都存在且未在销毁中
    pub async fn secondary_superiors_ready(&self, resource: &Resource) -> Result<bool> {
        for (kind, uniqid) in resource.spec.superiors().into_iter().skip(1) {
            let key = ResourceKey::new(kind, &resource.appkey, &resource.channel, uniqid);
            match self.state.store.find_resource(&key).await? {
                Some(superior) if superior.desired_state != ResourceState::Destroyed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// 可注入的连接信息（字段名小写）
    pub async fn connection_info(&self, resource: &Resource) -> Result<BTreeMap<&'static str, String>> {
        let ancestors = self
            .ancestors(resource)
            .await?
            .ok_or_else(|| Error::Dependency(format!("{} 的上级资源不存在", resource.key())))?;
        let namespace = placement(resource, &ancestors, &self.state.engine)?.namespace;

        let mut info = BTreeMap::new();
        let put_endpoint = |target: &Resource, info: &mut BTreeMap<&'static str, String>| {
            let (host, port) = endpoint(target, &namespace);
            info.insert("host", host);
            if let Some(port) = port {
                info.insert("port", port.to_string());
            }
        };

        match &resource.spec {
            ResourceSpec::Mysql(s) | ResourceSpec::Mongodb(s) | ResourceSpec::Rabbitmq(s) => {
                put_endpoint(resource, &mut info);
                if let Some(user) = &s.username {
                    info.insert("user", user.clone());
                }
                info.insert("password", s.password.clone());
            }
            ResourceSpec::Redis(s) | ResourceSpec::Memcached(s) => {
                put_endpoint(resource, &mut info);
                if let Some(password) = &s.password {
                    info.insert("password", password.clone());
                }
            }
            ResourceSpec::MysqlDatabase(s) => {
                put_endpoint(self.instance_of(resource, &ancestors)?, &mut info);
                info.insert("database", s.database.clone());
                info.insert("user", s.username.clone());
                info.insert("password", s.password.clone());
            }
            ResourceSpec::MongodbDatabase(s) => {
                put_endpoint(self.instance_of(resource, &ancestors)?, &mut info);
                info.insert("database", s.database.clone());
                info.insert("user", s.username.clone());
                info.insert("password", s.password.clone());
            }
            ResourceSpec::Deployment(_) | ResourceSpec::Workspace(_) => {
                put_endpoint(resource, &mut info);
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{} 不能作为 links 目标",
                    resource.deploy_type
                )))
            }
        }
        Ok(info)
    }

    /// 数据库账号所属的实例（主机与端口取自实例）
    fn instance_of<'a>(&self, resource: &Resource, ancestors: &'a [Resource]) -> Result<&'a Resource> {
        ancestors
            .first()
            .ok_or_else(|| Error::Dependency(format!("{} 的实例不存在", resource.key())))
    }

    /// 计算 links 对应的环境变量：`<TYPE>_<alias>_<FIELD>`
    pub async fn link_envs(
        &self,
        appkey: &str,
        channel: &str,
        links: &[Link],
    ) -> Result<BTreeMap<String, String>> {
        let mut envs = BTreeMap::new();
        for link in links {
            let key = ResourceKey::new(link.deploy_type, appkey, channel, &link.uniqid);
            let resource = self
                .state
                .store
                .find_resource(&key)
                .await?
                .filter(|r| r.desired_state != ResourceState::Destroyed)
                .ok_or_else(|| Error::Dependency(not_existed(link.deploy_type, &link.uniqid)))?;

            for (field, value) in self.connection_info(&resource).await? {
                let name = format!(
                    "{}_{}_{}",
                    link.deploy_type.env_prefix(),
                    link.alias,
                    field.to_uppercase()
                );
                envs.insert(name, value);
            }
        }
        Ok(envs)
    }

    /// 把 links 环境变量合并进操作字段的 envs
    pub async fn inject_links(
        &self,
        appkey: &str,
        channel: &str,
        links: &[Link],
        fields: &mut Map<String, JsonValue>,
    ) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        let envs = self.link_envs(appkey, channel, links).await?;
        let target = fields
            .entry("envs")
            .or_insert_with(|| JsonValue::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| Error::InvalidArgument("envs 必须是对象".to_string()))?;
        for (name, value) in envs {
            target.insert(name, JsonValue::String(value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestContext, APPKEY, CHANNEL};
    use serde_json::json;

    fn ops(value: JsonValue) -> Vec<TaskOperation> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_missing_superior_cites_index() {
        let ctx = TestContext::new();
        let service = DependencyService::new(ctx.state.clone());
        let batch = ops(json!([{
            "deploy_type": "namespace", "uniqid": "ns1", "action": "create", "cluster_uniqid": "cl1"
        }]));

        match service.validate_batch(APPKEY, CHANNEL, &batch).await {
            Err(Error::Validation(errors)) => {
                assert_eq!(errors[&0], vec!["cluster cl1 is not existed".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_superior_earlier_in_batch() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let service = DependencyService::new(ctx.state.clone());
        let batch = ops(json!([
            {"deploy_type": "mysql", "uniqid": "m1", "action": "create",
             "namespace_uniqid": "ns1", "password": "secret-pass", "storage_size": "10Gi"},
            {"deploy_type": "mysql_database", "uniqid": "db1", "action": "create",
             "mysql_uniqid": "m1", "database": "app", "username": "app", "password": "secret-pass"}
        ]));
        service.validate_batch(APPKEY, CHANNEL, &batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_earlier_delete_invalidates_claim() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let service = DependencyService::new(ctx.state.clone());
        let batch = ops(json!([
            {"deploy_type": "namespace", "uniqid": "ns1", "action": "delete"},
            {"deploy_type": "redis", "uniqid": "r1", "action": "create", "namespace_uniqid": "ns1"}
        ]));

        match service.validate_batch(APPKEY, CHANNEL, &batch).await {
            Err(Error::Validation(errors)) => {
                assert!(!errors.contains_key(&0));
                assert_eq!(errors[&1], vec!["namespace ns1 is not existed".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_existence_rules_for_actions() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let service = DependencyService::new(ctx.state.clone());
        let batch = ops(json!([
            {"deploy_type": "namespace", "uniqid": "ns1", "action": "create", "cluster_uniqid": "cl1"},
            {"deploy_type": "redis", "uniqid": "r9", "action": "stop"}
        ]));

        match service.validate_batch(APPKEY, CHANNEL, &batch).await {
            Err(Error::Validation(errors)) => {
                assert_eq!(errors[&0], vec!["namespace ns1 is existed".to_string()]);
                assert_eq!(errors[&1], vec!["redis r9 is not existed".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_tenant_is_not_visible() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        let service = DependencyService::new(ctx.state.clone());
        let batch = ops(json!([{
            "deploy_type": "redis", "uniqid": "r1", "action": "create",
            "namespace_uniqid": "ns1", "appkey": "other"
        }]));
        assert!(service.validate_batch(APPKEY, CHANNEL, &batch).await.is_err());
    }

    #[tokio::test]
    async fn test_link_envs_for_instance_and_database() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        ctx.create(
            DeployType::Mysql,
            "m1",
            json!({"namespace_uniqid": "ns1", "username": "root", "password": "secret-pass", "storage_size": "10Gi"}),
        )
        .await;
        ctx.create(
            DeployType::MysqlDatabase,
            "app_db",
            json!({"mysql_uniqid": "m1", "database": "app", "username": "app", "password": "app-password"}),
        )
        .await;

        let service = DependencyService::new(ctx.state.clone());
        let links: Vec<Link> = serde_json::from_value(json!([
            {"uniqid": "m1", "deploy_type": "mysql", "alias": "main"},
            {"uniqid": "app_db", "deploy_type": "mysql_database", "alias": "app"}
        ]))
        .unwrap();
        let envs = service.link_envs(APPKEY, CHANNEL, &links).await.unwrap();

        assert_eq!(envs["MYSQL_main_HOST"], "mysql-m1.ns1");
        assert_eq!(envs["MYSQL_main_PORT"], "3306");
        assert_eq!(envs["MYSQL_main_USER"], "root");
        assert_eq!(envs["MYSQL_DATABASE_app_HOST"], "mysql-m1.ns1");
        assert_eq!(envs["MYSQL_DATABASE_app_DATABASE"], "app");
        assert_eq!(envs["MYSQL_DATABASE_app_PASSWORD"], "app-password");
    }

    #[tokio::test]
    async fn test_inject_links_merges_into_envs() {
        let ctx = TestContext::new();
        ctx.namespace().await;
        ctx.create(DeployType::Redis, "cache", json!({"namespace_uniqid": "ns1"})).await;

        let service = DependencyService::new(ctx.state.clone());
        let links: Vec<Link> =
            serde_json::from_value(json!([{"uniqid": "cache", "deploy_type": "redis", "alias": "c"}]))
                .unwrap();
        let mut fields = json!({"image": "web", "envs": {"MODE": "prod"}})
            .as_object()
            .cloned()
            .unwrap();
        service
            .inject_links(APPKEY, CHANNEL, &links, &mut fields)
            .await
            .unwrap();

        assert_eq!(fields["envs"]["MODE"], "prod");
        assert_eq!(fields["envs"]["REDIS_c_HOST"], "redis-cache.ns1");
        assert_eq!(fields["envs"]["REDIS_c_PORT"], "6379");
    }
}
