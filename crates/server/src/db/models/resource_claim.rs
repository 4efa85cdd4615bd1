/// 资源占用表
///
/// 活跃任务对其涉及的每个资源键持有一行，主键唯一性保证同一资源同时只属于一个任务

use chrono::Utc;
use common::models::ResourceKey;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "resource_claims")]
pub struct Model {
    /// deploy_type/appkey/channel/uniqid
    #[sea_orm(primary_key, auto_increment = false)]
    pub claim_key: String,
    pub task_id: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub fn claim_key(key: &ResourceKey) -> String {
    format!(
        "{}/{}/{}/{}",
        key.deploy_type.as_str(),
        key.appkey,
        key.channel,
        key.uniqid
    )
}

pub fn new_claim(key: &ResourceKey, task_id: &str) -> ActiveModel {
    ActiveModel {
        claim_key: Set(claim_key(key)),
        task_id: Set(task_id.to_string()),
        created_at: Set(Utc::now().into()),
    }
}
