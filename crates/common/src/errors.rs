use std::collections::BTreeMap;

use thiserror::Error;

/// 按批次下标归集的校验错误：index -> messages
pub type IndexedErrors = BTreeMap<usize, Vec<String>>;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("批量校验失败: {0:?}")]
    Validation(IndexedErrors),

    #[error("资源已被其他任务锁定: {0}")]
    Locked(String),

    #[error("并发写入冲突: {0}")]
    Conflict(String),

    #[error("依赖资源缺失: {0}")]
    Dependency(String),

    #[error("后端错误: {0}")]
    Backend(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否属于调用方输入问题（同步响应中直接返回给客户端）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::InvalidArgument(_)
                | Error::Validation(_)
                | Error::Locked(_)
                | Error::Dependency(_)
        )
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::Locked("mysql x".into()).is_client_error());
        assert!(Error::Dependency("namespace ns1".into()).is_client_error());
        assert!(!Error::Backend("timeout".into()).is_client_error());
        assert!(!Error::Database("closed".into()).is_client_error());
        assert!(!Error::Conflict("resource r1".into()).is_client_error());
    }
}
