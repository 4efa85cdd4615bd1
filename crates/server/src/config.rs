/// 配置管理

use std::collections::BTreeMap;

use common::models::constants::{
    DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPT_TIMES, DEFAULT_SERVER_PORT,
    DEFAULT_SWEEP_INTERVAL, DEFAULT_TASK_SWEEP_INTERVAL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_port: u16,
    /// 为空时使用内存存储
    pub database_url: String,
    pub log_level: String,
    pub worker_count: usize,
    pub queue_max_retries: u32,
    pub sweep_interval_secs: u64,
    pub task_sweep_interval_secs: u64,
    pub max_attempt_times: i32,
    pub job_timeout_secs: i64,
    pub callback_timeout_secs: u64,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .set_default("server_port", i64::from(DEFAULT_SERVER_PORT))?
            .set_default("database_url", "")?
            .set_default("log_level", "debug")?
            .set_default("worker_count", 4)?
            .set_default("queue_max_retries", 3)?
            .set_default("sweep_interval_secs", DEFAULT_SWEEP_INTERVAL as i64)?
            .set_default("task_sweep_interval_secs", DEFAULT_TASK_SWEEP_INTERVAL as i64)?
            .set_default("max_attempt_times", DEFAULT_MAX_ATTEMPT_TIMES)?
            .set_default("job_timeout_secs", DEFAULT_JOB_TIMEOUT_SECS)?
            .set_default("callback_timeout_secs", 10)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let cfg: Config = cfg.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 取值检查，定时器间隔与超时不能为 0
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("WORKER_COUNT 必须大于 0");
        }
        if self.max_attempt_times <= 0 {
            anyhow::bail!("MAX_ATTEMPT_TIMES 必须大于 0");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS 必须大于 0");
        }
        if self.task_sweep_interval_secs == 0 {
            anyhow::bail!("TASK_SWEEP_INTERVAL_SECS 必须大于 0");
        }
        if self.job_timeout_secs <= 0 {
            anyhow::bail!("JOB_TIMEOUT_SECS 必须大于 0");
        }
        if self.callback_timeout_secs == 0 {
            anyhow::bail!("CALLBACK_TIMEOUT_SECS 必须大于 0");
        }
        Ok(())
    }

    /// 引擎使用的不可变配置
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_attempt_times: self.max_attempt_times,
            job_timeout: chrono::Duration::seconds(self.job_timeout_secs),
            ..EngineConfig::default()
        }
    }
}

/// 引擎配置，启动时构造一次后注入各组件
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 连续失败达到该次数后强制 failed
    pub max_attempt_times: i32,
    /// 后端 Job 超时时间
    pub job_timeout: chrono::Duration,
    /// 打在所有后端对象上的公共标签
    pub common_labels: BTreeMap<String, String>,
    /// 集群级对象所在的系统命名空间
    pub system_namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempt_times: DEFAULT_MAX_ATTEMPT_TIMES,
            job_timeout: chrono::Duration::seconds(DEFAULT_JOB_TIMEOUT_SECS),
            common_labels: BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )]),
            system_namespace: "easy-deploy-system".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            server_port: DEFAULT_SERVER_PORT,
            database_url: String::new(),
            log_level: "info".to_string(),
            worker_count: 4,
            queue_max_retries: 3,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL,
            task_sweep_interval_secs: DEFAULT_TASK_SWEEP_INTERVAL,
            max_attempt_times: DEFAULT_MAX_ATTEMPT_TIMES,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            callback_timeout_secs: 10,
        }
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        assert!(config().validate().is_ok());

        let zero_sweep = Config {
            sweep_interval_secs: 0,
            ..config()
        };
        let err = zero_sweep.validate().unwrap_err();
        assert!(err.to_string().contains("SWEEP_INTERVAL_SECS"));

        let zero_task_sweep = Config {
            task_sweep_interval_secs: 0,
            ..config()
        };
        assert!(zero_task_sweep.validate().is_err());

        let no_workers = Config {
            worker_count: 0,
            ..config()
        };
        assert!(no_workers.validate().is_err());
    }

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_attempt_times, 3);
        assert_eq!(engine.job_timeout, chrono::Duration::minutes(10));
        assert_eq!(engine.common_labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
    }
}
