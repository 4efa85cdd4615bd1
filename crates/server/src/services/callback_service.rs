/// 回调通知
///
/// 投递是 fire-and-forget：失败只记录日志，不重试，也不影响触发它的收敛过程。

use std::time::Duration;

use common::models::DeployType;
use common::utils::occurrence_time_now;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::db::models::resource::StatusMessage;
use crate::metrics::Metrics;

/// 单个事件的回调内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub code: u16,
    pub deploy_type: DeployType,
    pub uniqid: String,
    pub details: JsonValue,
    pub occurrence_time: String,
}

impl CallbackPayload {
    pub fn new(code: u16, deploy_type: DeployType, uniqid: &str, details: impl Into<JsonValue>) -> Self {
        Self {
            code,
            deploy_type,
            uniqid: uniqid.to_string(),
            details: details.into(),
            occurrence_time: occurrence_time_now(),
        }
    }
}

impl From<&StatusMessage> for CallbackPayload {
    fn from(message: &StatusMessage) -> Self {
        Self {
            code: message.code,
            deploy_type: message.kind,
            uniqid: message.uniqid.clone(),
            details: message.detail.clone(),
            occurrence_time: message.timestamp.clone(),
        }
    }
}

/// 回调发送方
pub trait Notifier: Send + Sync + 'static {
    /// 立即返回，投递在后台完成
    fn notify(&self, url: &str, body: JsonValue);
}

/// 基于 HTTP POST 的回调
#[derive(Clone)]
pub struct HttpCallbackReporter {
    client: Client,
    metrics: Metrics,
}

impl HttpCallbackReporter {
    pub fn new(timeout_secs: u64, metrics: Metrics) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_else(|_| Client::new()),
            metrics,
        }
    }
}

impl Notifier for HttpCallbackReporter {
    fn notify(&self, url: &str, body: JsonValue) {
        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let url = url.to_string();

        tokio::spawn(async move {
            let result = client.post(&url).json(&body).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("回调成功: {}", url);
                    metrics.callbacks.with_label_values(&["ok"]).inc();
                }
                Ok(response) => {
                    warn!("回调返回非成功状态: url={}, status={}", url, response.status());
                    metrics.callbacks.with_label_values(&["rejected"]).inc();
                }
                Err(e) => {
                    warn!("回调失败: url={}, error={}", url, e);
                    metrics.callbacks.with_label_values(&["error"]).inc();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_shape() {
        let payload = CallbackPayload::new(200, DeployType::MysqlDatabase, "db1", "success");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], 200);
        assert_eq!(value["deploy_type"], "mysql_database");
        assert_eq!(value["uniqid"], "db1");
        assert_eq!(value["details"], "success");
        assert_eq!(value["occurrence_time"].as_str().unwrap().len(), 19);
    }

    #[test]
    fn test_payload_from_status_message() {
        let message = StatusMessage::new(500, DeployType::Redis, "r1", json!({"error": "boom"}));
        let payload = CallbackPayload::from(&message);
        assert_eq!(payload.code, 500);
        assert_eq!(payload.details["error"], "boom");
        assert_eq!(payload.occurrence_time, message.timestamp);
    }

    #[tokio::test]
    async fn test_unreachable_url_is_swallowed() {
        let metrics = Metrics::new().unwrap();
        let reporter = HttpCallbackReporter::new(1, metrics.clone());
        reporter.notify("http://127.0.0.1:1/callback", json!({"code": 200}));

        for _ in 0..50 {
            if metrics.callbacks.with_label_values(&["error"]).get() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("callback failure was not recorded");
    }
}
