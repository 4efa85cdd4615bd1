//! 指纹计算
//!
//! 指纹 = hash(公共标签 ∥ 有序的可变字段)。Provisioner 把指纹写到每个后端对象的注解上，
//! 注解与当前计算值不一致即视为未创建，触发重新 apply。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// 资源内容指纹（64 位十六进制）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 计算指纹
    ///
    /// 标签与字段都先做规范化（对象键排序、无空白），相同内容总得到相同结果
    pub fn compute(labels: &BTreeMap<String, String>, fields: &JsonValue) -> Self {
        let mut hasher = Sha256::new();
        for (key, value) in labels {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\x00");
        hasher.update(canonicalize(fields).as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 与后端对象上的注解比较
    pub fn matches(&self, annotation: Option<&str>) -> bool {
        annotation == Some(self.0.as_str())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 规范化 JSON
fn canonicalize(value: &JsonValue) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, JsonValue> =
                map.iter().map(|(k, v)| (k, sort_keys(v))).collect();
            JsonValue::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("appkey".to_string(), "app1".to_string()),
            ("uniqid".to_string(), "web".to_string()),
        ])
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = Fingerprint::compute(&labels(), &json!({"replicas": 2, "image": "nginx"}));
        let b = Fingerprint::compute(&labels(), &json!({"image": "nginx", "replicas": 2}));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_fields() {
        let a = Fingerprint::compute(&labels(), &json!({"replicas": 2}));
        let b = Fingerprint::compute(&labels(), &json!({"replicas": 3}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_labels() {
        let mut other = labels();
        other.insert("team".to_string(), "infra".to_string());
        let a = Fingerprint::compute(&labels(), &json!({"replicas": 2}));
        let b = Fingerprint::compute(&other, &json!({"replicas": 2}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_matches_annotation() {
        let fp = Fingerprint::compute(&labels(), &json!({}));
        assert!(fp.matches(Some(fp.as_str())));
        assert!(!fp.matches(Some("stale")));
        assert!(!fp.matches(None));
    }
}
