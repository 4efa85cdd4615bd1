/// 工具函数集合

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 回调中使用的时间格式：YYYY-MM-DD HH:MM:SS
pub fn format_occurrence_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 当前时间（回调格式）
pub fn occurrence_time_now() -> String {
    format_occurrence_time(Utc::now())
}

/// JSON 合并：patch 中的对象字段递归覆盖 target，null 表示删除
pub fn merge_json(target: &mut JsonValue, patch: &JsonValue) {
    match (target, patch) {
        (JsonValue::Object(target_map), JsonValue::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_json(
                        target_map.entry(key.clone()).or_insert(JsonValue::Null),
                        value,
                    );
                }
            }
        }
        (target, patch) => {
            *target = patch.clone();
        }
    }
}

/// 转换为后端对象名：小写，下划线替换为中划线
pub fn to_object_name(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_lowercase().replace('_', "-"))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_generate_id() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // UUID v4 格式
    }

    #[test]
    fn test_format_occurrence_time() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_occurrence_time(t), "2024-03-09 07:05:01");
    }

    #[test]
    fn test_merge_json() {
        let mut target = json!({"replicas": 1, "limits": {"cpu": "1", "memory": "1Gi"}, "labels": {"a": "b"}});
        merge_json(&mut target, &json!({"replicas": 3, "limits": {"cpu": "2"}, "labels": null}));
        assert_eq!(target, json!({"replicas": 3, "limits": {"cpu": "2", "memory": "1Gi"}}));
    }

    #[test]
    fn test_to_object_name() {
        assert_eq!(to_object_name(&["mysql_database", "DB1"]), "mysql-database-db1");
        assert_eq!(to_object_name(&["redis", "", "r1"]), "redis-r1");
    }
}
