use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::User;

/// JIRAから取得した課題レコード
///
/// `fields` は任意の深さのネスト構造を取りうるため型付けせず、抽出側の
/// Field定義が宣言的に値を取り出す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub key: String,
    #[serde(rename = "self")]
    #[serde(default)]
    pub self_url: String,
    pub fields: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<Changelog>,
}

impl Issue {
    /// ペイロード属性を取得
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// 課題の作成日時（生文字列）
    pub fn created(&self) -> Option<&str> {
        self.fields.get("created").and_then(|v| v.as_str())
    }

    /// 課題の最終更新日時（生文字列）
    pub fn updated(&self) -> Option<&str> {
        self.fields.get("updated").and_then(|v| v.as_str())
    }
}

/// changelog展開（`expand=changelog` 付きの検索結果に含まれる）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Changelog {
    #[serde(rename = "startAt")]
    #[serde(default)]
    pub start_at: u32,
    #[serde(rename = "maxResults")]
    #[serde(default)]
    pub max_results: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub histories: Vec<History>,
}

/// 1回の変更操作の記録（同時に複数フィールドが変わりうる）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,
    /// 変更時刻。欠落した不正エントリはスキップ対象になるためOption。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub items: Vec<HistoryItem>,
}

/// フィールド単位のbefore/afterペア
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoryItem {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "fromString")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "toString")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_string: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_issue_deserialization() {
        let json_data = json!({
            "id": "10000",
            "key": "TEST-1",
            "self": "https://example.atlassian.net/rest/api/3/issue/10000",
            "fields": {
                "summary": "Test Issue",
                "issuetype": { "id": "1", "name": "Bug" },
                "created": "2024-01-01T00:00:00.000+0000",
                "updated": "2024-01-02T00:00:00.000+0000",
                "customfield_10016": 5.0
            }
        });

        let issue: Issue = serde_json::from_value(json_data).unwrap();

        assert_eq!(issue.id, "10000");
        assert_eq!(issue.key, "TEST-1");
        assert_eq!(issue.created(), Some("2024-01-01T00:00:00.000+0000"));
        assert_eq!(issue.updated(), Some("2024-01-02T00:00:00.000+0000"));
        assert_eq!(
            issue.field("issuetype").and_then(|v| v.get("id")),
            Some(&json!("1"))
        );
        assert!(issue.changelog.is_none());
    }

    #[test]
    fn test_changelog_deserialization() {
        let json_data = json!({
            "startAt": 0,
            "maxResults": 100,
            "total": 1,
            "histories": [
                {
                    "id": "900",
                    "author": {
                        "accountId": "user123",
                        "displayName": "Test User"
                    },
                    "created": "2024-01-15T10:30:00.000+0000",
                    "items": [
                        {
                            "field": "status",
                            "from": "1",
                            "fromString": "Open",
                            "to": "3",
                            "toString": "In Progress"
                        }
                    ]
                }
            ]
        });

        let changelog: Changelog = serde_json::from_value(json_data).unwrap();

        assert_eq!(changelog.histories.len(), 1);
        let history = &changelog.histories[0];
        assert_eq!(history.created.as_deref(), Some("2024-01-15T10:30:00.000+0000"));
        assert_eq!(history.items[0].field, "status");
        assert_eq!(history.items[0].from.as_deref(), Some("1"));
        assert_eq!(history.items[0].to_string.as_deref(), Some("In Progress"));
    }

    #[test]
    fn test_history_without_created_is_accepted() {
        // createdが無い不正エントリもデシリアライズ自体は通る（スキップは復元側の責務）
        let json_data = json!({
            "id": "901",
            "items": [ { "field": "description" } ]
        });

        let history: History = serde_json::from_value(json_data).unwrap();
        assert!(history.created.is_none());
        assert!(history.author.is_none());
    }
}
