use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::field::FieldSpec;
use crate::Result;

/// 標準の抽出プロファイル
///
/// 一般的なJIRAプロジェクトのフィールド構成をそのまま使える定義。
/// カスタムフィールドIDはAtlassian Cloudの既定値。
const DEFAULT_PROFILE_JSON: &str = r#"{
    "jql": "order by updated DESC",
    "fields": {
        "issue_id": { "primary": "id" },
        "key": { "primary": "key" },
        "created": { "field": "created", "type": "date" },
        "updated": { "field": "updated", "type": "date" },
        "updated_by": { "changelog_primary": "author" },
        "issuetype": { "field": "issuetype", "type": "id" },
        "status": { "field": "status", "type": "status_category", "changelog_name": "status" },
        "priority": { "field": "priority", "type": "id" },
        "assignee": { "field": "assignee", "type": "developer", "changelog_name": "assignee" },
        "reporter": { "field": "reporter", "type": "developer" },
        "summary": { "field": "summary", "type": "text" },
        "description": { "field": "description", "type": "text" },
        "story_points": { "field": "customfield_10016", "type": "decimal" },
        "labels": { "field": "labels", "type": "labels", "changelog_name": "labels" },
        "fix_version": { "field": "fixVersions", "type": "version", "changelog_name": "Fix Version" },
        "sprint": { "field": "customfield_10020", "type": "sprint", "changelog_name": "Sprint" },
        "project": { "field": "project", "type": "project" },
        "attachment": { "field": "attachment", "type": "count", "changelog_name": "Attachment" },
        "rank": { "field": "customfield_10019", "type": "rank", "changelog_name": "Rank" },
        "epic_link": { "field": "customfield_10014", "type": "key" },
        "parent": { "field": "parent", "type": "id", "table": { "id": "string", "key": "string" } },
        "components": { "special_parser": "components" },
        "links": { "special_parser": "links" },
        "subtasks": { "special_parser": "subtasks" }
    }
}"#;

/// 抽出実行の設定一式
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExtractProfile {
    /// 課題の検索クエリ
    #[serde(default)]
    pub jql: String,
    /// 増分実行の下限時刻（前回実行のlatest_updated）
    #[serde(default)]
    pub updated_since: Option<String>,
    /// 出力名→フィールド定義
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ExtractProfile {
    /// JSON文字列からロード
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 設定ファイルからロード
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 標準プロファイル
    pub fn default_profile() -> Result<Self> {
        Self::from_json_str(DEFAULT_PROFILE_JSON)
    }

    /// 増分実行の下限時刻を設定
    pub fn updated_since(mut self, timestamp: impl Into<String>) -> Self {
        self.updated_since = Some(timestamp.into());
        self
    }
}
