use async_trait::async_trait;
use log::warn;
use serde_json::Value;

use crate::client::JiraClient;
use crate::models::Issue;
use crate::table::{DedupPolicy, Row, TableStore};
use crate::typecast::EMPTY;
use crate::{Error, Result};

/// 課題1件から複数行を生成する特殊パーサー
///
/// スカラーフィールドと違い、課題テーブルには値を出さず
/// リンクテーブルへの書き込みだけを行う。
#[async_trait]
pub trait SpecialParser: Send + Sync {
    /// パーサーID
    fn name(&self) -> &'static str;

    /// 書き込み先テーブルを登録する
    fn register(&self, tables: &mut TableStore) -> Result<()>;

    /// 課題から行を抽出してテーブルへ書き込む
    fn collect(&self, issue: &Issue, tables: &mut TableStore) -> Result<()>;

    /// 収集前の参照データ取得（必要なパーサーのみ実装）
    async fn prefetch(&self, _client: &JiraClient, _tables: &mut TableStore) -> Result<()> {
        Ok(())
    }
}

/// IDから特殊パーサーを構築する
pub fn build_special(id: &str, table: Option<String>) -> Result<Box<dyn SpecialParser>> {
    match id {
        "components" => Ok(Box::new(ComponentsParser {
            table: table.unwrap_or_else(|| "component".to_string()),
        })),
        "links" => Ok(Box::new(LinksParser {
            table: table.unwrap_or_else(|| "link".to_string()),
        })),
        "subtasks" => Ok(Box::new(SubtasksParser {
            table: table.unwrap_or_else(|| "subtask".to_string()),
        })),
        other => Err(Error::InvalidConfiguration(format!(
            "Unknown special parser: {}",
            other
        ))),
    }
}

fn str_of(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| EMPTY.to_string())
}

/// components配列を課題×コンポーネントのリンク行に展開する
pub struct ComponentsParser {
    table: String,
}

impl ComponentsParser {
    fn row(&self, issue: &Issue, component: &Value) -> Row {
        let mut row = Row::new();
        row.insert("issue_id".to_string(), issue.id.clone());
        row.insert(
            "component_id".to_string(),
            str_of(component.get("id")),
        );
        row.insert("component".to_string(), str_of(component.get("name")));
        row
    }
}

#[async_trait]
impl SpecialParser for ComponentsParser {
    fn name(&self) -> &'static str {
        "components"
    }

    fn register(&self, tables: &mut TableStore) -> Result<()> {
        tables.register(
            &self.table,
            DedupPolicy::Link(vec!["issue_id".to_string(), "component_id".to_string()]),
        )
    }

    fn collect(&self, issue: &Issue, tables: &mut TableStore) -> Result<()> {
        let Some(Value::Array(components)) = issue.field("components") else {
            return Ok(());
        };
        for component in components {
            tables.append(&self.table, self.row(issue, component))?;
        }
        Ok(())
    }
}

/// issuelinks配列を課題間の関係行に展開する
///
/// 関係名はrelationshipテーブル（リンク種別マスタ）から解決する。
/// インラインのリンク種別オブジェクトも同じテーブルに取り込むため、
/// マスタ取得に失敗していても収集自体は劣化しつつ継続できる。
pub struct LinksParser {
    table: String,
}

impl LinksParser {
    /// リンク種別と方向から関係名を解決する
    fn resolve_relation(
        &self,
        link_type: &Value,
        direction: &str,
        tables: &mut TableStore,
    ) -> Result<Option<String>> {
        if let Some(name) = link_type.get("name").and_then(Value::as_str) {
            // 埋め込みのリンク種別はマスタに反映しておく（キー重複排除）
            let mut row = Row::new();
            row.insert("id".to_string(), str_of(link_type.get("id")));
            row.insert("name".to_string(), name.to_string());
            row.insert("inward".to_string(), str_of(link_type.get("inward")));
            row.insert("outward".to_string(), str_of(link_type.get("outward")));
            tables.append("relationship", row)?;
            return Ok(Some(name.to_string()));
        }

        // 種別名が無い場合は方向の説明文でマスタを引く
        let found = tables
            .get("relationship")
            .unwrap_or_default()
            .into_iter()
            .find(|row| {
                row.get("inward").map(String::as_str) == Some(direction)
                    || row.get("outward").map(String::as_str) == Some(direction)
            })
            .and_then(|row| row.get("name").cloned());
        Ok(found)
    }
}

#[async_trait]
impl SpecialParser for LinksParser {
    fn name(&self) -> &'static str {
        "links"
    }

    fn register(&self, tables: &mut TableStore) -> Result<()> {
        tables.register("relationship", DedupPolicy::Key("id".to_string()))?;
        tables.register(
            &self.table,
            DedupPolicy::Link(vec![
                "issue_id".to_string(),
                "relation".to_string(),
                "issue_to".to_string(),
            ]),
        )
    }

    fn collect(&self, issue: &Issue, tables: &mut TableStore) -> Result<()> {
        let Some(Value::Array(links)) = issue.field("issuelinks") else {
            return Ok(());
        };
        for link in links {
            // 外向き・内向きのどちらか片方だけが埋まっている
            let (other, direction_attr) = if link.get("outwardIssue").is_some() {
                (link.get("outwardIssue"), "outward")
            } else if link.get("inwardIssue").is_some() {
                (link.get("inwardIssue"), "inward")
            } else {
                warn!(
                    "Issue {} has a link without a target issue; skipping",
                    issue.key
                );
                continue;
            };

            let Some(link_type) = link.get("type") else {
                warn!("Issue {} has a link without a type; skipping", issue.key);
                continue;
            };
            let direction = str_of(link_type.get(direction_attr));
            let Some(relation) = self.resolve_relation(link_type, &direction, tables)? else {
                warn!(
                    "Issue {} link relation '{}' not found in relationship table; skipping",
                    issue.key, direction
                );
                continue;
            };

            let mut row = Row::new();
            row.insert("issue_id".to_string(), issue.id.clone());
            row.insert("relation".to_string(), relation);
            row.insert(
                "issue_to".to_string(),
                str_of(other.and_then(|o| o.get("key"))),
            );
            tables.append(&self.table, row)?;
        }
        Ok(())
    }

    async fn prefetch(&self, client: &JiraClient, tables: &mut TableStore) -> Result<()> {
        let body = match client.get_json("/rest/api/3/issueLinkType").await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to prefetch issue link types: {}", e);
                return Ok(());
            }
        };
        let Some(Value::Array(link_types)) = body.get("issueLinkTypes") else {
            return Ok(());
        };
        for link_type in link_types {
            let mut row = Row::new();
            row.insert("id".to_string(), str_of(link_type.get("id")));
            row.insert("name".to_string(), str_of(link_type.get("name")));
            row.insert("inward".to_string(), str_of(link_type.get("inward")));
            row.insert("outward".to_string(), str_of(link_type.get("outward")));
            tables.append("relationship", row)?;
        }
        Ok(())
    }
}

/// subtasks配列を親子リンク行に展開する
pub struct SubtasksParser {
    table: String,
}

#[async_trait]
impl SpecialParser for SubtasksParser {
    fn name(&self) -> &'static str {
        "subtasks"
    }

    fn register(&self, tables: &mut TableStore) -> Result<()> {
        tables.register(
            &self.table,
            DedupPolicy::Link(vec!["issue_id".to_string(), "subtask_id".to_string()]),
        )
    }

    fn collect(&self, issue: &Issue, tables: &mut TableStore) -> Result<()> {
        let Some(Value::Array(subtasks)) = issue.field("subtasks") else {
            return Ok(());
        };
        for subtask in subtasks {
            let mut row = Row::new();
            row.insert("issue_id".to_string(), issue.id.clone());
            row.insert("subtask_id".to_string(), str_of(subtask.get("id")));
            row.insert("subtask_key".to_string(), str_of(subtask.get("key")));
            tables.append(&self.table, row)?;
        }
        Ok(())
    }
}
