use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::models::Issue;
use crate::special::{self, SpecialParser};
use crate::table::{DedupPolicy, Row, TableStore};
use crate::typecast::{self, TypeCast, TypeCastRegistry};
use crate::{Error, Result};

/// フィールド1件分の宣言的定義
///
/// 設定ファイルのエントリをそのままデシリアライズする。ロード後は不変。
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct FieldSpec {
    /// 課題トップレベル属性（id / key / self）
    #[serde(default)]
    pub primary: Option<String>,
    /// ペイロード属性名
    #[serde(default)]
    pub field: Option<String>,
    /// ペイロード属性内のサブプロパティ名
    #[serde(default)]
    pub property: Option<String>,
    /// 適用する型キャストの連鎖
    #[serde(rename = "type")]
    #[serde(default)]
    pub types: Option<TypeChain>,
    /// テーブル登録メタデータ
    #[serde(default)]
    pub table: Option<TableSpec>,
    /// changelogエントリ由来の値（author等）
    #[serde(default)]
    pub changelog_primary: Option<String>,
    /// changelog項目でのフィールド表示名
    #[serde(default)]
    pub changelog_name: Option<String>,
    /// 複数値フィールド用の特殊パーサーID
    #[serde(default)]
    pub special_parser: Option<String>,
}

/// `type` は単一IDとIDリストの両方を受け付ける
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TypeChain {
    One(String),
    Many(Vec<String>),
}

impl TypeChain {
    pub fn ids(&self) -> Vec<&str> {
        match self {
            TypeChain::One(id) => vec![id.as_str()],
            TypeChain::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// `table` はテーブル名参照とインラインのカラム→型マップの両方を受け付ける
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TableSpec {
    Name(String),
    Columns(BTreeMap<String, String>),
}

/// 定義から解決されたフィールドの実体
pub enum Resolved {
    /// 課題1件につきスカラー値を1つ生成するフィールド
    Scalar(Field),
    /// 複数値フィールド（components / links / subtasks）
    Special(Box<dyn SpecialParser>),
    /// changelog項目から復元されるフィールド（エンジンに登録する）
    ChangelogItem {
        name: String,
        label: String,
        casts: Vec<Arc<dyn TypeCast>>,
    },
    /// changelogエントリ自体から取り出す値（author等）
    ChangelogPrimary { name: String, source: String },
}

/// 課題レコードから値を取り出すランタイムオブジェクト
///
/// 構築したCollectorが専有する。課題間で状態は持たず、書き込む
/// 補助テーブルだけを共有する。
pub enum Field {
    /// 課題トップレベル属性
    Primary {
        name: String,
        attr: String,
        casts: Vec<Arc<dyn TypeCast>>,
    },
    /// ペイロード属性
    Payload {
        name: String,
        attr: String,
        casts: Vec<Arc<dyn TypeCast>>,
        detail: Option<DetailTable>,
        value_table: Option<String>,
    },
    /// ペイロード属性のサブプロパティ
    Property {
        name: String,
        attr: String,
        property: String,
        casts: Vec<Arc<dyn TypeCast>>,
        detail: Option<DetailTable>,
    },
}

/// インラインのカラムマップから構築された明細テーブル書き込み
///
/// 1つのフィールドがスカラー値と非正規化された明細行を同時に
/// 生成できるようにする（fix version参照など）。
pub struct DetailTable {
    table: String,
    columns: Vec<(String, Arc<dyn TypeCast>)>,
}

impl DetailTable {
    /// 生値（オブジェクトまたはその配列）から明細行を書き込む
    fn write(&self, raw: &Value, tables: &mut TableStore) -> Result<()> {
        let items: Vec<&Value> = match raw {
            Value::Array(items) => items.iter().collect(),
            Value::Null => return Ok(()),
            other => vec![other],
        };
        for item in items {
            if item.is_null() {
                continue;
            }
            let mut row = Row::new();
            for (column, cast) in &self.columns {
                row.insert(column.clone(), cast.parse(item.get(column), tables)?);
            }
            tables.append(&self.table, row)?;
        }
        Ok(())
    }
}

impl Field {
    pub fn name(&self) -> &str {
        match self {
            Field::Primary { name, .. }
            | Field::Payload { name, .. }
            | Field::Property { name, .. } => name,
        }
    }

    pub fn casts(&self) -> &[Arc<dyn TypeCast>] {
        match self {
            Field::Primary { casts, .. }
            | Field::Payload { casts, .. }
            | Field::Property { casts, .. } => casts,
        }
    }

    /// 課題から値を取り出して正規化する
    ///
    /// 参照系キャストと明細テーブルの書き込みはここの副作用として起きる。
    pub fn collect(&self, issue: &Issue, tables: &mut TableStore) -> Result<(String, String)> {
        match self {
            Field::Primary { name, attr, casts } => {
                let raw = match attr.as_str() {
                    "id" => Some(Value::String(issue.id.clone())),
                    "key" => Some(Value::String(issue.key.clone())),
                    "self" => Some(Value::String(issue.self_url.clone())),
                    other => issue.field(other).cloned(),
                };
                let value = typecast::apply_casts(casts, raw.as_ref(), tables)?;
                Ok((name.clone(), value))
            }
            Field::Payload {
                name,
                attr,
                casts,
                detail,
                value_table,
            } => {
                let raw = issue.field(attr);
                if let (Some(detail), Some(raw)) = (detail, raw) {
                    detail.write(raw, tables)?;
                }
                let value = typecast::apply_casts(casts, raw, tables)?;
                if let Some(table) = value_table {
                    let mut row = Row::new();
                    row.insert("issue_id".to_string(), issue.id.clone());
                    row.insert(name.clone(), value.clone());
                    tables.append(table, row)?;
                }
                Ok((name.clone(), value))
            }
            Field::Property {
                name,
                attr,
                property,
                casts,
                detail,
            } => {
                let parent = issue.field(attr);
                if let (Some(detail), Some(parent)) = (detail, parent) {
                    detail.write(parent, tables)?;
                }
                let raw = parent.and_then(|v| v.get(property));
                let value = typecast::apply_casts(casts, raw, tables)?;
                Ok((name.clone(), value))
            }
        }
    }
}

fn spec_error(name: &str, reason: impl Into<String>) -> Error {
    Error::InvalidFieldSpec {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// フィールド定義の整合性を検証する
pub fn validate(name: &str, spec: &FieldSpec) -> Result<()> {
    let origins = [
        spec.primary.is_some(),
        spec.field.is_some(),
        spec.changelog_primary.is_some(),
        spec.special_parser.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();

    if origins > 1 {
        return Err(spec_error(name, "more than one origin key present"));
    }
    if origins == 0 && spec.changelog_name.is_none() {
        return Err(spec_error(name, "no resolvable origin"));
    }
    // changelog_nameはpayloadフィールドへの注記としてのみ併用できる
    if spec.changelog_name.is_some()
        && (spec.primary.is_some()
            || spec.changelog_primary.is_some()
            || spec.special_parser.is_some())
    {
        return Err(spec_error(
            name,
            "changelog_name can only accompany a payload field",
        ));
    }
    if spec.property.is_some() && spec.field.is_none() {
        return Err(spec_error(name, "property requires field"));
    }
    if spec.primary.is_some() && spec.table.is_some() {
        return Err(spec_error(name, "primary fields cannot register tables"));
    }
    Ok(())
}

fn resolve_casts(
    spec: &FieldSpec,
    registry: &TypeCastRegistry,
    tables: &mut TableStore,
) -> Result<Vec<Arc<dyn TypeCast>>> {
    let mut casts = Vec::new();
    if let Some(chain) = &spec.types {
        for id in chain.ids() {
            let cast = registry.get(id)?;
            if let Some((table, policy)) = cast.side_table() {
                tables.register(table, policy)?;
            }
            casts.push(cast);
        }
    }
    Ok(casts)
}

/// 定義エントリを解決する
///
/// payloadフィールドにchangelog_nameが併記されている場合、スカラー
/// フィールドとchangelog登録の両方を返す。
pub fn resolve_field(
    name: &str,
    spec: &FieldSpec,
    registry: &TypeCastRegistry,
    tables: &mut TableStore,
) -> Result<Vec<Resolved>> {
    validate(name, spec)?;

    if let Some(parser_id) = &spec.special_parser {
        let table = match &spec.table {
            Some(TableSpec::Name(table)) => Some(table.clone()),
            _ => None,
        };
        return Ok(vec![Resolved::Special(special::build_special(
            parser_id, table,
        )?)]);
    }

    if let Some(source) = &spec.changelog_primary {
        return Ok(vec![Resolved::ChangelogPrimary {
            name: name.to_string(),
            source: source.clone(),
        }]);
    }

    let casts = resolve_casts(spec, registry, tables)?;

    if let Some(attr) = &spec.primary {
        return Ok(vec![Resolved::Scalar(Field::Primary {
            name: name.to_string(),
            attr: attr.clone(),
            casts,
        })]);
    }

    if let Some(attr) = &spec.field {
        let mut detail = None;
        let mut value_table = None;
        match &spec.table {
            Some(TableSpec::Columns(columns)) => {
                let mut resolved_columns = Vec::new();
                for (column, type_id) in columns {
                    let cast = registry.get(type_id)?;
                    if let Some((table, policy)) = cast.side_table() {
                        tables.register(table, policy)?;
                    }
                    resolved_columns.push((column.clone(), cast));
                }
                register_table(tables, name, columns)?;
                detail = Some(DetailTable {
                    table: name.to_string(),
                    columns: resolved_columns,
                });
            }
            Some(TableSpec::Name(table)) => {
                tables.register(table, DedupPolicy::None)?;
                value_table = Some(table.clone());
            }
            None => {}
        }

        let field = match &spec.property {
            Some(property) => Field::Property {
                name: name.to_string(),
                attr: attr.clone(),
                property: property.clone(),
                casts: casts.clone(),
                detail,
            },
            None => Field::Payload {
                name: name.to_string(),
                attr: attr.clone(),
                casts: casts.clone(),
                detail,
                value_table,
            },
        };

        let mut resolved = vec![Resolved::Scalar(field)];
        if let Some(label) = &spec.changelog_name {
            resolved.push(Resolved::ChangelogItem {
                name: name.to_string(),
                label: label.clone(),
                casts,
            });
        }
        return Ok(resolved);
    }

    // changelog専用フィールド（current状態の取得元を持たない）
    if let Some(label) = &spec.changelog_name {
        return Ok(vec![Resolved::ChangelogItem {
            name: name.to_string(),
            label: label.clone(),
            casts,
        }]);
    }

    Err(spec_error(name, "no resolvable origin"))
}

/// インラインカラムマップからテーブルの重複排除方針を決める
///
/// idカラムがあればキー重複排除、無ければ全カラムの組での重複排除。
fn register_table(
    tables: &mut TableStore,
    name: &str,
    columns: &BTreeMap<String, String>,
) -> Result<()> {
    let policy = if columns.contains_key("id") {
        DedupPolicy::Key("id".to_string())
    } else {
        DedupPolicy::Link(columns.keys().cloned().collect())
    };
    tables.register(name, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typecast::EMPTY;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> FieldSpec {
        serde_json::from_value(value).unwrap()
    }

    fn issue() -> Issue {
        serde_json::from_value(json!({
            "id": "10000",
            "key": "TEST-1",
            "self": "https://example.atlassian.net/rest/api/3/issue/10000",
            "fields": {
                "summary": "A bug",
                "issuetype": { "id": "5", "name": "Story" },
                "status": { "id": "3", "name": "In Progress" },
                "fixVersions": [
                    { "id": "100", "name": "1.0", "released": true }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_spec_deserialization_variants() {
        let single = spec(json!({ "field": "issuetype", "type": "id" }));
        assert_eq!(single.types, Some(TypeChain::One("id".to_string())));

        let chained = spec(json!({ "field": "issuetype", "type": ["id", "integer"] }));
        assert_eq!(
            chained.types,
            Some(TypeChain::Many(vec!["id".to_string(), "integer".to_string()]))
        );

        let with_map = spec(json!({ "field": "fixVersions", "table": { "id": "string" } }));
        assert!(matches!(with_map.table, Some(TableSpec::Columns(_))));

        let with_name = spec(json!({ "field": "labels", "table": "label" }));
        assert!(matches!(with_name.table, Some(TableSpec::Name(_))));
    }

    #[test]
    fn test_validation_rejects_ambiguous_origins() {
        assert!(validate("x", &spec(json!({ "primary": "id", "field": "status" }))).is_err());
        assert!(validate("x", &spec(json!({ "field": "status", "special_parser": "links" }))).is_err());
        assert!(validate("x", &spec(json!({}))).is_err());
        assert!(validate("x", &spec(json!({ "property": "name" }))).is_err());
        assert!(validate("x", &spec(json!({ "primary": "id", "table": "t" }))).is_err());
        assert!(validate("x", &spec(json!({ "changelog_primary": "author", "changelog_name": "a" }))).is_err());

        assert!(validate("x", &spec(json!({ "primary": "id" }))).is_ok());
        assert!(validate("x", &spec(json!({ "field": "status", "changelog_name": "status" }))).is_ok());
        assert!(validate("x", &spec(json!({ "changelog_name": "Attachment" }))).is_ok());
    }

    #[test]
    fn test_primary_field_collect() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved =
            resolve_field("issue_id", &spec(json!({ "primary": "id" })), &registry, &mut tables)
                .unwrap();

        let Resolved::Scalar(field) = &resolved[0] else {
            panic!("expected scalar field");
        };
        let (name, value) = field.collect(&issue(), &mut tables).unwrap();
        assert_eq!(name, "issue_id");
        assert_eq!(value, "10000");
    }

    #[test]
    fn test_payload_field_with_cast() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved = resolve_field(
            "issuetype",
            &spec(json!({ "field": "issuetype", "type": "id" })),
            &registry,
            &mut tables,
        )
        .unwrap();

        let Resolved::Scalar(field) = &resolved[0] else {
            panic!("expected scalar field");
        };
        let (_, value) = field.collect(&issue(), &mut tables).unwrap();
        assert_eq!(value, "5");
    }

    #[test]
    fn test_property_field_collect() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved = resolve_field(
            "status_name",
            &spec(json!({ "field": "status", "property": "name" })),
            &registry,
            &mut tables,
        )
        .unwrap();

        let Resolved::Scalar(field) = &resolved[0] else {
            panic!("expected scalar field");
        };
        let (_, value) = field.collect(&issue(), &mut tables).unwrap();
        assert_eq!(value, "In Progress");
    }

    #[test]
    fn test_missing_payload_yields_sentinel() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved = resolve_field(
            "missing",
            &spec(json!({ "field": "nonexistent", "type": "id" })),
            &registry,
            &mut tables,
        )
        .unwrap();

        let Resolved::Scalar(field) = &resolved[0] else {
            panic!("expected scalar field");
        };
        let (_, value) = field.collect(&issue(), &mut tables).unwrap();
        assert_eq!(value, EMPTY);
    }

    #[test]
    fn test_inline_table_writes_detail_rows() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved = resolve_field(
            "fix_version",
            &spec(json!({
                "field": "fixVersions",
                "type": "id",
                "table": { "id": "string", "name": "string", "released": "flag" }
            })),
            &registry,
            &mut tables,
        )
        .unwrap();

        let Resolved::Scalar(field) = &resolved[0] else {
            panic!("expected scalar field");
        };

        // スカラー値（配列は素通しなのでidキャストは番兵を返す）と明細行の両方が出る
        field.collect(&issue(), &mut tables).unwrap();
        let rows = tables.get("fix_version").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "100");
        assert_eq!(rows[0]["name"], "1.0");
        assert_eq!(rows[0]["released"], "1");

        // 同じバージョンはidで重複排除される
        field.collect(&issue(), &mut tables).unwrap();
        assert_eq!(tables.len("fix_version"), 1);
    }

    #[test]
    fn test_changelog_only_spec_resolves_to_engine_registration() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved = resolve_field(
            "attachment",
            &spec(json!({ "changelog_name": "Attachment", "type": "count" })),
            &registry,
            &mut tables,
        )
        .unwrap();

        assert_eq!(resolved.len(), 1);
        assert!(matches!(
            &resolved[0],
            Resolved::ChangelogItem { name, label, .. }
                if name == "attachment" && label == "Attachment"
        ));
    }

    #[test]
    fn test_payload_with_changelog_name_resolves_to_both() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let resolved = resolve_field(
            "fix_version",
            &spec(json!({
                "field": "fixVersions",
                "type": "version",
                "changelog_name": "Fix Version"
            })),
            &registry,
            &mut tables,
        )
        .unwrap();

        assert_eq!(resolved.len(), 2);
        assert!(matches!(&resolved[0], Resolved::Scalar(_)));
        assert!(matches!(&resolved[1], Resolved::ChangelogItem { .. }));
        // versionキャストの補助テーブルも登録済み
        assert!(tables.contains("version"));
    }

    #[test]
    fn test_unknown_cast_id_is_fatal() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let result = resolve_field(
            "x",
            &spec(json!({ "field": "x", "type": "no_such_cast" })),
            &registry,
            &mut tables,
        );
        assert!(matches!(result, Err(Error::UnknownTypeCast(_))));
    }
}
