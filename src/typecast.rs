use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde_json::Value;

use crate::client::JiraClient;
use crate::models::HistoryItem;
use crate::table::{DedupPolicy, Row, TableStore};
use crate::timestamp::{parse_jira_datetime, to_canonical};
use crate::{Error, Result};

/// 欠落値の正規化表現
///
/// テーブルストアとdiffマージは常に比較可能な値を前提にするため、
/// null・欠落はこの番兵値に正規化する。
pub const EMPTY: &str = "0";

/// changelog項目から復元された変更前の値
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    /// 上書きで巻き戻す値
    Set(String),
    /// 加算型フィールド（attachment数など）の符号付き増分。
    /// 巻き戻し時は現在値から減算する。
    Delta(i64),
    /// 変更そのものの注記（rank方向など）。過去の行へは巻き戻さない。
    Event(String),
}

/// 生のAPI値を正規化文字列へ変換するパーサー
///
/// `parse` はそのフィールド型でAPIが返しうる全値域に対して全域でなければ
/// ならない。参照系のキャストは副作用として補助テーブルへ行を書き込む。
#[async_trait]
pub trait TypeCast: Send + Sync {
    /// 型キャストID（フィールド定義の `type` で指定される）
    fn id(&self) -> &'static str;

    /// 現在状態の値を正規化文字列へ変換
    fn parse(&self, raw: Option<&Value>, tables: &mut TableStore) -> Result<String>;

    /// changelog項目から変更前の値を復元
    ///
    /// Noneを返した項目はスキップされる（解決不能な参照など）。
    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        Some(ChangeValue::Set(
            item.from
                .clone()
                .or_else(|| item.from_string.clone())
                .unwrap_or_else(|| EMPTY.to_string()),
        ))
    }

    /// 補助テーブルを一括取得APIから先読みする
    ///
    /// changelogはIDしか運ばないことが多く、説明行は先にキャッシュ
    /// しておく必要がある。実行ごとにパーサーあたり1回だけ呼ばれる。
    async fn prefetch(&self, _client: &JiraClient, _tables: &mut TableStore) -> Result<()> {
        Ok(())
    }

    /// このキャストが所有する補助テーブル
    fn side_table(&self) -> Option<(&'static str, DedupPolicy)> {
        None
    }
}

/// 実行ごとに1つ構築される型キャストのカタログ
pub struct TypeCastRegistry {
    casts: HashMap<&'static str, Arc<dyn TypeCast>>,
}

impl TypeCastRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            casts: HashMap::new(),
        };
        registry.insert(Arc::new(StringCast));
        registry.insert(Arc::new(IntegerCast));
        registry.insert(Arc::new(DecimalCast));
        registry.insert(Arc::new(FlagCast));
        registry.insert(Arc::new(DateCast));
        registry.insert(Arc::new(TextCast));
        registry.insert(Arc::new(IdCast));
        registry.insert(Arc::new(KeyCast));
        registry.insert(Arc::new(LabelCountCast));
        registry.insert(Arc::new(ItemCountCast));
        registry.insert(Arc::new(RankCast));
        registry.insert(Arc::new(DeveloperCast));
        registry.insert(Arc::new(VersionCast));
        registry.insert(Arc::new(ProjectCast));
        registry.insert(Arc::new(SprintCast));
        registry.insert(Arc::new(StatusCategoryCast));
        registry
    }

    fn insert(&mut self, cast: Arc<dyn TypeCast>) {
        self.casts.insert(cast.id(), cast);
    }

    /// IDでキャストを引く。未知のIDは設定エラー。
    pub fn get(&self, id: &str) -> Result<Arc<dyn TypeCast>> {
        self.casts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTypeCast(id.to_string()))
    }
}

impl Default for TypeCastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// キャスト連鎖を順に適用する
///
/// 2つ目以降のキャストは直前の正規化文字列を入力として受け取る。
pub fn apply_casts(
    casts: &[Arc<dyn TypeCast>],
    raw: Option<&Value>,
    tables: &mut TableStore,
) -> Result<String> {
    let Some(first) = casts.first() else {
        return Ok(raw.map(value_to_string).unwrap_or_else(|| EMPTY.to_string()));
    };
    let mut value = first.parse(raw, tables)?;
    for cast in &casts[1..] {
        let wrapped = Value::String(value);
        value = cast.parse(Some(&wrapped), tables)?;
    }
    Ok(value)
}

/// changelog項目の変更前値をキャスト連鎖で復元する
///
/// 連鎖の最終キャストが値の意味を決めるため、そのキャストに委譲する。
pub fn changelog_value(
    casts: &[Arc<dyn TypeCast>],
    item: &HistoryItem,
    tables: &TableStore,
) -> Option<ChangeValue> {
    match casts.last() {
        Some(cast) => cast.parse_changelog(item, tables),
        None => Some(ChangeValue::Set(
            item.from
                .clone()
                .or_else(|| item.from_string.clone())
                .unwrap_or_else(|| EMPTY.to_string()),
        )),
    }
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => EMPTY.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| EMPTY.to_string()),
    }
}

fn object_str(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .map(value_to_string)
        .unwrap_or_else(|| EMPTY.to_string())
}

fn flag_of(raw: Option<&Value>) -> &'static str {
    match raw {
        None | Some(Value::Null) => "0",
        Some(Value::Bool(b)) => {
            if *b {
                "1"
            } else {
                "0"
            }
        }
        Some(Value::Number(n)) => {
            if n.as_f64().unwrap_or(0.0) != 0.0 {
                "1"
            } else {
                "0"
            }
        }
        Some(Value::String(s)) => {
            if s.is_empty() || s == "false" || s == EMPTY {
                "0"
            } else {
                "1"
            }
        }
        Some(Value::Array(items)) => {
            if items.is_empty() {
                "0"
            } else {
                "1"
            }
        }
        Some(Value::Object(_)) => "1",
    }
}

fn date_of(raw: Option<&Value>) -> String {
    match raw.and_then(|v| v.as_str()) {
        Some(s) => match parse_jira_datetime(s) {
            Ok(dt) => to_canonical(&dt),
            Err(_) => EMPTY.to_string(),
        },
        None => EMPTY.to_string(),
    }
}

/// そのままの文字列表現
pub struct StringCast;

#[async_trait]
impl TypeCast for StringCast {
    fn id(&self) -> &'static str {
        "string"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        Ok(raw.map(value_to_string).unwrap_or_else(|| EMPTY.to_string()))
    }
}

/// 整数文字列へ正規化
pub struct IntegerCast;

#[async_trait]
impl TypeCast for IntegerCast {
    fn id(&self) -> &'static str {
        "integer"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        let n: i64 = match raw {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
            Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
            Some(Value::Bool(true)) => 1,
            _ => 0,
        };
        Ok(n.to_string())
    }
}

/// 小数点付き数値文字列へ正規化（整数値は整数表記のまま）
pub struct DecimalCast;

#[async_trait]
impl TypeCast for DecimalCast {
    fn id(&self) -> &'static str {
        "decimal"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(i.to_string())
                } else {
                    Ok(n.as_f64().unwrap_or(0.0).to_string())
                }
            }
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(f) if f.fract() == 0.0 => Ok((f as i64).to_string()),
                Ok(f) => Ok(f.to_string()),
                Err(_) => Ok(EMPTY.to_string()),
            },
            _ => Ok(EMPTY.to_string()),
        }
    }
}

/// 真偽値フラグを "1"/"0" へ正規化
pub struct FlagCast;

#[async_trait]
impl TypeCast for FlagCast {
    fn id(&self) -> &'static str {
        "flag"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        Ok(flag_of(raw).to_string())
    }
}

/// JIRA日時を正規化フォーマットへ変換
pub struct DateCast;

#[async_trait]
impl TypeCast for DateCast {
    fn id(&self) -> &'static str {
        "date"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        Ok(date_of(raw))
    }

    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        let raw = item.from.clone().or_else(|| item.from_string.clone());
        Some(ChangeValue::Set(
            raw.map(|s| date_of(Some(&Value::String(s))))
                .unwrap_or_else(|| EMPTY.to_string()),
        ))
    }
}

/// 自由記述テキスト。ADF（Atlassian Document Format）はプレーンテキストへ平坦化する。
pub struct TextCast;

impl TextCast {
    fn flatten(value: &Value, out: &mut String) {
        match value {
            Value::String(s) => {
                if !out.is_empty() && !s.is_empty() {
                    out.push(' ');
                }
                out.push_str(s);
            }
            Value::Array(items) => {
                for item in items {
                    Self::flatten(item, out);
                }
            }
            Value::Object(obj) => {
                if let Some(Value::String(text)) = obj.get("text") {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(text);
                }
                if let Some(content) = obj.get("content") {
                    Self::flatten(content, out);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl TypeCast for TextCast {
    fn id(&self) -> &'static str {
        "text"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        match raw {
            None | Some(Value::Null) => Ok(EMPTY.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(v) => {
                let mut out = String::new();
                Self::flatten(v, &mut out);
                if out.is_empty() {
                    Ok(EMPTY.to_string())
                } else {
                    Ok(out)
                }
            }
        }
    }

    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        // テキスト系の変更前値は表示値側に入る
        Some(ChangeValue::Set(
            item.from_string
                .clone()
                .or_else(|| item.from.clone())
                .unwrap_or_else(|| EMPTY.to_string()),
        ))
    }
}

/// ネストオブジェクトの識別子（`{"id": ...}`）を取り出す
pub struct IdCast;

#[async_trait]
impl TypeCast for IdCast {
    fn id(&self) -> &'static str {
        "id"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Object(obj)) => Ok(object_str(obj, "id")),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Ok(EMPTY.to_string()),
        }
    }
}

/// 課題キー参照（epic link、parentなど）
pub struct KeyCast;

#[async_trait]
impl TypeCast for KeyCast {
    fn id(&self) -> &'static str {
        "key"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Object(obj)) => Ok(object_str(obj, "key")),
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Ok(EMPTY.to_string()),
        }
    }
}

/// ラベル数。changelogでは空白区切りのラベル一覧が届く。
pub struct LabelCountCast;

#[async_trait]
impl TypeCast for LabelCountCast {
    fn id(&self) -> &'static str {
        "labels"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Array(items)) => Ok(items.len().to_string()),
            Some(Value::String(s)) => Ok(s.split_whitespace().count().to_string()),
            _ => Ok(EMPTY.to_string()),
        }
    }

    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        let count = item
            .from_string
            .as_deref()
            .map(|s| s.split_whitespace().count())
            .unwrap_or(0);
        Some(ChangeValue::Set(count.to_string()))
    }
}

/// 複数項目フィールドの件数（attachmentなど）
///
/// changelogは絶対値を運ばず追加・削除の事実だけを示すため、
/// 変更前の復元は符号付き増分の減算で行う。
pub struct ItemCountCast;

#[async_trait]
impl TypeCast for ItemCountCast {
    fn id(&self) -> &'static str {
        "count"
    }

    fn parse(&self, raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Array(items)) => Ok(items.len().to_string()),
            Some(Value::Number(n)) => Ok(n.as_i64().unwrap_or(0).to_string()),
            Some(Value::String(s)) => Ok(s.trim().parse::<i64>().unwrap_or(0).to_string()),
            _ => Ok(EMPTY.to_string()),
        }
    }

    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        // toが埋まっていれば追加（+1）、空なら削除（-1）
        if item.to.is_some() || item.to_string.is_some() {
            Some(ChangeValue::Delta(1))
        } else {
            Some(ChangeValue::Delta(-1))
        }
    }
}

/// rank変更の方向。現在状態には絶対値が存在しないため番兵を返す。
pub struct RankCast;

#[async_trait]
impl TypeCast for RankCast {
    fn id(&self) -> &'static str {
        "rank"
    }

    fn parse(&self, _raw: Option<&Value>, _tables: &mut TableStore) -> Result<String> {
        Ok(EMPTY.to_string())
    }

    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        let direction = item.to_string.as_deref().unwrap_or("").to_lowercase();
        if direction.contains("higher") {
            Some(ChangeValue::Event("1".to_string()))
        } else if direction.contains("lower") {
            Some(ChangeValue::Event("-1".to_string()))
        } else {
            warn!(
                "Unrecognized rank direction '{}'; skipping changelog item",
                item.to_string.as_deref().unwrap_or("")
            );
            None
        }
    }
}

/// 開発者参照。accountIdを返し、説明行をdeveloperテーブルへ書く。
pub struct DeveloperCast;

impl DeveloperCast {
    fn record(obj: &serde_json::Map<String, Value>, tables: &mut TableStore) -> Result<String> {
        let id = object_str(obj, "accountId");
        let mut row = Row::new();
        row.insert("id".to_string(), id.clone());
        row.insert("name".to_string(), object_str(obj, "displayName"));
        row.insert("email".to_string(), object_str(obj, "emailAddress"));
        tables.append("developer", row)?;
        Ok(id)
    }
}

#[async_trait]
impl TypeCast for DeveloperCast {
    fn id(&self) -> &'static str {
        "developer"
    }

    fn parse(&self, raw: Option<&Value>, tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Object(obj)) => Self::record(obj, tables),
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Ok(EMPTY.to_string()),
        }
    }

    async fn prefetch(&self, client: &JiraClient, tables: &mut TableStore) -> Result<()> {
        match client.get_json("/rest/api/3/users/search?maxResults=1000").await {
            Ok(data) => {
                for user in data.as_array().map(|a| a.as_slice()).unwrap_or_default() {
                    if let Value::Object(obj) = user {
                        if obj.contains_key("accountId") {
                            Self::record(obj, tables)?;
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("Developer prefetch failed, relying on per-issue values: {}", e);
                Ok(())
            }
        }
    }

    fn side_table(&self) -> Option<(&'static str, DedupPolicy)> {
        Some(("developer", DedupPolicy::Key("id".to_string())))
    }
}

/// バージョン参照（fixVersionsなど）。IDを返し、メタデータ行をversionテーブルへ書く。
pub struct VersionCast;

impl VersionCast {
    fn record(value: &Value, tables: &mut TableStore) -> Result<Option<String>> {
        match value {
            Value::Object(obj) => {
                let id = object_str(obj, "id");
                let mut row = Row::new();
                row.insert("id".to_string(), id.clone());
                row.insert("name".to_string(), object_str(obj, "name"));
                row.insert("released".to_string(), flag_of(obj.get("released")).to_string());
                row.insert("release_date".to_string(), date_of(obj.get("releaseDate")));
                tables.append("version", row)?;
                Ok(Some(id))
            }
            Value::String(s) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl TypeCast for VersionCast {
    fn id(&self) -> &'static str {
        "version"
    }

    fn parse(&self, raw: Option<&Value>, tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Array(items)) => {
                let mut last = EMPTY.to_string();
                for item in items {
                    if let Some(id) = Self::record(item, tables)? {
                        last = id;
                    }
                }
                Ok(last)
            }
            Some(v) => Ok(Self::record(v, tables)?.unwrap_or_else(|| EMPTY.to_string())),
            None => Ok(EMPTY.to_string()),
        }
    }

    async fn prefetch(&self, client: &JiraClient, tables: &mut TableStore) -> Result<()> {
        let projects = match client.get_json("/rest/api/3/project").await {
            Ok(data) => data,
            Err(e) => {
                warn!("Version prefetch failed, relying on per-issue values: {}", e);
                return Ok(());
            }
        };
        for project in projects.as_array().map(|a| a.as_slice()).unwrap_or_default() {
            let Some(key) = project.get("key").and_then(|v| v.as_str()) else {
                continue;
            };
            match client
                .get_json(&format!("/rest/api/3/project/{}/versions", key))
                .await
            {
                Ok(versions) => {
                    for version in versions.as_array().map(|a| a.as_slice()).unwrap_or_default() {
                        Self::record(version, tables)?;
                    }
                }
                Err(e) => warn!("Version prefetch for project {} failed: {}", key, e),
            }
        }
        Ok(())
    }

    fn side_table(&self) -> Option<(&'static str, DedupPolicy)> {
        Some(("version", DedupPolicy::Key("id".to_string())))
    }
}

/// プロジェクト参照。IDを返し、説明行をprojectテーブルへ書く。
pub struct ProjectCast;

impl ProjectCast {
    fn record(obj: &serde_json::Map<String, Value>, tables: &mut TableStore) -> Result<String> {
        let id = object_str(obj, "id");
        let mut row = Row::new();
        row.insert("id".to_string(), id.clone());
        row.insert("key".to_string(), object_str(obj, "key"));
        row.insert("name".to_string(), object_str(obj, "name"));
        tables.append("project", row)?;
        Ok(id)
    }
}

#[async_trait]
impl TypeCast for ProjectCast {
    fn id(&self) -> &'static str {
        "project"
    }

    fn parse(&self, raw: Option<&Value>, tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Object(obj)) => Self::record(obj, tables),
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Ok(EMPTY.to_string()),
        }
    }

    async fn prefetch(&self, client: &JiraClient, tables: &mut TableStore) -> Result<()> {
        match client.get_json("/rest/api/3/project").await {
            Ok(data) => {
                for project in data.as_array().map(|a| a.as_slice()).unwrap_or_default() {
                    if let Value::Object(obj) = project {
                        Self::record(obj, tables)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("Project prefetch failed, relying on per-issue values: {}", e);
                Ok(())
            }
        }
    }

    fn side_table(&self) -> Option<(&'static str, DedupPolicy)> {
        Some(("project", DedupPolicy::Key("id".to_string())))
    }
}

/// スプリント参照
///
/// APIはオブジェクト形式と `...Sprint@xxxx[id=5,name=Sprint 1,...]` 形式の
/// 両方を返すため、どちらも受け付ける。
pub struct SprintCast;

impl SprintCast {
    fn record(value: &Value, tables: &mut TableStore) -> Result<Option<String>> {
        match value {
            Value::Object(obj) => {
                let id = object_str(obj, "id");
                let mut row = Row::new();
                row.insert("id".to_string(), id.clone());
                row.insert("name".to_string(), object_str(obj, "name"));
                row.insert("state".to_string(), object_str(obj, "state"));
                row.insert("start_date".to_string(), date_of(obj.get("startDate")));
                row.insert("end_date".to_string(), date_of(obj.get("endDate")));
                tables.append("sprint", row)?;
                Ok(Some(id))
            }
            Value::String(s) => {
                let Some(fields) = Self::parse_blob(s) else {
                    return Ok(None);
                };
                let id = fields
                    .get("id")
                    .cloned()
                    .unwrap_or_else(|| EMPTY.to_string());
                let mut row = Row::new();
                row.insert("id".to_string(), id.clone());
                row.insert(
                    "name".to_string(),
                    fields.get("name").cloned().unwrap_or_else(|| EMPTY.to_string()),
                );
                row.insert(
                    "state".to_string(),
                    fields.get("state").cloned().unwrap_or_else(|| EMPTY.to_string()),
                );
                row.insert(
                    "start_date".to_string(),
                    fields
                        .get("startDate")
                        .map(|s| date_of(Some(&Value::String(s.clone()))))
                        .unwrap_or_else(|| EMPTY.to_string()),
                );
                row.insert(
                    "end_date".to_string(),
                    fields
                        .get("endDate")
                        .map(|s| date_of(Some(&Value::String(s.clone()))))
                        .unwrap_or_else(|| EMPTY.to_string()),
                );
                tables.append("sprint", row)?;
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    /// greenhopper形式の文字列から `key=value` ペアを取り出す
    /// （カンマを含むスプリント名は途中で切れる。既知のAPI仕様上の制約）
    fn parse_blob(blob: &str) -> Option<HashMap<String, String>> {
        let start = blob.find('[')?;
        let end = blob.rfind(']')?;
        if start + 1 > end {
            return None;
        }
        let mut fields = HashMap::new();
        for pair in blob[start + 1..end].split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                if value != "<null>" {
                    fields.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        if fields.contains_key("id") { Some(fields) } else { None }
    }
}

#[async_trait]
impl TypeCast for SprintCast {
    fn id(&self) -> &'static str {
        "sprint"
    }

    fn parse(&self, raw: Option<&Value>, tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Array(items)) => {
                let mut last = EMPTY.to_string();
                for item in items {
                    if let Some(id) = Self::record(item, tables)? {
                        last = id;
                    }
                }
                Ok(last)
            }
            Some(v) => Ok(Self::record(v, tables)?.unwrap_or_else(|| EMPTY.to_string())),
            None => Ok(EMPTY.to_string()),
        }
    }

    fn parse_changelog(&self, item: &HistoryItem, _tables: &TableStore) -> Option<ChangeValue> {
        // fromはカンマ区切りのスプリントID一覧。最後の所属が変更前の値。
        let last = item
            .from
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .next_back()
            .unwrap_or(EMPTY)
            .to_string();
        Some(ChangeValue::Set(last))
    }

    async fn prefetch(&self, client: &JiraClient, tables: &mut TableStore) -> Result<()> {
        // agileエンドポイントはライセンスによって無効なことがあるため、
        // 失敗しても実行は続ける
        let boards = match client.get_json("/rest/agile/1.0/board").await {
            Ok(data) => data,
            Err(e) => {
                warn!("Sprint prefetch failed, relying on per-issue values: {}", e);
                return Ok(());
            }
        };
        let board_ids: Vec<i64> = boards
            .get("values")
            .and_then(|v| v.as_array())
            .map(|boards| boards.iter().filter_map(|b| b.get("id")?.as_i64()).collect())
            .unwrap_or_default();
        for board_id in board_ids {
            match client
                .get_json(&format!(
                    "/rest/agile/1.0/board/{}/sprint?state=active,closed,future",
                    board_id
                ))
                .await
            {
                Ok(sprints) => {
                    for sprint in sprints
                        .get("values")
                        .and_then(|v| v.as_array())
                        .map(|a| a.as_slice())
                        .unwrap_or_default()
                    {
                        Self::record(sprint, tables)?;
                    }
                }
                Err(e) => warn!("Sprint prefetch for board {} failed: {}", board_id, e),
            }
        }
        Ok(())
    }

    fn side_table(&self) -> Option<(&'static str, DedupPolicy)> {
        Some(("sprint", DedupPolicy::Key("id".to_string())))
    }
}

/// ステータスのカテゴリキー（new / indeterminate / done）
///
/// changelogはステータスIDしか運ばないため、カテゴリの解決には
/// 先読みしたstatusテーブルが必要になる。
pub struct StatusCategoryCast;

impl StatusCategoryCast {
    fn record(obj: &serde_json::Map<String, Value>, tables: &mut TableStore) -> Result<String> {
        let category = obj
            .get("statusCategory")
            .and_then(|c| c.get("key"))
            .and_then(|k| k.as_str())
            .unwrap_or(EMPTY)
            .to_string();
        let mut row = Row::new();
        row.insert("id".to_string(), object_str(obj, "id"));
        row.insert("name".to_string(), object_str(obj, "name"));
        row.insert("category".to_string(), category.clone());
        tables.append("status", row)?;
        Ok(category)
    }
}

#[async_trait]
impl TypeCast for StatusCategoryCast {
    fn id(&self) -> &'static str {
        "status_category"
    }

    fn parse(&self, raw: Option<&Value>, tables: &mut TableStore) -> Result<String> {
        match raw {
            Some(Value::Object(obj)) => Self::record(obj, tables),
            Some(Value::String(id)) => Ok(tables
                .find("status", "id", id)
                .and_then(|row| row.get("category").cloned())
                .unwrap_or_else(|| EMPTY.to_string())),
            _ => Ok(EMPTY.to_string()),
        }
    }

    fn parse_changelog(&self, item: &HistoryItem, tables: &TableStore) -> Option<ChangeValue> {
        let id = item.from.as_deref()?;
        match tables.find("status", "id", id) {
            Some(row) => row.get("category").cloned().map(ChangeValue::Set),
            None => {
                warn!(
                    "Status {} not found in status table; skipping changelog item",
                    id
                );
                None
            }
        }
    }

    async fn prefetch(&self, client: &JiraClient, tables: &mut TableStore) -> Result<()> {
        match client.get_json("/rest/api/3/status").await {
            Ok(data) => {
                for status in data.as_array().map(|a| a.as_slice()).unwrap_or_default() {
                    if let Value::Object(obj) = status {
                        Self::record(obj, tables)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("Status prefetch failed, relying on per-issue values: {}", e);
                Ok(())
            }
        }
    }

    fn side_table(&self) -> Option<(&'static str, DedupPolicy)> {
        Some(("status", DedupPolicy::Key("id".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(casts: &[&dyn TypeCast]) -> TableStore {
        let mut tables = TableStore::new();
        for cast in casts {
            if let Some((name, policy)) = cast.side_table() {
                tables.register(name, policy).unwrap();
            }
        }
        tables
    }

    fn item(field: &str, from: Option<&str>, to: Option<&str>) -> HistoryItem {
        HistoryItem {
            field: field.to_string(),
            from: from.map(String::from),
            from_string: None,
            to: to.map(String::from),
            to_string: None,
        }
    }

    #[test]
    fn test_registry_get_unknown_is_configuration_error() {
        let registry = TypeCastRegistry::new();
        assert!(registry.get("string").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(Error::UnknownTypeCast(_))
        ));
    }

    #[test]
    fn test_scalar_casts_are_total_over_null() {
        // null・欠落は全キャストで番兵値に正規化される
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        for id in ["string", "integer", "decimal", "flag", "date", "text", "id", "key", "labels", "count", "rank"] {
            let cast = registry.get(id).unwrap();
            assert_eq!(cast.parse(None, &mut tables).unwrap(), EMPTY, "cast {}", id);
            assert_eq!(
                cast.parse(Some(&Value::Null), &mut tables).unwrap(),
                EMPTY,
                "cast {}",
                id
            );
        }
    }

    #[test]
    fn test_integer_and_decimal_normalization() {
        let mut tables = TableStore::new();
        assert_eq!(IntegerCast.parse(Some(&json!(42)), &mut tables).unwrap(), "42");
        assert_eq!(IntegerCast.parse(Some(&json!("7.9")), &mut tables).unwrap(), "7");
        assert_eq!(DecimalCast.parse(Some(&json!(2.5)), &mut tables).unwrap(), "2.5");
        assert_eq!(DecimalCast.parse(Some(&json!("3.0")), &mut tables).unwrap(), "3");
    }

    #[test]
    fn test_flag_cast() {
        let mut tables = TableStore::new();
        assert_eq!(FlagCast.parse(Some(&json!(true)), &mut tables).unwrap(), "1");
        assert_eq!(FlagCast.parse(Some(&json!(false)), &mut tables).unwrap(), "0");
        assert_eq!(FlagCast.parse(Some(&json!("yes")), &mut tables).unwrap(), "1");
        assert_eq!(FlagCast.parse(Some(&json!([])), &mut tables).unwrap(), "0");
    }

    #[test]
    fn test_date_cast_canonicalizes() {
        let mut tables = TableStore::new();
        assert_eq!(
            DateCast
                .parse(Some(&json!("2024-01-15T10:30:00.000+0000")), &mut tables)
                .unwrap(),
            "2024-01-15 10:30:00"
        );
        assert_eq!(DateCast.parse(Some(&json!("garbage")), &mut tables).unwrap(), EMPTY);
    }

    #[test]
    fn test_text_cast_flattens_adf() {
        let mut tables = TableStore::new();
        let adf = json!({
            "type": "doc",
            "content": [
                { "type": "paragraph", "content": [ { "type": "text", "text": "Hello" } ] },
                { "type": "paragraph", "content": [ { "type": "text", "text": "World" } ] }
            ]
        });
        assert_eq!(TextCast.parse(Some(&adf), &mut tables).unwrap(), "Hello World");
    }

    #[test]
    fn test_id_and_key_casts() {
        let mut tables = TableStore::new();
        assert_eq!(
            IdCast.parse(Some(&json!({"id": "5", "name": "Story"})), &mut tables).unwrap(),
            "5"
        );
        assert_eq!(
            KeyCast.parse(Some(&json!({"key": "TEST-9"})), &mut tables).unwrap(),
            "TEST-9"
        );
    }

    #[test]
    fn test_label_count_cast() {
        let mut tables = TableStore::new();
        assert_eq!(
            LabelCountCast.parse(Some(&json!(["a", "b", "c"])), &mut tables).unwrap(),
            "3"
        );

        let mut label_item = item("labels", None, None);
        label_item.from_string = Some("backend urgent".to_string());
        assert_eq!(
            LabelCountCast.parse_changelog(&label_item, &tables),
            Some(ChangeValue::Set("2".to_string()))
        );
    }

    #[test]
    fn test_item_count_cast_deltas() {
        let tables = TableStore::new();
        // 追加は+1、削除は-1
        assert_eq!(
            ItemCountCast.parse_changelog(&item("Attachment", None, Some("901")), &tables),
            Some(ChangeValue::Delta(1))
        );
        assert_eq!(
            ItemCountCast.parse_changelog(&item("Attachment", Some("901"), None), &tables),
            Some(ChangeValue::Delta(-1))
        );
    }

    #[test]
    fn test_rank_cast_directions() {
        let tables = TableStore::new();
        let mut higher = item("Rank", None, None);
        higher.to_string = Some("Ranked higher".to_string());
        let mut lower = item("Rank", None, None);
        lower.to_string = Some("Ranked lower".to_string());
        let unknown = item("Rank", None, None);

        assert_eq!(
            RankCast.parse_changelog(&higher, &tables),
            Some(ChangeValue::Event("1".to_string()))
        );
        assert_eq!(
            RankCast.parse_changelog(&lower, &tables),
            Some(ChangeValue::Event("-1".to_string()))
        );
        assert_eq!(RankCast.parse_changelog(&unknown, &tables), None);
    }

    #[test]
    fn test_developer_cast_writes_side_table() {
        let mut tables = store_with(&[&DeveloperCast]);
        let raw = json!({
            "accountId": "u1",
            "displayName": "Alice",
            "emailAddress": "alice@example.com"
        });

        assert_eq!(DeveloperCast.parse(Some(&raw), &mut tables).unwrap(), "u1");
        // 同じ開発者の再出現は重複排除される
        assert_eq!(DeveloperCast.parse(Some(&raw), &mut tables).unwrap(), "u1");

        let rows = tables.get("developer").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Alice");
    }

    #[test]
    fn test_version_cast_takes_last_of_array() {
        let mut tables = store_with(&[&VersionCast]);
        let raw = json!([
            { "id": "100", "name": "1.0", "released": true, "releaseDate": "2024-01-01" },
            { "id": "101", "name": "1.1", "released": false }
        ]);

        assert_eq!(VersionCast.parse(Some(&raw), &mut tables).unwrap(), "101");

        let rows = tables.get("version").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["released"], "1");
        assert_eq!(rows[0]["release_date"], "2024-01-01 00:00:00");
        assert_eq!(rows[1]["released"], "0");
    }

    #[test]
    fn test_sprint_blob_parsing() {
        let mut tables = store_with(&[&SprintCast]);
        let blob = "com.atlassian.greenhopper.service.sprint.Sprint@1f84[id=5,rapidViewId=2,state=ACTIVE,name=Sprint 1,startDate=2024-01-01T00:00:00.000+0000,endDate=<null>]";

        assert_eq!(
            SprintCast.parse(Some(&json!([blob])), &mut tables).unwrap(),
            "5"
        );
        let rows = tables.get("sprint").unwrap();
        assert_eq!(rows[0]["name"], "Sprint 1");
        assert_eq!(rows[0]["state"], "ACTIVE");
        assert_eq!(rows[0]["start_date"], "2024-01-01 00:00:00");
        assert_eq!(rows[0]["end_date"], EMPTY);
    }

    #[test]
    fn test_sprint_changelog_takes_last_id() {
        let tables = TableStore::new();
        let sprint_item = item("Sprint", Some("3, 5"), Some("3, 5, 8"));
        assert_eq!(
            SprintCast.parse_changelog(&sprint_item, &tables),
            Some(ChangeValue::Set("5".to_string()))
        );
    }

    #[test]
    fn test_status_category_resolution() {
        let mut tables = store_with(&[&StatusCategoryCast]);
        let status = json!({
            "id": "3",
            "name": "In Progress",
            "statusCategory": { "id": 4, "key": "indeterminate" }
        });

        assert_eq!(
            StatusCategoryCast.parse(Some(&status), &mut tables).unwrap(),
            "indeterminate"
        );

        // changelogのIDはstatusテーブル経由で解決される
        assert_eq!(
            StatusCategoryCast.parse_changelog(&item("status", Some("3"), Some("5")), &tables),
            Some(ChangeValue::Set("indeterminate".to_string()))
        );
        // 未知のIDは解決不能としてスキップ
        assert_eq!(
            StatusCategoryCast.parse_changelog(&item("status", Some("999"), None), &tables),
            None
        );
    }

    #[test]
    fn test_apply_casts_chains() {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        let casts = vec![registry.get("id").unwrap(), registry.get("integer").unwrap()];

        let raw = json!({"id": "42"});
        assert_eq!(apply_casts(&casts, Some(&raw), &mut tables).unwrap(), "42");
        assert_eq!(apply_casts(&[], Some(&json!("x")), &mut tables).unwrap(), "x");
        assert_eq!(apply_casts(&[], None, &mut tables).unwrap(), EMPTY);
    }
}
