use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;

use crate::models::Issue;
use crate::table::{Row, TableStore};
use crate::timestamp::{Watermark, parse_jira_datetime, to_canonical};
use crate::typecast::{self, ChangeValue, EMPTY, TypeCast};
use crate::Result;

/// 同一時刻に起きた変更の集約単位
///
/// JIRAのchangelogはフィールドごとのbefore/afterペアの列だが、復元は
/// 変更時点単位で行うため、同一タイムスタンプのエントリを1つにまとめる。
#[derive(Debug, Clone)]
pub struct Diff {
    /// 正規化済みの変更時刻
    pub updated: String,
    /// 比較・境界判定用のパース済み時刻
    pub at: DateTime<Utc>,
    /// 変更前の値（上書き型）
    pub values: BTreeMap<String, String>,
    /// 加算型フィールドの増分合計
    pub deltas: BTreeMap<String, i64>,
    /// 変更そのものの注記（author、rank方向など）
    pub meta: BTreeMap<String, String>,
}

impl Diff {
    fn new(updated: String, at: DateTime<Utc>) -> Self {
        Self {
            updated,
            at,
            values: BTreeMap::new(),
            deltas: BTreeMap::new(),
            meta: BTreeMap::new(),
        }
    }
}

struct ItemField {
    name: String,
    label: String,
    casts: Vec<Arc<dyn TypeCast>>,
}

struct PrimaryField {
    name: String,
    source: String,
}

/// changelogを逆向きに再生して過去時点のスナップショット行を復元するエンジン
///
/// 現在状態の行を起点に、新しい変更から古い変更へ「変更前の値」を
/// 順に適用していく。途中でwatermarkより古い変更に達したら打ち切る。
pub struct ChangelogEngine {
    items: Vec<ItemField>,
    primaries: Vec<PrimaryField>,
    watermark: Watermark,
}

impl ChangelogEngine {
    pub fn new(watermark: Watermark) -> Self {
        Self {
            items: Vec::new(),
            primaries: Vec::new(),
            watermark,
        }
    }

    /// changelog項目から復元するフィールドを登録
    pub fn register_item(&mut self, name: String, label: String, casts: Vec<Arc<dyn TypeCast>>) {
        self.items.push(ItemField { name, label, casts });
    }

    /// changelogエントリ自体から取り出すフィールド（author等）を登録
    pub fn register_primary(&mut self, name: String, source: String) {
        self.primaries.push(PrimaryField { name, source });
    }

    /// changelog復元の対象フィールドが1つも無いか
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.primaries.is_empty()
    }

    /// 登録済みフィールドのキャスト一覧（参照データのprefetch用）
    pub fn item_casts(&self) -> Vec<Arc<dyn TypeCast>> {
        self.items
            .iter()
            .flat_map(|f| f.casts.iter().cloned())
            .collect()
    }

    fn primary_value(&self, primary: &PrimaryField, history: &crate::models::History) -> String {
        match primary.source.as_str() {
            "author" => history
                .author
                .as_ref()
                .map(|a| a.account_id.clone())
                .unwrap_or_else(|| EMPTY.to_string()),
            other => {
                warn!("Unknown changelog_primary source '{}'", other);
                EMPTY.to_string()
            }
        }
    }

    /// 課題のchangelogを時点単位のDiff列（新しい順）に変換する
    ///
    /// タイムスタンプが欠落・不正なエントリは警告を出してスキップする。
    /// 同一時刻のエントリは1つのDiffにまとめ、上書き型は後勝ち、
    /// 加算型は増分を合算する。
    pub fn fetch_changelog(&self, issue: &Issue, tables: &TableStore) -> Vec<Diff> {
        if self.is_empty() {
            return Vec::new();
        }
        let Some(changelog) = &issue.changelog else {
            return Vec::new();
        };

        let mut diffs: Vec<Diff> = Vec::new();
        for history in &changelog.histories {
            let Some(created) = history.created.as_deref() else {
                warn!(
                    "Changelog entry {} on issue {} has no timestamp; dropping its items",
                    history.id, issue.key
                );
                continue;
            };
            let at = match parse_jira_datetime(created) {
                Ok(at) => at,
                Err(_) => {
                    warn!(
                        "Changelog entry {} on issue {} has unparseable timestamp '{}'; dropping its items",
                        history.id, issue.key, created
                    );
                    continue;
                }
            };
            let updated = to_canonical(&at);

            let index = match diffs.iter().position(|d| d.updated == updated) {
                Some(index) => index,
                None => {
                    diffs.push(Diff::new(updated, at));
                    diffs.len() - 1
                }
            };
            let diff = &mut diffs[index];

            for primary in &self.primaries {
                diff.meta
                    .insert(primary.name.clone(), self.primary_value(primary, history));
            }

            for item in &history.items {
                let Some(field) = self.items.iter().find(|f| f.label == item.field) else {
                    continue;
                };
                match typecast::changelog_value(&field.casts, item, tables) {
                    Some(ChangeValue::Set(value)) => {
                        diff.values.insert(field.name.clone(), value);
                    }
                    Some(ChangeValue::Delta(delta)) => {
                        *diff.deltas.entry(field.name.clone()).or_insert(0) += delta;
                    }
                    Some(ChangeValue::Event(value)) => {
                        diff.meta.insert(field.name.clone(), value);
                    }
                    // 解決できない項目はキャスト側で警告済み
                    None => {}
                }
            }
        }

        diffs.sort_by(|a, b| b.at.cmp(&a.at));
        diffs
    }

    /// 現在状態の行とchangelogから履歴スナップショット行を生成する
    ///
    /// 戻り値は新しい順で、各行に `changelog_id`（古い行ほど小さく、
    /// 最古が0）と `updated` を付与する。watermarkより古い時点には
    /// 巻き戻さない。
    pub fn get_versions(
        &self,
        issue: &Issue,
        current_row: &Row,
        tables: &TableStore,
    ) -> Result<Vec<Row>> {
        let diffs = self.fetch_changelog(issue, tables);

        // changelogが空の課題は作成時刻で、そうでなければ更新時刻で出力可否を決める
        let gate = if diffs.is_empty() {
            issue.created()
        } else {
            issue.updated()
        };
        if !self.watermark.passes_str(gate) {
            return Ok(Vec::new());
        }

        let created_canonical = issue
            .created()
            .and_then(|s| parse_jira_datetime(s).ok())
            .map(|dt| to_canonical(&dt))
            .unwrap_or_else(|| EMPTY.to_string());
        let updated_canonical = issue
            .updated()
            .and_then(|s| parse_jira_datetime(s).ok())
            .map(|dt| to_canonical(&dt))
            .unwrap_or_else(|| EMPTY.to_string());

        // 注記カラムは各行ごとにリセットしてから該当時点の値を入れる
        let mut meta_keys: BTreeSet<String> =
            self.primaries.iter().map(|p| p.name.clone()).collect();
        for diff in &diffs {
            meta_keys.extend(diff.meta.keys().cloned());
        }
        let reset_meta = |row: &mut Row| {
            for key in &meta_keys {
                row.insert(key.clone(), EMPTY.to_string());
            }
        };

        let mut rows: Vec<Row> = Vec::new();

        // 現在状態の行。注記は最新の変更時点のものを引き継ぐ。
        let mut current = current_row.clone();
        current.insert("issue_id".to_string(), issue.id.clone());
        current
            .entry("created".to_string())
            .or_insert_with(|| created_canonical.clone());
        // updated列は定義に無くても全行が持つ（行の並び順の検証に使われる）
        current
            .entry("updated".to_string())
            .or_insert_with(|| updated_canonical.clone());
        reset_meta(&mut current);
        if let Some(latest) = diffs.first() {
            for (key, value) in &latest.meta {
                current.insert(key.clone(), value.clone());
            }
        }
        rows.push(current);

        for (index, diff) in diffs.iter().enumerate() {
            // 境界より古い変更に達したら、それ以前の時点は復元しない
            if !self.watermark.passes(&diff.at) {
                break;
            }

            let mut row = rows[rows.len() - 1].clone();
            for (field, value) in &diff.values {
                row.insert(field.clone(), value.clone());
            }
            for (field, delta) in &diff.deltas {
                let current: i64 = row
                    .get(field)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default();
                row.insert(field.clone(), (current - delta).to_string());
            }

            // この行の時点情報は1つ古い変更（無ければ作成時点）から取る
            reset_meta(&mut row);
            match diffs.get(index + 1) {
                Some(older) => {
                    row.insert("updated".to_string(), older.updated.clone());
                    for (key, value) in &older.meta {
                        row.insert(key.clone(), value.clone());
                    }
                }
                None => {
                    row.insert("updated".to_string(), created_canonical.clone());
                }
            }
            rows.push(row);
        }

        // 最古が0になるよう、出力確定後に通し番号を振る
        let total = rows.len();
        for (index, row) in rows.iter_mut().enumerate() {
            row.insert("changelog_id".to_string(), (total - 1 - index).to_string());
        }
        Ok(rows)
    }
}
