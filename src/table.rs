use std::collections::{BTreeMap, HashMap, HashSet};

use crate::sink::TableSink;
use crate::typecast::EMPTY;
use crate::{Error, Result};

/// 出力テーブルの1行。全ての値は文字列に正規化済み。
pub type Row = BTreeMap<String, String>;

/// テーブルの重複排除方針
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupPolicy {
    /// 全行を保持する
    None,
    /// 指定カラムの値ごとに1行（先勝ち）
    Key(String),
    /// 指定カラムの組ごとに1行（先勝ち）
    Link(Vec<String>),
}

/// 名前付き出力テーブル
///
/// 行は挿入順に保持する。重複排除はappend時の先勝ちで、後から来た
/// 重複行は黙って捨てられる。
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    policy: DedupPolicy,
    rows: Vec<Row>,
    seen: HashSet<Vec<String>>,
}

impl Table {
    pub fn new(name: impl Into<String>, policy: DedupPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            rows: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn dedup_key(&self, row: &Row) -> Option<Vec<String>> {
        let columns: &[String] = match &self.policy {
            DedupPolicy::None => return None,
            DedupPolicy::Key(column) => std::slice::from_ref(column),
            DedupPolicy::Link(columns) => columns,
        };
        Some(
            columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or_else(|| EMPTY.to_string()))
                .collect(),
        )
    }

    /// 行を追加。重複排除で捨てられた場合はfalse。
    pub fn append(&mut self, row: Row) -> bool {
        if let Some(key) = self.dedup_key(&row) {
            if !self.seen.insert(key) {
                return false;
            }
        }
        self.rows.push(row);
        true
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

/// 抽出実行が書き込む全テーブルの集合
///
/// 登録順を保持し、flush時も同じ順序で書き出す。プロセス寿命の
/// 単一ライター状態であり、ロックは持たない。
#[derive(Debug, Default)]
pub struct TableStore {
    tables: HashMap<String, Table>,
    order: Vec<String>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// テーブルを登録。同名・同方針の再登録は何もしない。
    /// 同名で方針が食い違う場合は設定エラー。
    pub fn register(&mut self, name: &str, policy: DedupPolicy) -> Result<()> {
        if let Some(existing) = self.tables.get(name) {
            if *existing.policy() != policy {
                return Err(Error::InvalidConfiguration(format!(
                    "Table '{}' registered twice with conflicting dedup policies",
                    name
                )));
            }
            return Ok(());
        }
        self.tables.insert(name.to_string(), Table::new(name, policy));
        self.order.push(name.to_string());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// 行を追加。重複排除で捨てられた場合は `Ok(false)`。
    pub fn append(&mut self, name: &str, row: Row) -> Result<bool> {
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))?;
        Ok(table.append(row))
    }

    pub fn extend(&mut self, name: &str, rows: Vec<Row>) -> Result<()> {
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))?;
        for row in rows {
            table.append(row);
        }
        Ok(())
    }

    /// テーブル内容のコピーを取得。読み出し経由でストアの状態は変えられない。
    pub fn get(&self, name: &str) -> Option<Vec<Row>> {
        self.tables.get(name).map(|t| t.rows().to_vec())
    }

    pub fn len(&self, name: &str) -> usize {
        self.tables.get(name).map(|t| t.len()).unwrap_or(0)
    }

    /// 指定カラムが一致する最初の行を探す（参照テーブルの解決用）
    pub fn find(&self, name: &str, column: &str, value: &str) -> Option<Row> {
        self.tables
            .get(name)?
            .rows()
            .iter()
            .find(|row| row.get(column).map(|v| v.as_str()) == Some(value))
            .cloned()
    }

    /// 登録順のテーブル名一覧
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// 全テーブルを登録順でsinkへ書き出す
    pub async fn write(&self, sink: &mut dyn TableSink) -> Result<()> {
        for name in &self.order {
            let table = &self.tables[name];
            sink.write_table(table.name(), table.rows()).await?;
        }
        Ok(())
    }
}
