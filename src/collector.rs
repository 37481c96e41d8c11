use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::changelog::ChangelogEngine;
use crate::client::JiraClient;
use crate::config::ExtractProfile;
use crate::field::{self, Field, Resolved};
use crate::models::Issue;
use crate::sink::TableSink;
use crate::special::SpecialParser;
use crate::table::{DedupPolicy, Row, TableStore};
use crate::timestamp::{Watermark, parse_jira_datetime};
use crate::typecast::TypeCastRegistry;
use crate::Result;

/// 課題のバッチ供給元
///
/// 本番ではJQL検索のページング、テストではインメモリの列。
/// 空のバッチを返したら供給終了。
#[async_trait]
pub trait IssueSource: Send {
    async fn next_batch(&mut self) -> Result<Vec<Issue>>;
}

/// 抽出実行全体を駆動するオーケストレーター
///
/// 構築時に抽出プロファイルを検証し、全テーブルを登録する。
/// 設定の誤りは最初の課題を処理する前にエラーになる。
pub struct Collector {
    fields: Vec<Field>,
    specials: Vec<Box<dyn SpecialParser>>,
    engine: ChangelogEngine,
    tables: TableStore,
    latest_updated: Option<DateTime<Utc>>,
}

impl Collector {
    pub fn new(profile: &ExtractProfile) -> Result<Self> {
        let registry = TypeCastRegistry::new();
        let mut tables = TableStore::new();
        tables.register("issue", DedupPolicy::None)?;

        let watermark = Watermark::parse(profile.updated_since.as_deref())?;
        let mut engine = ChangelogEngine::new(watermark);

        let mut fields = Vec::new();
        let mut specials = Vec::new();
        for (name, spec) in &profile.fields {
            for resolved in field::resolve_field(name, spec, &registry, &mut tables)? {
                match resolved {
                    Resolved::Scalar(field) => fields.push(field),
                    Resolved::Special(parser) => {
                        parser.register(&mut tables)?;
                        specials.push(parser);
                    }
                    Resolved::ChangelogItem { name, label, casts } => {
                        engine.register_item(name, label, casts);
                    }
                    Resolved::ChangelogPrimary { name, source } => {
                        engine.register_primary(name, source);
                    }
                }
            }
        }

        Ok(Self {
            fields,
            specials,
            engine,
            tables,
            latest_updated: None,
        })
    }

    /// 参照データの事前取得
    ///
    /// 同じキャストが複数フィールドで使われていても取得は1回。
    /// 個々の失敗は参照解決の劣化として扱い、実行は継続する。
    pub async fn prefetch(&mut self, client: &JiraClient) -> Result<()> {
        let mut done: HashSet<&'static str> = HashSet::new();

        let casts: Vec<_> = self
            .fields
            .iter()
            .flat_map(|f| f.casts().iter().cloned())
            .chain(self.engine.item_casts())
            .collect();
        for cast in casts {
            if done.insert(cast.id()) {
                cast.prefetch(client, &mut self.tables).await?;
            }
        }
        for parser in &self.specials {
            parser.prefetch(client, &mut self.tables).await?;
        }
        Ok(())
    }

    /// 課題1件を処理して履歴行をissueテーブルへ書き込む
    pub fn process_issue(&mut self, issue: &Issue) -> Result<()> {
        let mut current = Row::new();
        for field in &self.fields {
            let (name, value) = field.collect(issue, &mut self.tables)?;
            current.insert(name, value);
        }

        let rows = self.engine.get_versions(issue, &current, &self.tables)?;
        self.tables.extend("issue", rows)?;

        for parser in &self.specials {
            parser.collect(issue, &mut self.tables)?;
        }

        // 増分実行の次回watermark候補として最終更新時刻を追跡
        if let Some(updated) = issue.updated() {
            match parse_jira_datetime(updated) {
                Ok(dt) => {
                    if self.latest_updated.map(|latest| dt > latest).unwrap_or(true) {
                        self.latest_updated = Some(dt);
                    }
                }
                Err(_) => {
                    warn!("Issue {} has unparseable updated timestamp", issue.key);
                }
            }
        }
        Ok(())
    }

    /// 供給元が尽きるまで全課題を処理する
    pub async fn run(&mut self, source: &mut dyn IssueSource) -> Result<()> {
        let mut total = 0usize;
        loop {
            let batch = source.next_batch().await?;
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            for issue in &batch {
                self.process_issue(issue)?;
            }
            info!("Processed {} issues so far", total);
        }
        Ok(())
    }

    /// 処理済み課題の中で最も新しい更新時刻
    pub fn latest_updated(&self) -> Option<DateTime<Utc>> {
        self.latest_updated
    }

    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    pub fn into_tables(self) -> TableStore {
        self.tables
    }

    /// 全テーブルをsinkへ書き出す
    pub async fn write(&self, sink: &mut dyn TableSink) -> Result<()> {
        self.tables.write(sink).await
    }
}
