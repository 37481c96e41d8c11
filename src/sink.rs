use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use tokio::fs::{File, create_dir_all};
use tokio::io::AsyncWriteExt;

use crate::table::Row;
use crate::{Error, Result};

/// テーブル書き出し先の抽象化
///
/// アップロード・永続化はこのクレートの外側の責務であり、flush境界だけを
/// トレイトとして公開する。
#[async_trait]
pub trait TableSink: Send {
    /// 1テーブル分の行を書き出す
    async fn write_table(&mut self, name: &str, rows: &[Row]) -> Result<()>;
}

/// テーブルごとに1ファイルのJSONを書き出すsink（gzip圧縮対応）
pub struct JsonDirSink {
    /// 出力ディレクトリ
    out_dir: PathBuf,
    /// gzip圧縮を使用するかどうか
    use_compression: bool,
}

impl JsonDirSink {
    pub fn new<P: AsRef<Path>>(out_dir: P) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            use_compression: true,
        }
    }

    /// 圧縮設定を変更
    pub fn with_compression(mut self, use_compression: bool) -> Self {
        self.use_compression = use_compression;
        self
    }

    fn file_path(&self, table: &str) -> PathBuf {
        let filename = if self.use_compression {
            format!("{}.json.gz", table)
        } else {
            format!("{}.json", table)
        };
        self.out_dir.join(filename)
    }
}

#[async_trait]
impl TableSink for JsonDirSink {
    async fn write_table(&mut self, name: &str, rows: &[Row]) -> Result<()> {
        create_dir_all(&self.out_dir).await.map_err(Error::IoError)?;

        let json_data = serde_json::to_vec_pretty(rows)?;

        let final_data = if self.use_compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json_data).map_err(Error::IoError)?;
            encoder.finish().map_err(Error::IoError)?
        } else {
            json_data
        };

        let path = self.file_path(name);
        let mut file = File::create(&path).await.map_err(Error::IoError)?;
        file.write_all(&final_data).await.map_err(Error::IoError)?;
        file.sync_all().await.map_err(Error::IoError)?;

        Ok(())
    }
}

/// テスト用のインメモリsink
#[derive(Debug, Default)]
pub struct MemorySink {
    pub tables: HashMap<String, Vec<Row>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableSink for MemorySink {
    async fn write_table(&mut self, name: &str, rows: &[Row]) -> Result<()> {
        self.tables.insert(name.to_string(), rows.to_vec());
        Ok(())
    }
}
