use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::{Error, Result};

/// テーブル出力で使う日時の正規化フォーマット
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// JIRAが返す日時文字列をパース
///
/// JIRA REST APIは `2024-01-15T10:30:00.000+0000` のようにコロンなしの
/// オフセットを返すことがあるため、RFC3339より緩い形式も受け付ける。
pub fn parse_jira_datetime(timestamp: &str) -> Result<DateTime<Utc>> {
    // "+0000" 形式のオフセット
    if let Ok(dt) = DateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }

    // RFC3339（"Z" や "+00:00"）
    if let Ok(dt) = DateTime::parse_from_rfc3339(timestamp) {
        return Ok(dt.with_timezone(&Utc));
    }

    // 正規化済みの出力形式（テーブルに書き込んだ値の再パース用）
    if let Ok(naive) = NaiveDateTime::parse_from_str(timestamp, CANONICAL_FORMAT) {
        return Ok(naive.and_utc());
    }

    // 日付のみ（watermark設定などで使われる）
    if let Ok(date) = NaiveDate::parse_from_str(timestamp, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }

    Err(Error::InvalidData(format!(
        "Unrecognized timestamp format: {}",
        timestamp
    )))
}

/// 日時を正規化フォーマットの文字列に変換
pub fn to_canonical(dt: &DateTime<Utc>) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

/// 抽出実行全体を区切る "updated-since" 境界
///
/// Collectorの構築時に一度だけ与えられ、実行中は不変。changelogの巻き戻しが
/// この境界より古い時点に達したら反復を打ち切る。
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    since: Option<DateTime<Utc>>,
}

impl Watermark {
    /// 境界なし（全履歴を復元する）
    pub fn none() -> Self {
        Self { since: None }
    }

    /// 指定時刻を境界とする
    pub fn since(dt: DateTime<Utc>) -> Self {
        Self { since: Some(dt) }
    }

    /// 設定文字列から構築。パースできない文字列は設定エラー。
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Self::none()),
            Some(s) => {
                let dt = parse_jira_datetime(s).map_err(|_| {
                    Error::InvalidConfiguration(format!("Invalid watermark timestamp: {}", s))
                })?;
                Ok(Self::since(dt))
            }
        }
    }

    /// 指定時刻が境界以降かどうか
    pub fn passes(&self, dt: &DateTime<Utc>) -> bool {
        match self.since {
            Some(since) => *dt >= since,
            None => true,
        }
    }

    /// 文字列の時刻が境界以降かどうか
    ///
    /// パースできない・欠落している時刻は通す。境界判定で行を落とすのは
    /// 確実に古いと分かる場合のみ。
    pub fn passes_str(&self, timestamp: Option<&str>) -> bool {
        match timestamp {
            Some(s) => match parse_jira_datetime(s) {
                Ok(dt) => self.passes(&dt),
                Err(_) => true,
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_jira_offset_format() {
        // JIRA固有の "+0000" オフセットをパースできる
        let dt = parse_jira_datetime("2024-01-15T10:30:00.000+0000").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_jira_datetime("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_canonical_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let formatted = to_canonical(&dt);
        assert_eq!(formatted, "2024-03-01 09:00:00");
        assert_eq!(parse_jira_datetime(&formatted).unwrap(), dt);
    }

    #[test]
    fn test_parse_date_only() {
        let dt = parse_jira_datetime("2024-06-01").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_jira_datetime("not a timestamp").is_err());
    }

    #[test]
    fn test_watermark_passes() {
        let wm = Watermark::since(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());

        assert!(wm.passes(&Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()));
        assert!(wm.passes(&Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        assert!(!wm.passes(&Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap()));
    }

    #[test]
    fn test_watermark_passes_str_is_lenient() {
        let wm = Watermark::since(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());

        assert!(wm.passes_str(Some("2024-01-15T00:00:00.000+0000")));
        assert!(!wm.passes_str(Some("2023-12-31T00:00:00.000+0000")));
        // 不正・欠落した時刻では行を落とさない
        assert!(wm.passes_str(Some("garbage")));
        assert!(wm.passes_str(None));
    }

    #[test]
    fn test_watermark_parse_config() {
        assert!(Watermark::parse(None).unwrap().passes_str(Some("1970-01-01")));
        assert!(Watermark::parse(Some("2024-01-10")).is_ok());
        assert!(Watermark::parse(Some("bogus")).is_err());
    }
}
