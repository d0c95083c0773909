use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::HarvestError;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

static NEW_STYLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}\.\d{4,5}(v\d+)?$").unwrap());
static OLD_STYLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z\-]*(\.[A-Z]{2})?/\d{7}(v\d+)?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaperId(String);

impl PaperId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_stem(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PaperId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut normalized = value.trim();
        for prefix in [
            "https://arxiv.org/abs/",
            "http://arxiv.org/abs/",
            "arXiv:",
            "arxiv:",
        ] {
            if let Some(rest) = normalized.strip_prefix(prefix) {
                normalized = rest;
            }
        }
        if NEW_STYLE_ID.is_match(normalized) || OLD_STYLE_ID.is_match(normalized) {
            Ok(Self(normalized.to_string()))
        } else {
            Err(HarvestError::InvalidPaperId(value.to_string()))
        }
    }
}

impl TryFrom<String> for PaperId {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PaperId> for String {
    fn from(value: PaperId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: PaperId,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(rename = "abstract", default)]
    pub summary: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub pdf_url: String,
    #[serde(deserialize_with = "date_or_timestamp")]
    pub published: NaiveDate,
    #[serde(default, deserialize_with = "optional_date_or_timestamp")]
    pub updated: Option<NaiveDate>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub pdf_size: Option<u64>,
}

fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|err| format!("invalid date {raw:?}: {err}"))
}

fn date_or_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_day(&raw).map_err(serde::de::Error::custom)
}

fn optional_date_or_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<NaiveDate>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_day(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub id: PaperId,
    pub source_url: String,
    pub target: Utf8PathBuf,
    pub content_type: String,
    pub expected_size: Option<u64>,
    pub paper: PaperRecord,
}

impl ArtifactRequest {
    pub fn publish_date(&self) -> NaiveDate {
        self.paper.published
    }

    pub fn expects_pdf(&self) -> bool {
        self.content_type == PDF_CONTENT_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Segmented,
    Managed,
    Direct,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Segmented => write!(f, "segmented"),
            BackendKind::Managed => write!(f, "managed"),
            BackendKind::Direct => write!(f, "direct"),
        }
    }
}

pub fn read_records<R: Read>(reader: R) -> Result<Vec<PaperRecord>, HarvestError> {
    let mut records = Vec::new();
    for value in serde_json::Deserializer::from_reader(reader).into_iter::<Value>() {
        let value = value.map_err(|err| HarvestError::RecordsRead(err.to_string()))?;
        match value {
            Value::Array(items) => {
                for item in items {
                    records.push(parse_record(item)?);
                }
            }
            other => records.push(parse_record(other)?),
        }
    }
    Ok(records)
}

fn parse_record(value: Value) -> Result<PaperRecord, HarvestError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<missing id>")
        .to_string();
    serde_json::from_value(value).map_err(|err| HarvestError::InvalidRecord(format!("{id}: {err}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_new_style_id() {
        let id: PaperId = "arXiv:2401.01234v2".parse().unwrap();
        assert_eq!(id.as_str(), "2401.01234v2");
        assert_eq!(id.file_stem(), "2401.01234v2");
    }

    #[test]
    fn parse_old_style_id() {
        let id: PaperId = "hep-th/9901001".parse().unwrap();
        assert_eq!(id.file_stem(), "hep-th_9901001");
    }

    #[test]
    fn parse_invalid_id() {
        let err = "not-an-id".parse::<PaperId>().unwrap_err();
        assert_matches!(err, HarvestError::InvalidPaperId(_));
    }

    #[test]
    fn read_records_accepts_array_and_stream() {
        let input = r#"[{"id": "2401.00001", "title": "One", "pdf_url": "https://arxiv.org/pdf/2401.00001", "published": "2024-01-02"}]
{"id": "hep-th/9901001", "title": "Two", "abstract": "Strings.", "pdf_url": "https://arxiv.org/pdf/hep-th/9901001", "published": "1999-01-04T12:00:00Z", "updated": "1999-02-01T08:30:00Z", "pdf_size": 1000}"#;
        let records = read_records(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].summary, "Strings.");
        assert_eq!(records[1].pdf_size, Some(1000));
        assert_eq!(records[0].published, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(records[1].published, NaiveDate::from_ymd_opt(1999, 1, 4).unwrap());
        assert_eq!(records[1].updated, NaiveDate::from_ymd_opt(1999, 2, 1));
    }

    #[test]
    fn read_records_rejects_bad_id() {
        let input = r#"{"id": "bogus", "title": "x", "pdf_url": "u", "published": "2024-01-02"}"#;
        let err = read_records(input.as_bytes()).unwrap_err();
        assert_matches!(err, HarvestError::InvalidRecord(message) if message.starts_with("bogus"));
    }
}
