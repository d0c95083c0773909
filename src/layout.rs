use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{PaperId, PaperRecord};
use crate::error::HarvestError;

const PARTIAL_DIR: &str = ".partial";

#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn pdf_dir(&self, date: NaiveDate) -> Utf8PathBuf {
        self.root.join("pdfs").join(date_dir(date))
    }

    pub fn info_dir(&self, date: NaiveDate) -> Utf8PathBuf {
        self.root.join("info").join(date_dir(date))
    }

    pub fn pdf_path(&self, id: &PaperId, date: NaiveDate) -> Utf8PathBuf {
        self.pdf_dir(date).join(format!("{}.pdf", id.file_stem()))
    }

    pub fn info_path(&self, id: &PaperId, date: NaiveDate) -> Utf8PathBuf {
        self.info_dir(date).join(format!("{}.json", id.file_stem()))
    }

    pub fn partial_dir(&self) -> Utf8PathBuf {
        self.root.join(PARTIAL_DIR)
    }

    pub fn partial_path(&self, id: &PaperId) -> Utf8PathBuf {
        self.partial_dir().join(format!("{}.pdf.part", id.file_stem()))
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        for dir in [
            self.root.join("pdfs"),
            self.root.join("info"),
            self.partial_dir(),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| HarvestError::RootNotWritable(format!("{dir}: {err}")))?;
        }
        tempfile::Builder::new()
            .prefix("paper-harvest-probe")
            .tempfile_in(self.partial_dir().as_std_path())
            .map_err(|err| HarvestError::RootNotWritable(format!("{}: {err}", self.root)))?;
        Ok(())
    }

    pub fn promote(&self, partial: &Utf8Path, target: &Utf8Path) -> Result<(), HarvestError> {
        let parent = target
            .parent()
            .ok_or_else(|| HarvestError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::rename(partial.as_std_path(), target.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("promote {partial}: {err}")))?;
        remove_if_exists(&control_file(partial))?;
        Ok(())
    }

    pub fn demote(&self, target: &Utf8Path, partial: &Utf8Path) -> Result<(), HarvestError> {
        fs::create_dir_all(self.partial_dir().as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::rename(target.as_std_path(), partial.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("demote {target}: {err}")))
    }

    pub fn discard_partial(&self, id: &PaperId) -> Result<(), HarvestError> {
        let partial = self.partial_path(id);
        remove_if_exists(partial.as_std_path())?;
        remove_if_exists(&control_file(&partial))
    }

    pub fn write_metadata(path: &Utf8Path, info: &PaperInfo) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(info)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn list_entries(&self) -> Result<Vec<PaperInfo>, HarvestError> {
        let info_root = self.root.join("info");
        if !info_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for path in walk_dir(info_root.as_std_path())? {
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let content = fs::read_to_string(&path)
                    .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
                let info: PaperInfo = serde_json::from_str(&content).map_err(|err| {
                    HarvestError::Filesystem(format!("{}: {err}", path.display()))
                })?;
                entries.push(info);
            }
        }
        entries.sort_by(|a, b| {
            b.published
                .cmp(&a.published)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperInfo {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub summary: String,
    pub categories: Vec<String>,
    pub pdf_url: String,
    pub published: String,
    pub updated: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
}

impl From<&PaperRecord> for PaperInfo {
    fn from(value: &PaperRecord) -> Self {
        Self {
            id: value.id.as_str().to_string(),
            title: value.title.clone(),
            authors: value.authors.clone(),
            summary: value.summary.clone(),
            categories: value.categories.clone(),
            pdf_url: value.pdf_url.clone(),
            published: date_dir(value.published),
            updated: date_dir(value.updated.unwrap_or(value.published)),
            comment: value.comment.clone(),
            doi: value.doi.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutEntry {
    pub id: String,
    pub published: String,
    pub pdf_path: Utf8PathBuf,
    pub info_path: Utf8PathBuf,
}

fn date_dir(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn control_file(partial: &Utf8Path) -> PathBuf {
    PathBuf::from(format!("{partial}.aria2"))
}

fn remove_if_exists(path: &Path) -> Result<(), HarvestError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(HarvestError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
