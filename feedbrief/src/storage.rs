//! Flat-file state: the set of already-sent item ids and stored run records.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::entry::ProcessedItem;
use crate::telemetry::RunRecord;

/// Ids of items that already went out, persisted as a sorted JSON array.
#[derive(Debug, Clone, Default)]
pub struct SentIds {
    path: PathBuf,
    ids: BTreeSet<String>,
}

impl SentIds {
    /// Read the set from `path`. A missing file is an empty set.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let ids = match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str::<Vec<String>>(&data)
                .with_context(|| format!("invalid sent ids file: {}", path.display()))?
                .into_iter()
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read sent ids: {}", path.display()));
            }
        };
        Ok(Self { path, ids })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.ids.iter()
    }

    pub fn insert_all<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
    }

    /// Rewrite the file, sorted. Written to a temp file first and renamed into place.
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let ids: Vec<&String> = self.ids.iter().collect();
        let data = serde_json::to_string_pretty(&ids).context("failed to serialize sent ids")?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        info!(path = %self.path.display(), count = self.ids.len(), "sent ids saved");
        Ok(())
    }
}

/// Relevant items that have not been sent before, in their original order.
pub fn select_unsent<'a>(items: &'a [ProcessedItem], sent: &SentIds) -> Vec<&'a ProcessedItem> {
    items
        .iter()
        .filter(|item| item.is_relevant && !sent.contains(&item.id))
        .collect()
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Write `record` as `{runs_dir}/{persona}_{YYYYmmdd_HHMMSS}.json`.
pub async fn save_run_record(runs_dir: impl AsRef<Path>, record: &RunRecord) -> Result<PathBuf> {
    let runs_dir = runs_dir.as_ref();
    tokio::fs::create_dir_all(runs_dir)
        .await
        .with_context(|| format!("failed to create {}", runs_dir.display()))?;

    let file_name = format!(
        "{}_{}.json",
        file_safe(&record.persona),
        record.started_at.format("%Y%m%d_%H%M%S")
    );
    let path = runs_dir.join(file_name);
    let data = serde_json::to_string_pretty(record).context("failed to serialize run record")?;
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("failed to write run record {}", path.display()))?;
    info!(path = %path.display(), "run record saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RunTelemetry;

    fn item(id: &str, relevant: bool) -> ProcessedItem {
        ProcessedItem {
            id: id.to_string(),
            title: id.to_uppercase(),
            summary: "s".to_string(),
            comment_summary: None,
            is_relevant: relevant,
            relevance_reason: String::new(),
            link: None,
            thumbnail: None,
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_saves_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sent_ids.json");

        let mut sent = SentIds::load(&path).await.unwrap();
        assert!(sent.is_empty());

        sent.insert_all(["c", "a", "b", "a"]);
        sent.save().await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let ids: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let reloaded = SentIds::load(&path).await.unwrap();
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contains("b"));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent_ids.json");
        tokio::fs::write(&path, "{not a list").await.unwrap();
        assert!(SentIds::load(&path).await.is_err());
    }

    #[test]
    fn unsent_selection_skips_sent_and_irrelevant() {
        let items = vec![item("1", true), item("2", true), item("3", false), item("4", true)];
        let mut sent = SentIds::default();
        sent.insert_all(["2"]);

        let ids: Vec<&str> = select_unsent(&items, &sent).iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
    }

    #[tokio::test]
    async fn run_record_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut telemetry = RunTelemetry::new("rust news/weekly");
        let record = telemetry.finalize().clone();

        let path = save_run_record(dir.path(), &record).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let expected = format!("rust_news_weekly_{}.json", record.started_at.format("%Y%m%d_%H%M%S"));
        assert_eq!(name, expected);

        let saved: RunRecord = serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(saved.run_id, record.run_id);
    }
}
