use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One content item as ingested from a feed. Enrichment phases fill in
/// `image_description` and `link_summaries`; it is read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Unique within a run
    pub id: String,
    pub title: String,
    pub body: String,
    /// Permalink of the item itself
    pub source_url: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub external_links: Vec<String>,
    /// Top-level discussion comments, when the source has them
    #[serde(default)]
    pub comments: Vec<String>,
    pub image_description: Option<String>,
    /// Linked URL -> summary of the page
    #[serde(default)]
    pub link_summaries: BTreeMap<String, String>,
}

impl Entry {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Text handed to the summarization model, including any enrichment output.
    pub fn to_prompt_text(&self) -> String {
        let mut text = format!("Title: {}\n", self.title);
        if let Some(url) = &self.source_url {
            text.push_str(&format!("URL: {}\n", url));
        }
        text.push_str(&format!("\nContent:\n{}\n", self.body.trim()));

        if let Some(description) = &self.image_description {
            text.push_str(&format!("\nImage description:\n{}\n", description));
        }
        for (url, summary) in &self.link_summaries {
            text.push_str(&format!("\nLinked page ({}):\n{}\n", url, summary));
        }
        if !self.comments.is_empty() {
            text.push_str("\nComments:\n");
            for comment in &self.comments {
                text.push_str(&format!("- {}\n", comment.trim()));
            }
        }
        text
    }
}

/// The model's relevance verdict and summary for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedItem {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub comment_summary: Option<String>,
    pub is_relevant: bool,
    pub relevance_reason: String,
    pub link: Option<String>,
    pub thumbnail: Option<String>,
}

/// Fields the model fills in; identity fields are copied from the entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemVerdict {
    pub summary: String,
    #[serde(default)]
    pub comment_summary: Option<String>,
    pub is_relevant: bool,
    #[serde(default)]
    pub relevance_reason: String,
}

impl ProcessedItem {
    pub fn from_verdict(entry: &Entry, verdict: ItemVerdict) -> Self {
        Self {
            id: entry.id.clone(),
            title: entry.title.clone(),
            summary: verdict.summary.trim().to_string(),
            comment_summary: verdict
                .comment_summary
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            is_relevant: verdict.is_relevant,
            relevance_reason: verdict.relevance_reason,
            link: entry.source_url.clone(),
            thumbnail: entry.thumbnail.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyDevelopment {
    pub text: String,
    pub item_id: String,
}

/// Cross-item synthesis, one per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestResponse {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_developments: Vec<KeyDevelopment>,
    #[serde(default)]
    pub emerging_trends: Vec<String>,
    #[serde(default)]
    pub technical_highlight: String,
}

impl DigestResponse {
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
            && self.key_developments.is_empty()
            && self.emerging_trends.is_empty()
            && self.technical_highlight.is_empty()
    }
}
