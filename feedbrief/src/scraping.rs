use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use std::io::Cursor;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::entry::Entry;
use crate::fetcher::ResilientFetcher;

/// Readable text pulled out of an HTML page
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub title: String,
    pub text: String,
}

/// Turns a fetched page into clean text.
pub trait ArticleExtractor: Send + Sync {
    fn extract(&self, body: &[u8], source_url: &Url) -> Result<Article>;
}

/// Mozilla-readability port followed by HTML to Markdown conversion
pub struct ReadabilityExtractor;

impl ArticleExtractor for ReadabilityExtractor {
    fn extract(&self, body: &[u8], source_url: &Url) -> Result<Article> {
        let mut reader = Cursor::new(body);
        let product = readability::extractor::extract(&mut reader, source_url)
            .map_err(|e| anyhow::anyhow!("readability failed for {}: {}", source_url, e))?;

        // Convert HTML to Markdown for cleaner LLM input
        let text = match html2text::from_read(product.content.as_bytes(), 80) {
            Ok(markdown) => {
                info!("scraping: readability extracted {} chars markdown from {}", markdown.len(), source_url);
                markdown
            }
            Err(e) => {
                warn!("scraping: failed to convert extracted HTML to markdown: {}", e);
                product.text
            }
        };

        Ok(Article {
            title: product.title,
            text,
        })
    }
}

/// Fetches an image and inlines it as a data URI.
#[async_trait::async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_as_base64(&self, cancel: &CancellationToken, url: &str) -> Result<String>;
}

pub struct HttpImageFetcher {
    fetcher: ResilientFetcher,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(fetcher: ResilientFetcher) -> Self {
        Self {
            fetcher,
            max_bytes: 8 * 1024 * 1024,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[async_trait::async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch_as_base64(&self, cancel: &CancellationToken, url: &str) -> Result<String> {
        let (headers, bytes) = self.fetcher.fetch_limited(cancel, url, self.max_bytes).await?;
        let mime = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"))
            .or_else(|| mime_from_extension(url).map(str::to_string))
            .with_context(|| format!("{} did not return an image", url))?;
        Ok(format!("data:{};base64,{}", mime, STANDARD.encode(&bytes)))
    }
}

const IMAGE_EXTENSIONS: [(&str, &str); 6] = [
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".webp", "image/webp"),
    (".svg", "image/svg+xml"),
];

fn mime_from_extension(url: &str) -> Option<&'static str> {
    let path = Url::parse(url).ok()?.path().to_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .find(|(ext, _)| path.ends_with(ext))
        .map(|(_, mime)| *mime)
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'\]\)]+"#).expect("valid URL regex"))
}

fn normalized_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.trim_start_matches("www.").to_lowercase())
}

/// First outbound link of an entry worth summarizing.
///
/// Explicit links are considered before URLs found in the body. Links back to
/// the entry's own host, to its images, or to image files are skipped.
pub fn first_external_link(entry: &Entry) -> Option<String> {
    let own_host = entry
        .source_url
        .as_deref()
        .and_then(|u| Url::parse(u).ok())
        .and_then(|u| normalized_host(&u));

    let body_links = url_regex()
        .find_iter(&entry.body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']));

    entry
        .external_links
        .iter()
        .map(String::as_str)
        .chain(body_links)
        .find(|candidate| {
            let Ok(url) = Url::parse(candidate) else {
                return false;
            };
            if !matches!(url.scheme(), "http" | "https") {
                return false;
            }
            let host = normalized_host(&url);
            if host.is_none() || host == own_host {
                return false;
            }
            if entry.image_urls.iter().any(|i| i.as_str() == *candidate) {
                return false;
            }
            mime_from_extension(candidate).is_none()
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(source: &str, links: &[&str], body: &str) -> Entry {
        let mut entry = Entry::new("1", "t", body);
        entry.source_url = Some(source.to_string());
        entry.external_links = links.iter().map(|s| s.to_string()).collect();
        entry
    }

    #[test]
    fn skips_self_references_and_images() {
        let mut entry = entry_with(
            "https://www.reddit.com/r/rust/comments/1",
            &[
                "https://reddit.com/r/rust/comments/1",
                "https://i.example.com/cat.png",
                "https://blog.example.com/post",
            ],
            "",
        );
        entry.image_urls.push("https://img.example.com/view?id=3".to_string());
        entry.external_links.insert(0, "https://img.example.com/view?id=3".to_string());

        assert_eq!(first_external_link(&entry).as_deref(), Some("https://blog.example.com/post"));
    }

    #[test]
    fn falls_back_to_body_urls() {
        let entry = entry_with(
            "https://news.example.org/item/9",
            &[],
            "See https://news.example.org/other and (https://github.com/rust-lang/rust). Also https://docs.rs/tokio.",
        );
        assert_eq!(
            first_external_link(&entry).as_deref(),
            Some("https://github.com/rust-lang/rust")
        );
    }

    #[test]
    fn no_candidates() {
        let entry = entry_with("https://example.com/a", &["mailto:someone@example.com"], "no links");
        assert_eq!(first_external_link(&entry), None);
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(mime_from_extension("https://x.test/a/B.JPG?x=1"), Some("image/jpeg"));
        assert_eq!(mime_from_extension("https://x.test/a/page.html"), None);
    }

    #[test]
    fn readability_extracts_article_text() {
        let html = br#"<html><head><title>Release notes</title></head><body>
            <nav>Home | About</nav>
            <article><h1>Release notes</h1>
            <p>The new release improves incremental compilation times considerably for large workspaces.</p>
            <p>It also stabilizes several long-awaited language features that users have requested for years.</p>
            </article></body></html>"#;
        let url = Url::parse("https://example.com/notes").unwrap();
        let article = ReadabilityExtractor.extract(html, &url).expect("extract");
        assert!(article.text.contains("incremental compilation"));
    }
}
