use anyhow::{Context, Result};
use common::Persona;
use feed_rs::model::{Entry as FeedEntry, Feed};
use feed_rs::parser;
use scraper::{Html, Selector};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::entry::Entry;
use crate::fetcher::ResilientFetcher;

/// Pulls a persona's RSS/Atom feeds and turns their items into entries.
pub struct FeedIngester {
    fetcher: ResilientFetcher,
}

impl FeedIngester {
    pub fn new(fetcher: ResilientFetcher) -> Self {
        Self { fetcher }
    }

    /// Fetches a feed from the given URL and parses it.
    pub async fn fetch_feed(&self, cancel: &CancellationToken, url: &str) -> Result<Feed> {
        let (_, bytes) = self.fetcher.fetch_bytes(cancel, url).await?;
        parser::parse(bytes.as_slice()).with_context(|| format!("failed to parse feed {}", url))
    }

    /// All entries of the persona's feeds, duplicates dropped, capped at `max_entries`.
    ///
    /// A failing feed is skipped; the call fails only when every feed failed.
    pub async fn collect(&self, cancel: &CancellationToken, persona: &Persona) -> Result<Vec<Entry>> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut failed = 0;
        let mut last_error = None;

        for feed_url in &persona.feeds {
            let feed = match self.fetch_feed(cancel, feed_url).await {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(persona = %persona.name, feed = %feed_url, "feed fetch failed: {:#}", e);
                    failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            let before = entries.len();
            for item in feed.entries {
                let entry = entry_from_feed(item, feed_url);
                if !seen.insert(entry.id.clone()) {
                    debug!("Skipping duplicate entry {}", entry.id);
                    continue;
                }
                entries.push(entry);
            }
            info!(persona = %persona.name, feed = %feed_url, "ingested {} entries", entries.len() - before);
        }

        if failed == persona.feeds.len() {
            if let Some(e) = last_error {
                return Err(e.context(format!("all feeds failed for persona '{}'", persona.name)));
            }
        }

        if let Some(max) = persona.max_entries {
            if entries.len() > max {
                info!(persona = %persona.name, "keeping {} of {} entries", max, entries.len());
                entries.truncate(max);
            }
        }
        Ok(entries)
    }
}

/// Convert one parsed feed item. Relative references resolve against the
/// item link, or the feed URL when the item has none.
pub fn entry_from_feed(item: FeedEntry, feed_url: &str) -> Entry {
    let source_url = item
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| item.links.first())
        .map(|l| l.href.clone());

    let html = item
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| item.summary.as_ref().map(|s| s.content.clone()))
        .unwrap_or_default();

    let base = source_url
        .as_deref()
        .and_then(|u| Url::parse(u).ok())
        .or_else(|| Url::parse(feed_url).ok());
    let refs = html_references(&html, base.as_ref());

    let mut image_urls = Vec::new();
    for media in &item.media {
        for content in &media.content {
            let is_image = content
                .content_type
                .as_ref()
                .map_or(false, |m| m.to_string().starts_with("image/"));
            if let (true, Some(url)) = (is_image, content.url.as_ref()) {
                image_urls.push(url.to_string());
            }
        }
        for thumbnail in &media.thumbnails {
            image_urls.push(thumbnail.image.uri.clone());
        }
    }
    image_urls.extend(refs.images);
    dedup_in_order(&mut image_urls);

    let mut external_links: Vec<String> = refs.links;
    external_links.extend(item.links.iter().skip(1).map(|l| l.href.clone()));
    dedup_in_order(&mut external_links);

    let title = item
        .title
        .map(|t| t.content.trim().to_string())
        .unwrap_or_else(|| "Untitled".to_string());
    let id = if item.id.trim().is_empty() {
        source_url.clone().unwrap_or_else(|| title.clone())
    } else {
        item.id
    };

    Entry {
        id,
        title,
        body: html_to_text(&html),
        thumbnail: image_urls.first().cloned(),
        source_url,
        image_urls,
        external_links,
        ..Default::default()
    }
}

struct HtmlReferences {
    images: Vec<String>,
    links: Vec<String>,
}

fn selector(css: &'static str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("invalid selector {}: {:?}", css, e);
            None
        }
    }
}

fn resolve(base: Option<&Url>, reference: &str) -> Option<String> {
    let resolved = match base {
        Some(base) => base.join(reference).ok()?,
        None => Url::parse(reference).ok()?,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn html_references(html: &str, base: Option<&Url>) -> HtmlReferences {
    let mut refs = HtmlReferences {
        images: Vec::new(),
        links: Vec::new(),
    };
    if html.is_empty() {
        return refs;
    }
    let document = Html::parse_fragment(html);
    if let Some(img) = selector("img[src]") {
        refs.images = document
            .select(&img)
            .filter_map(|el| el.value().attr("src"))
            .filter_map(|src| resolve(base, src))
            .collect();
    }
    if let Some(anchor) = selector("a[href]") {
        refs.links = document
            .select(&anchor)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| resolve(base, href))
            .collect();
    }
    refs
}

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), 100) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!("failed to convert entry HTML to text: {}", e);
            html.to_string()
        }
    }
}

fn dedup_in_order(values: &mut Vec<String>) {
    let mut seen = HashSet::new();
    values.retain(|v| seen.insert(v.clone()));
}
