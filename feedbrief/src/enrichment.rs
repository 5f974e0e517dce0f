//! Per-entry enrichment: image descriptions and linked-page summaries.
//!
//! Both steps retry on any error. Their failures never fail a run: the
//! caller logs them and leaves the entry without the enrichment.

use anyhow::Context;
use common::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::entry::Entry;
use crate::fetcher::ResilientFetcher;
use crate::llm::{strip_thinking, LlmClient, LlmRequest};
use crate::prompts;
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::scraping::{first_external_link, ArticleExtractor, ImageFetcher};

/// Model and size settings for the enrichment calls
#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub image_model: String,
    pub link_model: String,
    pub image_max_tokens: usize,
    pub link_max_tokens: usize,
    pub temperature: f32,
    pub max_page_chars: usize,
}

impl EnrichmentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image_model: config.llm.image_model().to_string(),
            link_model: config.llm.link_model().to_string(),
            image_max_tokens: config.llm.image_max_tokens,
            link_max_tokens: config.llm.link_max_tokens,
            temperature: config.llm.temperature,
            max_page_chars: config.fetch.max_page_chars,
        }
    }

    /// Rough word budget that fits in the link summary token limit
    fn link_summary_words(&self) -> usize {
        (self.link_max_tokens * 3 / 4).max(50)
    }
}

/// What an enrichment step produced, kept for telemetry.
#[derive(Debug, Clone)]
pub struct Enrichment {
    /// Image URL or linked page URL
    pub target: String,
    /// Prompt text sent to the model (image payloads excluded)
    pub input: String,
    pub output: String,
}

pub struct Enricher {
    llm: LlmClient,
    images: Arc<dyn ImageFetcher>,
    pages: ResilientFetcher,
    extractor: Arc<dyn ArticleExtractor>,
    policy: RetryPolicy,
    settings: EnrichmentSettings,
}

impl Enricher {
    pub fn new(
        llm: LlmClient,
        images: Arc<dyn ImageFetcher>,
        pages: ResilientFetcher,
        extractor: Arc<dyn ArticleExtractor>,
        policy: RetryPolicy,
        settings: EnrichmentSettings,
    ) -> Self {
        Self {
            llm,
            images,
            pages,
            extractor,
            policy,
            settings,
        }
    }

    pub fn settings(&self) -> &EnrichmentSettings {
        &self.settings
    }

    /// Describe the entry's first image. `Ok(None)` when it has no image.
    pub async fn describe_image(
        &self,
        cancel: &CancellationToken,
        entry: &Entry,
    ) -> Result<Option<Enrichment>, RetryError<anyhow::Error>> {
        let Some(image_url) = entry.image_urls.first() else {
            return Ok(None);
        };
        let user_prompt = prompts::image_user_prompt(&entry.title);
        let base = LlmRequest::new(prompts::IMAGE_SYSTEM_PROMPT)
            .user(user_prompt.clone())
            .model(self.settings.image_model.clone())
            .max_tokens(self.settings.image_max_tokens)
            .temperature(self.settings.temperature);
        let base = &base;
        let image_url = image_url.as_str();

        let description = retry(
            cancel,
            &self.policy,
            move |_| async move {
                let data_uri = self
                    .images
                    .fetch_as_base64(cancel, image_url)
                    .await
                    .with_context(|| format!("failed to fetch image {}", image_url))?;
                let request = base.clone().image(data_uri);
                let response = self.llm.complete(cancel, &request).await?;
                let description = strip_thinking(&response.content);
                anyhow::ensure!(!description.is_empty(), "model returned an empty image description");
                Ok(description)
            },
            |_| true,
        )
        .await?;

        Ok(Some(Enrichment {
            target: image_url.to_string(),
            input: user_prompt,
            output: description,
        }))
    }

    /// Summarize the first external link of the entry. `Ok(None)` when there is none.
    pub async fn summarize_link(
        &self,
        cancel: &CancellationToken,
        entry: &Entry,
    ) -> Result<Option<Enrichment>, RetryError<anyhow::Error>> {
        let Some(link) = first_external_link(entry) else {
            return Ok(None);
        };
        let page_url = match Url::parse(&link) {
            Ok(url) => url,
            Err(e) => return Err(RetryError::Permanent(anyhow::anyhow!("invalid link {}: {}", link, e))),
        };
        let system_prompt = prompts::link_system_prompt(self.settings.link_summary_words());
        let (link_ref, page_url, system_prompt) = (link.as_str(), &page_url, system_prompt.as_str());

        let (input, summary) = retry(
            cancel,
            &self.policy,
            move |_| async move {
                let (_, body) = self.pages.fetch_bytes(cancel, link_ref).await?;
                let article = self.extractor.extract(&body, page_url)?;
                anyhow::ensure!(!article.text.trim().is_empty(), "no readable text at {}", link_ref);

                let text = truncate_chars(article.text.trim(), self.settings.max_page_chars);
                let user_prompt = prompts::link_user_prompt(link_ref, &article.title, text);
                let request = LlmRequest::new(system_prompt)
                    .user(user_prompt.clone())
                    .model(self.settings.link_model.clone())
                    .max_tokens(self.settings.link_max_tokens)
                    .temperature(self.settings.temperature);
                let response = self.llm.complete(cancel, &request).await?;
                let summary = strip_thinking(&response.content);
                anyhow::ensure!(!summary.is_empty(), "model returned an empty link summary");
                Ok((user_prompt, summary))
            },
            |_| true,
        )
        .await?;

        Ok(Some(Enrichment {
            target: link,
            input,
            output: summary,
        }))
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn link_word_budget_has_a_floor() {
        let settings = EnrichmentSettings {
            image_model: "m".to_string(),
            link_model: "m".to_string(),
            image_max_tokens: 10,
            link_max_tokens: 20,
            temperature: 0.2,
            max_page_chars: 100,
        };
        assert_eq!(settings.link_summary_words(), 50);
    }
}
