//! One persona run end to end: ingest, process, record, report.

use anyhow::{Context, Result};
use chrono::Utc;
use common::{Config, Persona};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::enrichment::{Enricher, EnrichmentSettings};
use crate::entry::Entry;
use crate::fetcher::ResilientFetcher;
use crate::ingestion::FeedIngester;
use crate::llm::{LlmClient, LlmProvider};
use crate::processing::{EntryProcessor, ProcessorSettings};
use crate::report;
use crate::retry::RetryPolicy;
use crate::scraping::{ArticleExtractor, HttpImageFetcher, ImageFetcher, ReadabilityExtractor};
use crate::storage::{save_run_record, select_unsent, SentIds};
use crate::telemetry::{ModelsUsed, RunTelemetry};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// POST the run record to the audit endpoint when one is configured
    pub submit: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { submit: true }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub persona: String,
    pub entries: usize,
    pub processed: usize,
    pub sent: usize,
    pub failures: usize,
    pub record_path: Option<PathBuf>,
    pub report_path: PathBuf,
}

/// Long-lived collaborators shared by every persona run.
pub struct Pipeline {
    config: Config,
    llm: LlmClient,
    fetcher: ResilientFetcher,
    images: Arc<dyn ImageFetcher>,
    extractor: Arc<dyn ArticleExtractor>,
    audit_client: reqwest::Client,
}

impl Pipeline {
    /// Production wiring: HTTP image fetcher and readability extraction.
    pub fn new(config: Config, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        let fetcher = ResilientFetcher::new(&config.fetch, RetryPolicy::from(&config.retry.fetch))?;
        let images: Arc<dyn ImageFetcher> = Arc::new(HttpImageFetcher::new(fetcher.clone()));
        Self::with_collaborators(config, provider, images, Arc::new(ReadabilityExtractor))
    }

    pub fn with_collaborators(
        config: Config,
        provider: Arc<dyn LlmProvider>,
        images: Arc<dyn ImageFetcher>,
        extractor: Arc<dyn ArticleExtractor>,
    ) -> Result<Self> {
        let fetcher = ResilientFetcher::new(&config.fetch, RetryPolicy::from(&config.retry.fetch))?;
        let llm = LlmClient::new(provider, RetryPolicy::from(&config.retry.model_loading));
        let audit_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.fetch.timeout_seconds))
            .build()
            .context("failed to build audit client")?;
        Ok(Self {
            config,
            llm,
            fetcher,
            images,
            extractor,
            audit_client,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingest the persona's feeds and run them through [`Pipeline::run_entries`].
    pub async fn run_persona(
        &self,
        cancel: &CancellationToken,
        persona: &Persona,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let ingester = FeedIngester::new(self.fetcher.clone());
        let entries = ingester.collect(cancel, persona).await?;
        info!(persona = %persona.name, "collected {} entries", entries.len());
        self.run_entries(cancel, persona, entries, options).await
    }

    /// Process already-ingested entries, store the run record (also on
    /// failure), submit it, write the report and mark its items as sent.
    pub async fn run_entries(
        &self,
        cancel: &CancellationToken,
        persona: &Persona,
        mut entries: Vec<Entry>,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let storage = &self.config.storage;
        let mut sent = SentIds::load(&storage.sent_ids_path).await?;

        let enrichment_settings = EnrichmentSettings::from_config(&self.config);
        let mut telemetry = RunTelemetry::new(&persona.name);
        telemetry.record_models(ModelsUsed {
            summary: self.config.llm.model.clone(),
            digest: self.config.llm.model.clone(),
            image: enrichment_settings.image_model.clone(),
            link: enrichment_settings.link_model.clone(),
        });

        let enricher = Enricher::new(
            self.llm.clone(),
            self.images.clone(),
            self.fetcher.clone(),
            self.extractor.clone(),
            RetryPolicy::from(&self.config.retry.default),
            enrichment_settings,
        );
        let processor = EntryProcessor::new(
            self.llm.clone(),
            enricher,
            persona.clone(),
            ProcessorSettings::from_config(&self.config),
        )
        .exclude_from_digest(sent.ids().cloned());

        let result = processor.process(cancel, &mut entries, &mut telemetry).await;
        if let Err(e) = &result {
            error!(persona = %persona.name, "run failed: {}", e);
            telemetry.set_error(e.to_string());
        }
        telemetry.finalize();

        let record_path = match save_run_record(&storage.runs_dir, telemetry.record_ref()).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(persona = %persona.name, "failed to save run record: {:#}", e);
                None
            }
        };
        if options.submit {
            if let Some(audit) = &self.config.audit {
                telemetry.submit(&self.audit_client, &audit.url()).await;
            }
        }

        let outcome = result?;
        let outgoing = select_unsent(&outcome.items, &sent);
        let generated_at = Utc::now();
        let markdown = report::render_markdown(&persona.name, generated_at, &outcome.digest, &outgoing);
        let report_path = report::write_report(&storage.reports_dir, &persona.name, generated_at, &markdown).await?;

        let sent_count = outgoing.len();
        sent.insert_all(outgoing.iter().map(|item| item.id.clone()));
        sent.save().await?;

        let summary = RunSummary {
            persona: persona.name.clone(),
            entries: entries.len(),
            processed: outcome.items.len(),
            sent: sent_count,
            failures: outcome.failures.len(),
            record_path,
            report_path,
        };
        info!(
            persona = %summary.persona,
            entries = summary.entries,
            processed = summary.processed,
            sent = summary.sent,
            failures = summary.failures,
            "run complete"
        );
        Ok(summary)
    }
}
