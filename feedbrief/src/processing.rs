//! Entry processing pipeline.
//!
//! Phases run in a fixed order over the whole entry set:
//! images, links, text summaries, digest. Within a phase entries are handled
//! one at a time and a failing entry never stops the others.

use common::{Config, FeatureFlags, Persona};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::enrichment::Enricher;
use crate::entry::{DigestResponse, Entry, ItemVerdict, ProcessedItem};
use crate::llm::{parse_json_response, LlmClient, LlmError, LlmRequest};
use crate::prompts;
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::telemetry::RunTelemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Images,
    Links,
    TextSummaries,
    Digest,
    Done,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Images => Phase::Links,
            Phase::Links => Phase::TextSummaries,
            Phase::TextSummaries => Phase::Digest,
            Phase::Digest | Phase::Done => Phase::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Images => "images",
            Phase::Links => "links",
            Phase::TextSummaries => "summaries",
            Phase::Digest => "digest",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-entry failure that was isolated from the rest of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFailure {
    pub phase: Phase,
    pub entry_id: String,
    pub message: String,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.phase, self.entry_id, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("all {attempted} entries failed to summarize; first error: {first}")]
    AllEntriesFailed {
        attempted: usize,
        first: EntryFailure,
        failures: Vec<EntryFailure>,
    },
}

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// In entry order
    pub items: Vec<ProcessedItem>,
    pub digest: DigestResponse,
    pub failures: Vec<EntryFailure>,
}

/// Error of one structured-output step: completion failures are worth
/// retrying, malformed output is not.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("{0}")]
    Completion(RetryError<LlmError>),

    #[error("malformed model output: {0:#}")]
    Parse(anyhow::Error),
}

impl StepError {
    fn is_retryable(&self) -> bool {
        matches!(self, StepError::Completion(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub features: FeatureFlags,
    pub summary_policy: RetryPolicy,
    pub digest_policy: RetryPolicy,
    pub summary_model: String,
    pub summary_max_tokens: usize,
    pub digest_max_tokens: usize,
    pub temperature: f32,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            features: config.features.clone(),
            summary_policy: RetryPolicy::from(&config.retry.summaries),
            digest_policy: RetryPolicy::from(&config.retry.digest),
            summary_model: config.llm.model.clone(),
            summary_max_tokens: config.llm.summary_max_tokens,
            digest_max_tokens: config.llm.digest_max_tokens,
            temperature: config.llm.temperature,
        }
    }
}

pub struct EntryProcessor {
    llm: LlmClient,
    enricher: Enricher,
    persona: Persona,
    settings: ProcessorSettings,
    excluded: BTreeSet<String>,
}

impl EntryProcessor {
    pub fn new(llm: LlmClient, enricher: Enricher, persona: Persona, settings: ProcessorSettings) -> Self {
        Self {
            llm,
            enricher,
            persona,
            settings,
            excluded: BTreeSet::new(),
        }
    }

    /// Items with these ids are still summarized but left out of the digest.
    pub fn exclude_from_digest(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(ids);
        self
    }

    fn phase_enabled(&self, phase: Phase) -> bool {
        match phase {
            Phase::Images => self.settings.features.image_enrichment,
            Phase::Links => self.settings.features.link_enrichment,
            Phase::TextSummaries => true,
            Phase::Digest => self.settings.features.digest,
            Phase::Done => false,
        }
    }

    /// Run every phase over `entries`, enriching them in place.
    ///
    /// Fails only when no entry could be summarized and at least one tried.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        entries: &mut [Entry],
        telemetry: &mut RunTelemetry,
    ) -> Result<ProcessOutcome, ProcessError> {
        let mut outcome = ProcessOutcome::default();
        let mut phase = Phase::Images;

        while phase != Phase::Done {
            if !self.phase_enabled(phase) {
                info!(persona = %self.persona.name, "skipping {} phase (disabled)", phase);
                phase = phase.next();
                continue;
            }

            info!(persona = %self.persona.name, entries = entries.len(), "starting {} phase", phase);
            telemetry.begin_phase(phase);
            match phase {
                Phase::Images => self.run_images(cancel, entries, telemetry).await,
                Phase::Links => self.run_links(cancel, entries, telemetry).await,
                Phase::TextSummaries => {
                    self.run_summaries(cancel, entries, telemetry, &mut outcome).await
                }
                Phase::Digest => {
                    outcome.digest = self.run_digest(cancel, &outcome.items, telemetry, &mut outcome.failures).await;
                    telemetry.set_digest(outcome.digest.clone());
                }
                Phase::Done => {}
            }
            telemetry.end_phase(phase);

            if phase == Phase::TextSummaries && outcome.items.is_empty() {
                if let Some(first) = outcome.failures.first().cloned() {
                    return Err(ProcessError::AllEntriesFailed {
                        attempted: entries.len(),
                        first,
                        failures: outcome.failures,
                    });
                }
            }
            phase = phase.next();
        }

        if !outcome.failures.is_empty() {
            warn!(
                persona = %self.persona.name,
                failed = outcome.failures.len(),
                succeeded = outcome.items.len(),
                "run completed with partial failures"
            );
        }
        Ok(outcome)
    }

    async fn run_images(&self, cancel: &CancellationToken, entries: &mut [Entry], telemetry: &mut RunTelemetry) {
        for entry in entries.iter_mut() {
            if entry.image_urls.is_empty() {
                continue;
            }
            let started = Instant::now();
            match self.enricher.describe_image(cancel, entry).await {
                Ok(Some(enrichment)) => {
                    telemetry.record(
                        Phase::Images,
                        &entry.id,
                        started.elapsed(),
                        format!("{}\n{}", enrichment.target, enrichment.input),
                        Ok(enrichment.output.clone()),
                    );
                    entry.image_description = Some(enrichment.output);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(entry_id = %entry.id, "image enrichment failed, continuing without it: {:#}", e);
                    telemetry.record(
                        Phase::Images,
                        &entry.id,
                        started.elapsed(),
                        entry.image_urls.first().cloned().unwrap_or_default(),
                        Err(e.to_string()),
                    );
                }
            }
        }
    }

    async fn run_links(&self, cancel: &CancellationToken, entries: &mut [Entry], telemetry: &mut RunTelemetry) {
        for entry in entries.iter_mut() {
            let started = Instant::now();
            match self.enricher.summarize_link(cancel, entry).await {
                Ok(Some(enrichment)) => {
                    telemetry.record(
                        Phase::Links,
                        &entry.id,
                        started.elapsed(),
                        enrichment.input,
                        Ok(enrichment.output.clone()),
                    );
                    entry.link_summaries.insert(enrichment.target, enrichment.output);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(entry_id = %entry.id, "link enrichment failed, continuing without it: {:#}", e);
                    telemetry.record(Phase::Links, &entry.id, started.elapsed(), String::new(), Err(e.to_string()));
                }
            }
        }
    }

    async fn run_summaries(
        &self,
        cancel: &CancellationToken,
        entries: &[Entry],
        telemetry: &mut RunTelemetry,
        outcome: &mut ProcessOutcome,
    ) {
        let system_prompt = prompts::summary_system_prompt(&self.persona);

        for entry in entries {
            let started = Instant::now();
            let entry_text = entry.to_prompt_text();
            let request = LlmRequest::new(system_prompt.as_str())
                .user(entry_text.as_str())
                .schema(prompts::summary_schema())
                .model(self.settings.summary_model.clone())
                .max_tokens(self.settings.summary_max_tokens)
                .temperature(self.settings.temperature);

            let result = self
                .complete_structured::<ItemVerdict>(cancel, &self.settings.summary_policy, &request)
                .await;
            match result {
                Ok((raw, verdict)) => {
                    telemetry.record(Phase::TextSummaries, &entry.id, started.elapsed(), entry_text, Ok(raw));
                    outcome.items.push(ProcessedItem::from_verdict(entry, verdict));
                }
                Err(e) => {
                    error!(entry_id = %entry.id, "summary failed: {}", e);
                    telemetry.record(
                        Phase::TextSummaries,
                        &entry.id,
                        started.elapsed(),
                        entry_text,
                        Err(e.to_string()),
                    );
                    telemetry.add_failure(format!("summaries/{}: {}", entry.id, e));
                    outcome.failures.push(EntryFailure {
                        phase: Phase::TextSummaries,
                        entry_id: entry.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            persona = %self.persona.name,
            "summarized {}/{} entries",
            outcome.items.len(),
            entries.len()
        );
    }

    async fn run_digest(
        &self,
        cancel: &CancellationToken,
        items: &[ProcessedItem],
        telemetry: &mut RunTelemetry,
        failures: &mut Vec<EntryFailure>,
    ) -> DigestResponse {
        let relevant: Vec<&ProcessedItem> = items
            .iter()
            .filter(|item| item.is_relevant && !self.excluded.contains(&item.id))
            .collect();
        if relevant.is_empty() {
            info!(persona = %self.persona.name, "no relevant items, digest left empty");
            return DigestResponse::default();
        }

        let started = Instant::now();
        let user_prompt = prompts::digest_user_prompt(&relevant);
        let request = LlmRequest::new(prompts::digest_system_prompt(&self.persona))
            .user(user_prompt.as_str())
            .schema(prompts::digest_schema())
            .model(self.settings.summary_model.clone())
            .max_tokens(self.settings.digest_max_tokens)
            .temperature(self.settings.temperature);

        match self
            .complete_structured::<DigestResponse>(cancel, &self.settings.digest_policy, &request)
            .await
        {
            Ok((raw, digest)) => {
                telemetry.record(Phase::Digest, "digest", started.elapsed(), user_prompt, Ok(raw));
                drop_unknown_references(digest, &relevant)
            }
            Err(e) => {
                error!(persona = %self.persona.name, "digest generation failed: {}", e);
                telemetry.record(Phase::Digest, "digest", started.elapsed(), user_prompt, Err(e.to_string()));
                telemetry.add_failure(format!("digest: {}", e));
                failures.push(EntryFailure {
                    phase: Phase::Digest,
                    entry_id: "digest".to_string(),
                    message: e.to_string(),
                });
                DigestResponse::default()
            }
        }
    }

    /// One completion parsed into `T`, retried under `policy` unless the
    /// output itself was malformed. Returns the raw model text with the value.
    async fn complete_structured<T: serde::de::DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        request: &LlmRequest,
    ) -> Result<(String, T), RetryError<StepError>> {
        let llm = &self.llm;
        retry(
            cancel,
            policy,
            move |_| async move {
                let response = llm.complete(cancel, request).await.map_err(StepError::Completion)?;
                let value = parse_json_response::<T>(&response.content).map_err(StepError::Parse)?;
                Ok((response.content, value))
            },
            StepError::is_retryable,
        )
        .await
    }
}

fn drop_unknown_references(mut digest: DigestResponse, items: &[&ProcessedItem]) -> DigestResponse {
    let known: BTreeSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
    digest.key_developments.retain(|development| {
        let ok = known.contains(development.item_id.as_str());
        if !ok {
            warn!(item_id = %development.item_id, "digest references an unknown item, dropping it");
        }
        ok
    });
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::KeyDevelopment;

    #[test]
    fn phases_advance_in_order() {
        let mut seen = vec![Phase::Images];
        let mut phase = Phase::Images;
        while phase != Phase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![Phase::Images, Phase::Links, Phase::TextSummaries, Phase::Digest, Phase::Done]
        );
        assert_eq!(Phase::Done.next(), Phase::Done);
    }

    #[test]
    fn parse_errors_are_terminal() {
        assert!(!StepError::Parse(anyhow::anyhow!("bad json")).is_retryable());
        let completion = StepError::Completion(RetryError::MaxRetries {
            attempts: 1,
            last: LlmError::InvalidResponse("empty".to_string()),
        });
        assert!(completion.is_retryable());
    }

    #[test]
    fn unknown_digest_references_are_dropped() {
        let item = ProcessedItem {
            id: "a".to_string(),
            title: "A".to_string(),
            summary: "s".to_string(),
            comment_summary: None,
            is_relevant: true,
            relevance_reason: String::new(),
            link: None,
            thumbnail: None,
        };
        let digest = DigestResponse {
            summary: "overall".to_string(),
            key_developments: vec![
                KeyDevelopment {
                    text: "real".to_string(),
                    item_id: "a".to_string(),
                },
                KeyDevelopment {
                    text: "invented".to_string(),
                    item_id: "zzz".to_string(),
                },
            ],
            ..Default::default()
        };

        let digest = drop_unknown_references(digest, &[&item]);
        assert_eq!(digest.key_developments.len(), 1);
        assert_eq!(digest.key_developments[0].item_id, "a");
    }
}
