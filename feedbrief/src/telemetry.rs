//! Run instrumentation: per-phase timings and per-entry input/output records,
//! finalized once into a [`RunRecord`] that is stored locally and submitted
//! to the audit endpoint.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entry::DigestResponse;
use crate::processing::Phase;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelsUsed {
    pub summary: String,
    pub digest: String,
    pub image: String,
    pub link: String,
}

/// One timed operation on one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub entry_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub ran: bool,
    pub elapsed_ms: u64,
    pub entries: Vec<EntryRecord>,
}

impl PhaseRecord {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.success).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecords {
    pub images: PhaseRecord,
    pub links: PhaseRecord,
    pub summaries: PhaseRecord,
    pub digest: PhaseRecord,
}

impl PhaseRecords {
    fn get(&self, phase: Phase) -> Option<&PhaseRecord> {
        match phase {
            Phase::Images => Some(&self.images),
            Phase::Links => Some(&self.links),
            Phase::TextSummaries => Some(&self.summaries),
            Phase::Digest => Some(&self.digest),
            Phase::Done => None,
        }
    }

    fn get_mut(&mut self, phase: Phase) -> Option<&mut PhaseRecord> {
        match phase {
            Phase::Images => Some(&mut self.images),
            Phase::Links => Some(&mut self.links),
            Phase::TextSummaries => Some(&mut self.summaries),
            Phase::Digest => Some(&mut self.digest),
            Phase::Done => None,
        }
    }

    fn total_elapsed_ms(&self) -> u64 {
        [&self.images, &self.links, &self.summaries, &self.digest]
            .iter()
            .map(|p| p.elapsed_ms)
            .sum()
    }
}

/// Everything that happened during one persona run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub persona: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub models: ModelsUsed,
    pub phases: PhaseRecords,
    pub total_elapsed_ms: u64,
    pub entries_attempted: usize,
    pub entries_succeeded: usize,
    pub success_rate: f64,
    pub digest: Option<DigestResponse>,
    pub failures: Vec<String>,
    /// Set when the run failed fatally
    pub error: Option<String>,
}

/// Accumulates a [`RunRecord`]. Owned by the single task driving a run.
pub struct RunTelemetry {
    record: RunRecord,
    phase_started: Option<(Phase, Instant)>,
    finalized: bool,
}

impl RunTelemetry {
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            record: RunRecord {
                run_id: Uuid::new_v4(),
                persona: persona.into(),
                started_at: Utc::now(),
                finished_at: None,
                models: ModelsUsed::default(),
                phases: PhaseRecords::default(),
                total_elapsed_ms: 0,
                entries_attempted: 0,
                entries_succeeded: 0,
                success_rate: 0.0,
                digest: None,
                failures: Vec::new(),
                error: None,
            },
            phase_started: None,
            finalized: false,
        }
    }

    pub fn record_models(&mut self, models: ModelsUsed) {
        self.record.models = models;
    }

    pub fn begin_phase(&mut self, phase: Phase) {
        if let Some(p) = self.record.phases.get_mut(phase) {
            p.ran = true;
            self.phase_started = Some((phase, Instant::now()));
        }
    }

    pub fn end_phase(&mut self, phase: Phase) {
        match self.phase_started.take() {
            Some((started_phase, started)) if started_phase == phase => {
                if let Some(p) = self.record.phases.get_mut(phase) {
                    p.elapsed_ms += duration_ms(started.elapsed());
                }
            }
            other => {
                warn!(?phase, "telemetry: end_phase without matching begin_phase");
                self.phase_started = other;
            }
        }
    }

    /// Append one entry record. `result` carries the output text or the error message.
    pub fn record(
        &mut self,
        phase: Phase,
        entry_id: &str,
        elapsed: Duration,
        raw_input: impl Into<String>,
        result: Result<String, String>,
    ) {
        let Some(p) = self.record.phases.get_mut(phase) else {
            return;
        };
        let elapsed_ms = duration_ms(elapsed);
        let started_at = Utc::now()
            - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let (output, error, success) = match result {
            Ok(output) => (Some(output), None, true),
            Err(error) => (None, Some(error), false),
        };
        p.entries.push(EntryRecord {
            entry_id: entry_id.to_string(),
            started_at,
            elapsed_ms,
            input: raw_input.into(),
            output,
            error,
            success,
        });
    }

    pub fn set_digest(&mut self, digest: DigestResponse) {
        self.record.digest = Some(digest);
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.record.failures.push(failure.into());
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.record.error = Some(error.into());
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.record.phases.get(phase)
    }

    /// Compute totals and the success rate. Only the first call has any effect.
    pub fn finalize(&mut self) -> &RunRecord {
        if !self.finalized {
            if let Some((phase, _)) = self.phase_started {
                self.end_phase(phase);
            }
            let summaries = &self.record.phases.summaries;
            let attempted = summaries.entries.len();
            let succeeded = summaries.succeeded();

            self.record.total_elapsed_ms = self.record.phases.total_elapsed_ms();
            self.record.entries_attempted = attempted;
            self.record.entries_succeeded = succeeded;
            self.record.success_rate = if attempted == 0 {
                0.0
            } else {
                succeeded as f64 / attempted as f64
            };
            self.record.finished_at = Some(Utc::now());
            self.finalized = true;
        }
        &self.record
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_ref(&self) -> &RunRecord {
        &self.record
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.record).context("failed to serialize run record")
    }

    /// POST the record to the audit endpoint. Failures are logged, never returned.
    pub async fn submit(&self, client: &reqwest::Client, url: &str) -> bool {
        let body = match self.serialize() {
            Ok(body) => body,
            Err(e) => {
                warn!("telemetry: {:#}", e);
                return false;
            }
        };

        let response = client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(run_id = %self.record.run_id, status = %resp.status(), "telemetry: run record submitted");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                warn!(run_id = %self.record.run_id, %status, body = %text, "telemetry: audit endpoint rejected run record");
                false
            }
            Err(e) => {
                warn!(run_id = %self.record.run_id, "telemetry: failed to submit run record: {}", e);
                false
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
