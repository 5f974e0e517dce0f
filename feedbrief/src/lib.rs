// Library interface for feedbrief modules
// This allows tests and the binary to import modules

pub mod enrichment;
pub mod entry;
pub mod fetcher;
pub mod ingestion;
pub mod llm;
pub mod processing;
pub mod prompts;
pub mod report;
pub mod retry;
pub mod scraping;
pub mod storage;
pub mod telemetry;
pub mod worker;
