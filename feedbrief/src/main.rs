/*
feedbrief - runs every configured persona once: ingest feeds, enrich and
summarize entries with the LLM, write the digest report and the run record.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use feedbrief::llm::remote::RemoteLlmProvider;
use feedbrief::llm::LlmProvider;
use feedbrief::worker::{Pipeline, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "feedbrief", about = "Persona-driven feed digests summarized by an LLM")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run only this persona
    #[arg(long, value_name = "NAME")]
    persona: Option<String>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not submit run records to the audit endpoint
    #[arg(long)]
    no_submit: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = match load_config(args.config.clone()).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {:#}", e);
            return Err(e);
        }
    };

    let personas = match &args.persona {
        Some(name) => {
            let persona = config
                .persona(name)
                .cloned()
                .with_context(|| format!("unknown persona: {}", name))?;
            vec![persona]
        }
        None => config.personas.clone(),
    };

    let provider: Arc<dyn LlmProvider> = Arc::new(create_llm_provider(&config.llm)?);
    info!(model = %provider.default_model(), api_url = %config.llm.api_url, "LLM provider initialized");
    let pipeline = Pipeline::new(config, provider)?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, cancelling run");
            ctrl_c_token.cancel();
        }
    });

    let options = RunOptions {
        submit: !args.no_submit,
    };
    let mut failed = 0;
    for persona in &personas {
        if cancel.is_cancelled() {
            warn!(persona = %persona.name, "skipping persona after cancellation");
            failed += 1;
            continue;
        }
        info!(persona = %persona.name, "starting run");
        match pipeline.run_persona(&cancel, persona, options).await {
            Ok(summary) => info!(
                persona = %summary.persona,
                report = %summary.report_path.display(),
                "persona finished"
            ),
            Err(e) => {
                error!(persona = %persona.name, "persona run failed: {:#}", e);
                failed += 1;
            }
        }
    }

    if failed == personas.len() {
        anyhow::bail!("all {} persona run(s) failed", failed);
    }
    if failed > 0 {
        warn!("{} of {} persona run(s) failed", failed, personas.len());
    }
    info!("Shutdown complete");
    Ok(())
}

async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = match explicit {
        Some(p) => {
            if !p.exists() {
                anyhow::bail!("Config file not found: {}", p.display());
            }
            Some(p)
        }
        None => {
            let p = PathBuf::from("config.toml");
            p.exists().then_some(p)
        }
    };

    let config = Config::load_with_defaults(
        default_path.exists().then_some(default_path.as_path()),
        override_path.as_deref(),
    )
    .await?;
    config.validate()?;
    info!(default = ?default_path, override = ?override_path, personas = config.personas.len(), "configuration loaded");
    Ok(config)
}

/// The API key is read from the environment variable named in the config;
/// local servers run without one.
fn create_llm_provider(llm: &common::LlmConfig) -> Result<RemoteLlmProvider> {
    let api_key = match llm.api_key_env.as_deref() {
        Some(var) => Some(
            std::env::var(var).with_context(|| format!("LLM API key env var '{}' not set", var))?,
        ),
        None => None,
    };
    Ok(RemoteLlmProvider::new(llm.api_url.clone(), api_key, llm.model.clone()).with_defaults(
        llm.timeout_seconds,
        llm.summary_max_tokens,
        llm.temperature,
    ))
}
