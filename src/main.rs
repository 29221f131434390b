mod agent;
mod api;
mod config;
mod error;
mod footnotes;
mod llm;
mod orchestrator;
mod pipeline;
mod progress;
mod state;
mod storage;
#[cfg(test)]
mod testing;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::VerifierConfig;
use footnotes::types::Footnote;
use llm::LlmClient;
use pipeline::{ToolScope, VerificationPipeline};
use progress::store::{open_snapshot_store, MemorySnapshotStore, SnapshotStore};
use progress::ProgressHub;
use state::AppState;
use storage::{BlobStore, KvStore, MemoryBlobStore};
use tools::fetch::HttpFetcher;
use tools::{ToolState, Toolbelt};

#[derive(Parser)]
#[command(name = "footnote-verifier")]
#[command(about = "Checks that footnote citations support the claims they are attached to")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, env = "VERIFIER_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "VERIFIER_LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the progress and verification API
    Serve {
        #[arg(short, long, env = "VERIFIER_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
        listen: String,
    },
    /// Verify one document's footnotes and print the result
    Verify {
        /// JSON file: a footnote array or `{"footnotes": [...]}`
        #[arg(short, long)]
        input: PathBuf,
        /// Defaults to a hash of the input file
        #[arg(long)]
        document_id: Option<String>,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep progress and results in memory only; nothing is written to the data dir
        #[arg(long)]
        ephemeral: bool,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FootnoteInput {
    List(Vec<Footnote>),
    Wrapped { footnotes: Vec<Footnote> },
}

struct Engine {
    pipeline: Arc<VerificationPipeline>,
    progress: Arc<ProgressHub>,
    blobs: Arc<dyn BlobStore>,
}

async fn build_engine(config: &VerifierConfig, ephemeral: bool) -> anyhow::Result<Engine> {
    let blobs: Arc<dyn BlobStore>;
    let snapshots: Arc<dyn SnapshotStore>;
    if ephemeral {
        info!("in-memory stores, nothing is persisted");
        blobs = Arc::new(MemoryBlobStore::default());
        snapshots = Arc::new(MemorySnapshotStore::default());
    } else {
        let kv = Arc::new(KvStore::open(&config.storage.data_dir).await?);
        info!("Store initialized at {:?}", config.storage.data_dir);
        snapshots =
            open_snapshot_store(config.storage.progress_database_url.as_deref(), kv.clone())
                .await?;
        blobs = kv;
    }
    let progress = Arc::new(ProgressHub::new(snapshots));

    let llm = LlmClient::from_settings(&config.llm)?;
    info!(model = %config.llm.model, quick_model = %config.llm.quick_model, "LLM client initialized");

    let fetcher = HttpFetcher::new()?;
    let tools = if config.share_tool_state {
        let state = Arc::new(ToolState::new(&config.search));
        ToolScope::Shared(Arc::new(Toolbelt::new(
            fetcher,
            state,
            config.search.api_url.clone(),
        )))
    } else {
        ToolScope::PerRun {
            fetcher,
            search: config.search.clone(),
        }
    };
    info!(shared = config.share_tool_state, "tool state scope");

    let pipeline = Arc::new(VerificationPipeline::new(
        Arc::new(llm),
        tools,
        config.run.clone(),
        config.search.api_key.clone(),
        blobs.clone(),
    ));

    Ok(Engine {
        pipeline,
        progress,
        blobs,
    })
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = VerifierConfig::from_env()?;

    match cli.command {
        Command::Serve { listen } => {
            let engine = build_engine(&config, false).await?;
            let state = AppState::new(engine.pipeline, engine.progress, engine.blobs);
            let app = api::create_router(state);
            let listener = tokio::net::TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to bind {}", listen))?;
            info!(%listen, "serving");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutting down");
                })
                .await?;
        }
        Command::Verify {
            input,
            document_id,
            output,
            ephemeral,
        } => {
            let engine = build_engine(&config, ephemeral).await?;
            let raw = std::fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let footnotes = match serde_json::from_slice::<FootnoteInput>(&raw)
                .context("Input is not a footnote list")?
            {
                FootnoteInput::List(f) | FootnoteInput::Wrapped { footnotes: f } => f,
            };
            let document_id = document_id
                .unwrap_or_else(|| blake3::hash(&raw).to_hex()[..16].to_string());

            let handle = engine.progress.handle(&document_id);
            let mut updates = handle.subscribe().await?;
            let watcher = tokio::spawn(async move {
                while let Some(snapshot) = updates.recv().await {
                    info!(
                        status = ?snapshot.status,
                        done = snapshot.verifications.len(),
                        total = snapshot.footnote_count,
                        "progress"
                    );
                }
            });

            let result = engine
                .pipeline
                .run_document(&document_id, footnotes, &handle)
                .await?;
            drop(handle);
            watcher.abort();

            let rendered = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(document_id = %document_id, path = %path.display(), "result written");
                }
                None => println!("{}", rendered),
            }
        }
    }

    Ok(())
}
