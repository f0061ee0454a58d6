//! object-page: replay intent scripts against a schema.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store, one JSON line per step on stdout
//! object-page replay --schema demos/schema.yaml --script demos/ticket.yaml
//!
//! # Against the object service (OBJECT_PAGE_BASE_URL / OBJECT_PAGE_TOKEN, or --config)
//! object-page replay --schema demos/schema.yaml --script demos/ticket.yaml --store http
//! ```

mod script;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use object_page_client::{ClientConfig, HttpObjectStore};
use object_page_core::{
    ControllerConfig, MemoryObjectStore, ModelRegistry, ObjectController, ObjectStore,
    SchemaRegistry,
};

use crate::script::ReplayScript;

/// Used when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "object_page=info";

#[derive(Parser)]
#[command(name = "object-page")]
#[command(version)]
#[command(about = "Drive the object page engine from intent scripts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Http,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind a record and dispatch each scripted intent
    Replay {
        /// Schema file with models and forms
        #[arg(long)]
        schema: PathBuf,

        /// Replay script (bind, seed, steps)
        #[arg(long)]
        script: PathBuf,

        #[arg(long, value_enum, default_value = "memory")]
        store: StoreKind,

        /// Client config for the http store; environment variables otherwise
        #[arg(long)]
        config: Option<PathBuf>,

        /// Controller config (YAML)
        #[arg(long)]
        controller_config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Replay {
            schema,
            script,
            store,
            config,
            controller_config,
        } => cmd_replay(schema, script, store, config, controller_config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_replay(
    schema: PathBuf,
    script: PathBuf,
    store_kind: StoreKind,
    config: Option<PathBuf>,
    controller_config: Option<PathBuf>,
) -> Result<()> {
    let registry: Arc<dyn ModelRegistry> = Arc::new(
        SchemaRegistry::from_file(&schema)
            .with_context(|| format!("Failed to load schema {}", schema.display()))?,
    );
    let script = ReplayScript::from_file(&script)?;

    let controller_config = match controller_config {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ControllerConfig::from_yaml_str(&content)?
        }
        None => ControllerConfig::default(),
    };

    let store: Arc<dyn ObjectStore> = match store_kind {
        StoreKind::Memory => {
            let memory = MemoryObjectStore::new();
            script::seed(&memory, &script.seed).await;
            Arc::new(memory)
        }
        StoreKind::Http => {
            if !script.seed.is_empty() {
                warn!(records = script.seed.len(), "seed records ignored for the http store");
            }
            let client_config = match config {
                Some(path) => ClientConfig::from_file(path)?,
                None => ClientConfig::from_env()?,
            };
            info!(base_url = %client_config.base_url, "using http store");
            Arc::new(HttpObjectStore::new(client_config)?)
        }
    };

    let builder = ObjectController::builder(registry, store).config(controller_config);
    let mut controller = script::bind(builder, script.bind).await?;
    println!("{}", serde_json::to_string(&controller.view())?);

    for line in script::replay(&mut controller, script.steps).await {
        println!("{line}");
    }
    Ok(())
}
