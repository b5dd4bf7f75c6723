//! Offline machine-translation gateway.
//!
//! `transgate` serves translations from native per-language-pair worker
//! processes. Workers are provisioned lazily, pooled for concurrency,
//! health-gated before admission, evicted when idle, and restarted in place
//! when they crash. Inputs mixing CJK and Latin scripts are split and routed
//! per segment; pairs with no direct model pivot through English.

pub mod catalog;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod lang;
pub mod pool;
pub mod ports;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use catalog::{ModelCatalog, RecordsCatalog};
use config::Settings;
use detect::LanguageDetector;
use dispatch::Dispatcher;
use pool::EnginePool;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "transgate",
    version,
    about = "Offline machine translation gateway"
)]
pub struct Cli {
    /// Override the model directory
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// Override the config directory (records catalog, worker binary)
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Override the worker binary path
    #[arg(long)]
    pub worker_binary: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(long)]
        port: Option<u16>,

        /// Workers per language pair
        #[arg(long)]
        workers_per_language: Option<usize>,

        /// Worker idle timeout in seconds
        #[arg(long)]
        worker_idle_timeout: Option<u64>,

        /// Serve only models already on disk
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
    /// Translate one text and print the result
    Translate {
        /// Source language (or "auto")
        #[arg(long, default_value = "auto")]
        from: String,

        /// Target language
        #[arg(long)]
        to: String,

        /// Treat the input as HTML
        #[arg(long, default_value_t = false)]
        html: bool,

        /// The text to translate
        text: String,
    },
    /// Detect the language of a text
    Detect { text: String },
    /// List languages the catalog can serve
    Languages,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();

    if let Some(dir) = cli.config_dir {
        settings.worker_binary = dir.join("bin").join("transgate-worker");
        settings.config_dir = dir;
    }
    if let Some(dir) = cli.model_dir {
        settings.model_dir = dir;
    }
    if let Some(path) = cli.worker_binary {
        settings.worker_binary = path;
    }

    let command = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
        workers_per_language: None,
        worker_idle_timeout: None,
        offline: false,
    });

    if let Commands::Serve {
        host,
        port,
        workers_per_language,
        worker_idle_timeout,
        offline,
    } = &command
    {
        if let Some(host) = host {
            settings.host = host.clone();
        }
        if let Some(port) = port {
            settings.port = *port;
        }
        if let Some(n) = workers_per_language {
            settings.workers_per_language = *n;
        }
        if let Some(secs) = worker_idle_timeout {
            settings.worker_idle_timeout = std::time::Duration::from_secs(*secs);
        }
        if *offline {
            settings.offline_mode = true;
        }
    }

    // Logs go to stderr; stdout is reserved for command output.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .init();

    let settings = Arc::new(settings);

    match command {
        Commands::Serve { .. } => {
            let dispatcher = build_dispatcher(&settings)?;
            http::serve(settings, dispatcher).await?;
        }
        Commands::Translate {
            from,
            to,
            html,
            text,
        } => {
            let dispatcher = build_dispatcher(&settings)?;
            let token = CancellationToken::new();
            let result = dispatcher.translate(&token, &from, &to, &text, html).await;
            dispatcher.cleanup_all().await;
            println!("{}", result?);
        }
        Commands::Detect { text } => {
            let catalog = load_catalog(&settings)?;
            let detector = LanguageDetector::new(&catalog.supported_languages());
            match detector.detect(&text) {
                Some(language) => println!("{language}"),
                None => anyhow::bail!("could not detect a language"),
            }
        }
        Commands::Languages => {
            let catalog = load_catalog(&settings)?;
            for language in catalog.supported_languages() {
                println!("{language}");
            }
        }
    }

    Ok(())
}

fn load_catalog(settings: &Settings) -> Result<Arc<dyn ModelCatalog>> {
    let catalog = RecordsCatalog::load(&settings.config_dir, &settings.model_dir)?;
    Ok(Arc::new(catalog))
}

/// Wire the full stack: catalog, detector, pool, dispatcher.
fn build_dispatcher(settings: &Arc<Settings>) -> Result<Arc<Dispatcher>> {
    let catalog = load_catalog(settings)?;
    let detector = Arc::new(LanguageDetector::new(&catalog.supported_languages()));
    let pool = EnginePool::new(Arc::clone(settings), Arc::clone(&catalog));
    Ok(Dispatcher::new(pool, detector, catalog))
}
