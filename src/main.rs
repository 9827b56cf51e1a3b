//! autoscraper-mcp - MCP server for learn-by-example web scraping
//!
//! This binary serves the scraper tools to MCP clients over stdio (or HTTP
//! when built with the `http` feature).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autoscraper_mcp::tools::ToolContext;
use autoscraper_mcp::{
    LoaderKind, McpServer, ScrapeModel, ServerConfig, StorageKind, ToolRegistry,
};

/// MCP server for learn-by-example web scraping.
#[derive(Parser, Debug)]
#[command(name = "autoscraper-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run in stdio mode (standard MCP transport).
    #[arg(long, default_value = "true", env = "AUTOSCRAPER_MCP_STDIO")]
    stdio: bool,

    /// Serve JSON-RPC over HTTP on this address instead of stdio.
    #[cfg(feature = "http")]
    #[arg(long, env = "AUTOSCRAPER_MCP_HTTP")]
    http: Option<std::net::SocketAddr>,

    /// Directory that relative storage and model paths resolve against.
    #[arg(long, env = "AUTOSCRAPER_MCP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory for screenshots (default: <data-dir>/screenshots).
    #[arg(long, env = "AUTOSCRAPER_MCP_SCREENSHOT_DIR")]
    screenshot_dir: Option<PathBuf>,

    /// Page loader (browser, http).
    #[arg(long, env = "AUTOSCRAPER_MCP_LOADER")]
    loader: Option<String>,

    /// Show browser window (non-headless mode).
    #[arg(long, env = "AUTOSCRAPER_MCP_VISIBLE")]
    visible: bool,

    /// Page load timeout in seconds.
    #[arg(long, default_value_t = 30, env = "AUTOSCRAPER_MCP_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Storage used when a call names none (json, csv, sqlite).
    #[arg(long, default_value = "json", env = "AUTOSCRAPER_MCP_DEFAULT_STORAGE")]
    default_storage: String,

    /// Saved scraper model to load at startup.
    #[arg(long, env = "AUTOSCRAPER_MCP_MODEL")]
    model: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log output file (default: stderr).
    #[arg(long, env = "AUTOSCRAPER_MCP_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log format (text, json).
    #[arg(long, default_value = "text", env = "AUTOSCRAPER_MCP_LOG_FORMAT")]
    log_format: String,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(ServerConfig::default_data_dir);
        let mut config = ServerConfig::with_data_dir(data_dir);

        if let Some(dir) = &self.screenshot_dir {
            config.screenshot_dir = dir.clone();
        }
        if let Some(loader) = &self.loader {
            config.loader = loader
                .parse::<LoaderKind>()
                .with_context(|| format!("invalid --loader {}", loader))?;
        }
        config.headless = !self.visible;
        config.page_timeout = Duration::from_secs(self.timeout_secs.max(1));
        config.default_storage = self
            .default_storage
            .parse::<StorageKind>()
            .with_context(|| format!("invalid --default-storage {}", self.default_storage))?;
        Ok(config)
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let json = args.log_format.eq_ignore_ascii_case("json");

    // Never log to stdout; it carries the MCP protocol.
    let registry = tracing_subscriber::registry().with(filter);
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let writer = Arc::new(file);
            if json {
                registry.with(fmt::layer().json().with_writer(writer)).init();
            } else {
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
        }
        None => {
            if json {
                registry
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            } else {
                registry.with(fmt::layer().with_writer(std::io::stderr)).init();
            }
        }
    }
    Ok(())
}

async fn build_server(args: &Args) -> anyhow::Result<McpServer> {
    let config = args.server_config()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        loader = ?config.loader,
        headless = config.headless,
        default_storage = %config.default_storage,
        "configuration loaded"
    );

    let mut context = ToolContext::new(config);
    if let Some(path) = &args.model {
        let path = context.config.resolve(path);
        let model = ScrapeModel::load(&path)
            .await
            .with_context(|| format!("cannot load model {}", path.display()))?;
        tracing::info!(path = %path.display(), rules = model.rules.len(), "model preloaded");
        context = context.with_model(model);
    }

    Ok(McpServer::with_registry(ToolRegistry::with_context(context)))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let server = build_server(&args).await?;

    #[cfg(feature = "http")]
    if let Some(addr) = args.http {
        autoscraper_mcp::server::http::run(Arc::new(server), addr).await?;
        return Ok(());
    }

    if !args.stdio {
        anyhow::bail!("no transport selected; pass --stdio or --http <addr>");
    }
    server.run_stdio().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(
        "Starting {} v{}",
        autoscraper_mcp::server::SERVER_NAME,
        autoscraper_mcp::server::SERVER_VERSION
    );

    match run(args).await {
        Ok(()) => {
            tracing::info!("Server exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Server error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
