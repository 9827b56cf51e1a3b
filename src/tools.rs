//! Tool definitions and registry for MCP server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::browser::{loader_for, LoadedPage, PageLoader};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::extractor::{ScrapeModel, WantedData};
use crate::protocol::{ContentItem, ToolCallResult, ToolDefinition};
use crate::storage::{StorageKind, StorageRegistry, StorageTarget, DEFAULT_TABLE};

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult>;
}

/// State shared by every tool call.
pub struct ToolContext {
    /// Resolved configuration.
    pub config: Arc<ServerConfig>,
    /// The trained scraper.
    pub model: Arc<RwLock<ScrapeModel>>,
    /// Fetches pages.
    pub loader: Arc<dyn PageLoader>,
    /// Storage backends.
    pub storage: StorageRegistry,
}

impl ToolContext {
    /// Context using the loader selected by `config`.
    pub fn new(config: ServerConfig) -> Self {
        let loader = loader_for(&config);
        Self::with_loader(config, loader)
    }

    /// Context with an explicit page loader.
    pub fn with_loader(config: ServerConfig, loader: Arc<dyn PageLoader>) -> Self {
        Self {
            config: Arc::new(config),
            model: Arc::new(RwLock::new(ScrapeModel::new())),
            loader,
            storage: StorageRegistry::new(),
        }
    }

    /// Start from an already trained model.
    pub fn with_model(self, model: ScrapeModel) -> Self {
        Self {
            model: Arc::new(RwLock::new(model)),
            ..self
        }
    }

    /// Page HTML for `url`: inline HTML wins, otherwise the loader fetches it.
    async fn page(&self, url: &Url, inline_html: Option<String>, screenshot: bool) -> Result<LoadedPage> {
        if let Some(html) = inline_html {
            if screenshot {
                tracing::warn!(url = %url, "inline html supplied, skipping screenshot");
            }
            return Ok(LoadedPage {
                html,
                url: url.clone(),
                screenshot: None,
            });
        }

        let shot_path = if screenshot {
            tokio::fs::create_dir_all(&self.config.screenshot_dir).await?;
            Some(self.screenshot_path())
        } else {
            None
        };
        tracing::info!(url = %url, loader = self.loader.name(), "loading page");
        self.loader.load(url, shot_path.as_deref()).await
    }

    fn screenshot_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let tag = Uuid::new_v4().simple().to_string();
        self.config
            .screenshot_dir
            .join(format!("screenshot_{}_{}.png", stamp, &tag[..8]))
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Registry with the built-in tools and the configured loader.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_context(ToolContext::new(config))
    }

    /// Registry with the built-in tools over a custom context.
    pub fn with_context(context: ToolContext) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            context: Arc::new(context),
        };
        registry.register(Arc::new(InitScraperTool));
        registry.register(Arc::new(ScrapeDataTool));
        registry.register(Arc::new(SaveScraperTool));
        registry.register(Arc::new(LoadScraperTool));
        registry.register(Arc::new(LoadDataTool));
        registry.register(Arc::new(ScraperStatusTool));
        registry
    }

    /// Shared tool state.
    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Get tool definitions, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        tool.execute(arguments, &self.context).await
    }

    /// Register a custom tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| Error::InvalidParams(format!("invalid url {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::InvalidParams(format!("unsupported url scheme: {}", other))),
    }
}

fn require_path(path: Option<String>, field: &str) -> Result<String> {
    match path {
        Some(p) if !p.trim().is_empty() => Ok(p),
        _ => Err(Error::InvalidParams(format!("{} is required", field))),
    }
}

/// How `scrape_data` writes to existing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Overwrite,
    Append,
}

impl WriteMode {
    fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("overwrite") | Some("replace") => Ok(WriteMode::Overwrite),
            Some("append") => Ok(WriteMode::Append),
            Some(other) => Err(Error::InvalidParams(format!(
                "unknown write mode: {} (expected overwrite or append)",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Overwrite => "overwrite",
            WriteMode::Append => "append",
        }
    }
}

// ============================================================================
// Scraper tools
// ============================================================================

/// Learn extraction rules from example values on a page.
pub struct InitScraperTool;

#[derive(Debug, Deserialize)]
struct InitScraperArgs {
    url: String,
    wanted_data: WantedData,
    #[serde(default)]
    screenshot: bool,
    html: Option<String>,
    #[serde(default)]
    update: bool,
}

#[async_trait::async_trait]
impl Tool for InitScraperTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "init_scraper".into(),
            description: "Initialize and train the scraper with example values taken from a web page. Rules learned here are reused by scrape_data.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Target webpage URL"
                    },
                    "wanted_data": {
                        "type": ["array", "object"],
                        "items": {"type": "string"},
                        "additionalProperties": {"type": "array", "items": {"type": "string"}},
                        "description": "Example values visible on the page, or an object mapping an alias to examples"
                    },
                    "screenshot": {
                        "type": "boolean",
                        "description": "Take a screenshot of the page"
                    },
                    "html": {
                        "type": "string",
                        "description": "Pre-rendered page HTML; the page is not fetched when given"
                    },
                    "update": {
                        "type": "boolean",
                        "description": "Keep previously learned rules and add the new ones"
                    }
                },
                "required": ["url", "wanted_data"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: InitScraperArgs = parse_args(arguments)?;
        let url = parse_url(&args.url)?;
        if args.wanted_data.is_empty() {
            return Err(Error::InvalidParams(
                "wanted_data must contain at least one non-empty example".into(),
            ));
        }

        let page = context.page(&url, args.html, args.screenshot).await?;
        let report = {
            let mut model = context.model.write().await;
            model.train(&page.html, &page.url, &args.wanted_data, args.update)
        };

        let screenshot_path = page
            .screenshot
            .as_ref()
            .map(|s| s.path.display().to_string());
        let mut result = ToolCallResult::json(&json!({
            "training_result": report.result.alias_json(),
            "rules_learned": report.added,
            "total_rules": report.total,
            "unmatched": report.unmatched,
            "screenshot_path": screenshot_path,
        }))?;
        if let Some(shot) = &page.screenshot {
            result = result.with_item(ContentItem::png(&shot.png));
        }
        Ok(result)
    }
}

/// Apply learned rules to a page and optionally persist the rows.
pub struct ScrapeDataTool;

#[derive(Debug, Default, Deserialize)]
struct StorageArgs {
    #[serde(rename = "type")]
    kind: Option<String>,
    path: Option<String>,
    table_name: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapeDataArgs {
    url: String,
    html: Option<String>,
    storage_type: Option<String>,
    storage_path: Option<String>,
    table_name: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    exact: bool,
    #[serde(default)]
    grouped: bool,
    storage: Option<StorageArgs>,
}

/// Storage settings after merging flat and nested arguments.
struct StoragePlan {
    kind: StorageKind,
    target: Option<StorageTarget>,
    mode: WriteMode,
}

impl ScrapeDataArgs {
    fn storage_plan(&mut self, config: &ServerConfig) -> Result<StoragePlan> {
        let nested = self.storage.take().unwrap_or_default();
        let kind = match nested.kind.or(self.storage_type.take()) {
            Some(raw) => raw.parse::<StorageKind>()?,
            None => config.default_storage,
        };
        let mode = WriteMode::parse(nested.mode.or(self.mode.take()).as_deref())?;
        let table = nested
            .table_name
            .or(self.table_name.take())
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        let target = nested
            .path
            .or(self.storage_path.take())
            .filter(|p| !p.trim().is_empty())
            .map(|p| StorageTarget::new(config.resolve(p)).with_table(table));
        Ok(StoragePlan { kind, target, mode })
    }
}

#[async_trait::async_trait]
impl Tool for ScrapeDataTool {
    fn definition(&self) -> ToolDefinition {
        let kinds: Vec<&str> = StorageKind::ALL.iter().map(|k| k.as_str()).collect();
        ToolDefinition {
            name: "scrape_data".into(),
            description: "Scrape data from a page using the trained rules, optionally saving the rows to SQLite, JSON or CSV.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "Page to scrape"},
                    "html": {"type": "string", "description": "Pre-rendered page HTML; the page is not fetched when given"},
                    "storage_type": {"type": "string", "enum": kinds},
                    "storage_path": {"type": "string", "description": "File to write; relative paths resolve against the data directory"},
                    "table_name": {"type": "string", "description": "SQLite table (default scraped_data)"},
                    "mode": {"type": "string", "enum": ["overwrite", "append"]},
                    "exact": {"type": "boolean", "description": "Only return values at exactly the trained positions"},
                    "grouped": {"type": "boolean", "description": "Also return results per rule"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let mut args: ScrapeDataArgs = parse_args(arguments)?;
        let url = parse_url(&args.url)?;
        let plan = args.storage_plan(&context.config)?;
        if !context.model.read().await.is_trained() {
            return Err(Error::NotTrained("call init_scraper or load_scraper first".into()));
        }

        let page = context.page(&url, args.html.take(), false).await?;
        let extraction = context.model.read().await.scrape(&page.html, &page.url, args.exact);
        let records = extraction.records();
        tracing::info!(url = %url, records = records.len(), "scrape finished");

        let storage = match &plan.target {
            Some(target) => {
                let backend = context.storage.get(plan.kind)?;
                let written = match plan.mode {
                    WriteMode::Overwrite => backend.save(&records, target).await?,
                    WriteMode::Append => backend.append(&records, target).await?,
                };
                let mut info = json!({
                    "type": plan.kind.as_str(),
                    "path": target.path.display().to_string(),
                    "mode": plan.mode.as_str(),
                    "record_count": written,
                });
                if plan.kind == StorageKind::Sqlite {
                    info["table_name"] = json!(target.table);
                }
                info
            }
            None => Value::Null,
        };

        let mut payload = json!({
            "scraped_data": extraction.alias_json(),
            "records": records,
            "record_count": records.len(),
            "storage": storage,
            "storage_path": plan.target.as_ref().map(|t| t.path.display().to_string()),
        });
        if args.grouped {
            payload["by_rule"] = extraction.rule_json();
        }
        ToolCallResult::json(&payload)
    }
}

/// Persist the trained rules.
pub struct SaveScraperTool;

#[derive(Debug, Deserialize)]
struct ModelPathArgs {
    path: Option<String>,
}

#[async_trait::async_trait]
impl Tool for SaveScraperTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "save_scraper".into(),
            description: "Save the trained scraper rules to a JSON file.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Destination file"}
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ModelPathArgs = parse_args(arguments)?;
        let path = context.config.resolve(require_path(args.path, "path")?);

        let model = context.model.read().await.clone();
        if !model.is_trained() {
            return Err(Error::NotTrained("nothing to save".into()));
        }
        model.save(&path).await?;

        ToolCallResult::json(&json!({
            "message": format!("Scraper saved to {}", path.display()),
            "path": path.display().to_string(),
            "rule_count": model.rules.len(),
        }))
    }
}

/// Replace the trained rules from a file.
pub struct LoadScraperTool;

#[async_trait::async_trait]
impl Tool for LoadScraperTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "load_scraper".into(),
            description: "Load scraper rules previously written by save_scraper, replacing the current ones.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File written by save_scraper"}
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ModelPathArgs = parse_args(arguments)?;
        let path = context.config.resolve(require_path(args.path, "path")?);

        let loaded = ScrapeModel::load(&path).await?;
        let rule_count = loaded.rules.len();
        let trained_url = loaded.trained_url.clone();
        *context.model.write().await = loaded;

        ToolCallResult::json(&json!({
            "message": format!("Scraper loaded from {}", path.display()),
            "rule_count": rule_count,
            "trained_url": trained_url,
        }))
    }
}

// ============================================================================
// Storage and status tools
// ============================================================================

/// Read stored records back.
pub struct LoadDataTool;

#[derive(Debug, Deserialize)]
struct LoadDataArgs {
    storage_type: Option<String>,
    storage_path: Option<String>,
    table_name: Option<String>,
    limit: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for LoadDataTool {
    fn definition(&self) -> ToolDefinition {
        let kinds: Vec<&str> = StorageKind::ALL.iter().map(|k| k.as_str()).collect();
        ToolDefinition {
            name: "load_data".into(),
            description: "Read records previously stored by scrape_data.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "storage_type": {"type": "string", "enum": kinds},
                    "storage_path": {"type": "string"},
                    "table_name": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 0}
                },
                "required": ["storage_path"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: LoadDataArgs = parse_args(arguments)?;
        let kind = match args.storage_type {
            Some(raw) => raw.parse::<StorageKind>()?,
            None => context.config.default_storage,
        };
        let path = context.config.resolve(require_path(args.storage_path, "storage_path")?);
        let target = StorageTarget::new(path)
            .with_table(args.table_name.unwrap_or_else(|| DEFAULT_TABLE.to_string()));

        let backend = context.storage.get(kind)?;
        if !backend.exists(&target.path).await {
            return Err(Error::InvalidParams(format!(
                "nothing stored at {}",
                target.path.display()
            )));
        }
        let mut records = backend.load(&target).await?;
        let total = records.len();
        if let Some(limit) = args.limit {
            records.truncate(limit);
        }

        ToolCallResult::json(&json!({
            "records": records,
            "record_count": records.len(),
            "total": total,
        }))
    }
}

/// Report what the scraper currently knows.
pub struct ScraperStatusTool;

#[async_trait::async_trait]
impl Tool for ScraperStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "scraper_status".into(),
            description: "Show whether the scraper is trained, its rules, and the active page loader.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let model = context.model.read().await;
        let rules: Vec<Value> = model
            .rules
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "alias": r.alias,
                    "depth": r.stack.len(),
                    "attr": r.attr,
                })
            })
            .collect();

        ToolCallResult::json(&json!({
            "trained": model.is_trained(),
            "trained_url": model.trained_url,
            "trained_at": model.trained_at,
            "rules": rules,
            "loader": context.loader.name(),
            "data_dir": context.config.data_dir.display().to_string(),
        }))
    }
}
