//! # autoscraper-mcp
//!
//! MCP (Model Context Protocol) server that learns how to scrape a page from
//! a handful of example values and then reuses what it learned on pages with
//! the same layout.
//!
//! ## Features
//!
//! - **MCP-compliant**: JSON-RPC 2.0 over stdio, plus an optional HTTP transport
//! - **Learn by example**: give a URL and values you can see on it, get back rules
//! - **Rendered pages**: pages load in headless Chromium, or over plain HTTP
//! - **Storage**: results go to SQLite tables, JSON files or CSV files
//!
//! ## Available Tools
//!
//! - `init_scraper`: train on a page from example values
//! - `scrape_data`: apply the learned rules to a page and optionally store the result
//! - `save_scraper` / `load_scraper`: persist the learned rules
//! - `load_data`: read back previously stored results
//! - `scraper_status`: inspect the current rules
//!
//! ## Usage with VS Code
//!
//! Add to your `.vscode/mcp.json`:
//!
//! ```json
//! {
//!   "servers": {
//!     "autoscraper": {
//!       "command": "autoscraper-mcp",
//!       "args": ["--stdio"],
//!       "env": {}
//!     }
//!   }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod browser;
pub mod config;
pub mod error;
pub mod extractor;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod tools;

pub use config::{LoaderKind, ServerConfig};
pub use error::{Error, Result};
pub use extractor::{ScrapeModel, WantedData};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use server::McpServer;
pub use storage::{StorageBackend, StorageKind};
pub use tools::{Tool, ToolRegistry};
