//! Server configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::storage::StorageKind;

/// Which page loader fetches pages for the tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    /// Headless (or visible) Chromium via CDP.
    Browser,
    /// Plain HTTP GET, no JavaScript and no screenshots.
    Http,
}

impl LoaderKind {
    /// The loader used when none is configured.
    pub fn default_for_build() -> Self {
        if cfg!(feature = "browser") {
            LoaderKind::Browser
        } else {
            LoaderKind::Http
        }
    }
}

impl FromStr for LoaderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "browser" | "chromium" => Ok(LoaderKind::Browser),
            "http" => Ok(LoaderKind::Http),
            other => Err(Error::InvalidParams(format!("unknown loader: {}", other))),
        }
    }
}

/// Resolved runtime configuration shared by all tools.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root for relative storage and model paths.
    pub data_dir: PathBuf,
    /// Where screenshots are written.
    pub screenshot_dir: PathBuf,
    /// Page loader selection.
    pub loader: LoaderKind,
    /// Run the browser without a window.
    pub headless: bool,
    /// Upper bound on a single page load.
    pub page_timeout: Duration,
    /// Backend used when a tool call names none.
    pub default_storage: StorageKind,
}

impl ServerConfig {
    /// Configuration rooted at `data_dir`, everything else defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            screenshot_dir: data_dir.join("screenshots"),
            data_dir,
            loader: LoaderKind::default_for_build(),
            headless: true,
            page_timeout: Duration::from_secs(30),
            default_storage: StorageKind::Json,
        }
    }

    /// Platform data directory for the server, or `./.autoscraper-mcp`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("autoscraper-mcp"))
            .unwrap_or_else(|| PathBuf::from(".autoscraper-mcp"))
    }

    /// Resolve a user-supplied path against the data directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::with_data_dir(Self::default_data_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_land_in_data_dir() {
        let config = ServerConfig::with_data_dir("/srv/scrapes");
        assert_eq!(config.resolve("out.json"), PathBuf::from("/srv/scrapes/out.json"));
        assert_eq!(config.resolve("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
        assert_eq!(config.screenshot_dir, PathBuf::from("/srv/scrapes/screenshots"));
    }

    #[test]
    fn loader_kind_parses_case_insensitively() {
        assert_eq!("HTTP".parse::<LoaderKind>().unwrap(), LoaderKind::Http);
        assert_eq!("chromium".parse::<LoaderKind>().unwrap(), LoaderKind::Browser);
        assert!("lynx".parse::<LoaderKind>().is_err());
    }
}
