//! Page loaders: turn a URL into rendered HTML and, optionally, a screenshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::{LoaderKind, ServerConfig};
use crate::error::{Error, Result};

/// A fetched page.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    /// Page HTML after rendering.
    pub html: String,
    /// Where the page was actually served from, after redirects.
    pub url: Url,
    /// Screenshot written for this load, if one was requested.
    pub screenshot: Option<Screenshot>,
}

/// A PNG screenshot on disk.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// Where it was written.
    pub path: PathBuf,
    /// PNG bytes.
    pub png: Vec<u8>,
}

/// Something that can fetch pages.
#[async_trait::async_trait]
pub trait PageLoader: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Load `url`; when `screenshot` is set, also write a PNG there.
    async fn load(&self, url: &Url, screenshot: Option<&Path>) -> Result<LoadedPage>;
}

/// Build the loader selected by `config`.
pub fn loader_for(config: &ServerConfig) -> Arc<dyn PageLoader> {
    match config.loader {
        #[cfg(feature = "browser")]
        LoaderKind::Browser => Arc::new(BrowserLoader::new(config.headless, config.page_timeout)),
        #[cfg(not(feature = "browser"))]
        LoaderKind::Browser => {
            tracing::warn!("built without the `browser` feature, falling back to HTTP loader");
            Arc::new(HttpLoader::new(config.page_timeout))
        }
        LoaderKind::Http => Arc::new(HttpLoader::new(config.page_timeout)),
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Plain HTTP GET; no JavaScript, no screenshots.
pub struct HttpLoader {
    client: reqwest::Client,
}

impl HttpLoader {
    /// Loader with a per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("autoscraper-mcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait::async_trait]
impl PageLoader for HttpLoader {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn load(&self, url: &Url, screenshot: Option<&Path>) -> Result<LoadedPage> {
        if screenshot.is_some() {
            return Err(Error::Browser(
                "screenshots require the browser loader (--loader browser)".into(),
            ));
        }
        tracing::debug!(url = %url, "fetching over HTTP");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await?
            .error_for_status()?;
        let served = response.url().clone();
        if served != *url {
            tracing::debug!(from = %url, to = %served, "followed redirect");
        }
        let html = response.text().await?;
        Ok(LoadedPage {
            html,
            url: served,
            screenshot: None,
        })
    }
}

// ============================================================================
// Chromium
// ============================================================================

/// Renders pages in Chromium over CDP, one browser per load.
#[cfg(feature = "browser")]
pub struct BrowserLoader {
    headless: bool,
    timeout: Duration,
}

#[cfg(feature = "browser")]
impl BrowserLoader {
    /// Loader launching a headless (or visible) browser.
    pub fn new(headless: bool, timeout: Duration) -> Self {
        Self { headless, timeout }
    }

    async fn render(
        browser: &chromiumoxide::Browser,
        url: &Url,
        screenshot: Option<&Path>,
    ) -> Result<LoadedPage> {
        use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
        use chromiumoxide::page::ScreenshotParams;

        let page = browser
            .new_page(url.as_str())
            .await
            .map_err(|e| Error::Browser(format!("failed to open {}: {}", url, e)))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| Error::Browser(format!("navigation to {} failed: {}", url, e)))?;

        let shot = match screenshot {
            Some(path) => {
                let png = page
                    .screenshot(
                        ScreenshotParams::builder()
                            .format(CaptureScreenshotFormat::Png)
                            .full_page(true)
                            .build(),
                    )
                    .await
                    .map_err(|e| Error::Browser(format!("screenshot failed: {}", e)))?;
                tokio::fs::write(path, &png).await?;
                tracing::info!(path = %path.display(), bytes = png.len(), "screenshot saved");
                Some(Screenshot {
                    path: path.to_path_buf(),
                    png,
                })
            }
            None => None,
        };

        let html = page
            .content()
            .await
            .map_err(|e| Error::Browser(format!("failed to read page content: {}", e)))?;
        let served = match page.url().await {
            Ok(Some(current)) => Url::parse(&current).unwrap_or_else(|_| url.clone()),
            _ => url.clone(),
        };
        Ok(LoadedPage {
            html,
            url: served,
            screenshot: shot,
        })
    }
}

#[cfg(feature = "browser")]
#[async_trait::async_trait]
impl PageLoader for BrowserLoader {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn load(&self, url: &Url, screenshot: Option<&Path>) -> Result<LoadedPage> {
        use chromiumoxide::{Browser, BrowserConfig};
        use futures::StreamExt;

        let mut builder = BrowserConfig::builder();
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| Error::Browser(format!("invalid browser config: {}", e)))?;

        tracing::debug!(url = %url, headless = self.headless, "launching browser");
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| Error::Browser(format!("failed to launch browser: {}", e)))?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let outcome = tokio::time::timeout(self.timeout, Self::render(&browser, url, screenshot)).await;

        if let Err(e) = browser.close().await {
            tracing::debug!("browser close: {}", e);
        }
        let _ = browser.wait().await;
        events.abort();

        outcome.map_err(|_| {
            Error::Browser(format!("timed out after {:?} loading {}", self.timeout, url))
        })?
    }
}
