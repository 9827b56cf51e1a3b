//! The trained scraper state shared by the tools.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{apply, learn, Extraction, Rule, WantedData};
use crate::error::{Error, Result};

/// On-disk format version written by [`ScrapeModel::save`].
pub const MODEL_VERSION: u32 = 1;

/// A set of learned rules plus where they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeModel {
    /// Format version.
    pub version: u32,
    /// Learned rules.
    pub rules: Vec<Rule>,
    /// Page the rules were last trained on.
    #[serde(default)]
    pub trained_url: Option<String>,
    /// When the rules were last trained.
    #[serde(default)]
    pub trained_at: Option<DateTime<Utc>>,
}

/// Summary of one training pass.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// Rules added to the model.
    pub added: usize,
    /// Rules in the model afterwards.
    pub total: usize,
    /// Examples that matched nothing.
    pub unmatched: Vec<String>,
    /// What the new rules extract from the training page.
    pub result: Extraction,
}

impl ScrapeModel {
    /// An empty, untrained model.
    pub fn new() -> Self {
        Self {
            version: MODEL_VERSION,
            rules: Vec::new(),
            trained_url: None,
            trained_at: None,
        }
    }

    /// Whether any rule has been learned.
    pub fn is_trained(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Learn from `html`. Without `update` the new rules replace the old
    /// ones; a pass that learns nothing leaves the model untouched.
    pub fn train(&mut self, html: &str, url: &Url, wanted: &WantedData, update: bool) -> TrainingReport {
        let learned = learn(html, Some(url), wanted);
        let result = apply(html, Some(url), &learned.rules, false);

        let mut added = 0;
        if !learned.rules.is_empty() {
            if !update {
                self.rules.clear();
            }
            for rule in learned.rules {
                if !self.rules.iter().any(|r| r.id == rule.id) {
                    self.rules.push(rule);
                    added += 1;
                }
            }
            self.trained_url = Some(url.to_string());
            self.trained_at = Some(Utc::now());
        }

        tracing::info!(added, total = self.rules.len(), url = %url, "training finished");
        TrainingReport {
            added,
            total: self.rules.len(),
            unmatched: learned.unmatched,
            result,
        }
    }

    /// Apply every rule to `html`.
    pub fn scrape(&self, html: &str, url: &Url, exact: bool) -> Extraction {
        apply(html, Some(url), &self.rules, exact)
    }

    /// Write the model as pretty JSON, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::info!(path = %path.display(), rules = self.rules.len(), "model saved");
        Ok(())
    }

    /// Read a model written by [`ScrapeModel::save`].
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let model: ScrapeModel = serde_json::from_slice(&bytes)?;
        if model.version > MODEL_VERSION {
            return Err(Error::InvalidParams(format!(
                "model format version {} is newer than supported version {}",
                model.version, MODEL_VERSION
            )));
        }
        tracing::info!(path = %path.display(), rules = model.rules.len(), "model loaded");
        Ok(model)
    }
}

impl Default for ScrapeModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAIN: &str = r#"<div class="quote"><span class="text">Be yourself.</span><small class="author">Oscar Wilde</small></div>
        <div class="quote"><span class="text">So it goes.</span><small class="author">Kurt Vonnegut</small></div>"#;

    fn url() -> Url {
        Url::parse("https://quotes.example/page/1/").unwrap()
    }

    #[test]
    fn training_replaces_rules_unless_updating() {
        let mut model = ScrapeModel::new();
        let first = model.train(TRAIN, &url(), &WantedData::List(vec!["Be yourself.".into()]), false);
        assert_eq!(first.added, 1);
        assert_eq!(first.result.values_for("value"), vec!["Be yourself.", "So it goes."]);

        let second = model.train(TRAIN, &url(), &WantedData::List(vec!["Oscar Wilde".into()]), false);
        assert_eq!(second.total, 1);

        let third = model.train(TRAIN, &url(), &WantedData::List(vec!["Be yourself.".into()]), true);
        assert_eq!(third.added, 1);
        assert_eq!(third.total, 2);
    }

    #[test]
    fn failed_training_keeps_previous_rules() {
        let mut model = ScrapeModel::new();
        model.train(TRAIN, &url(), &WantedData::List(vec!["So it goes.".into()]), false);
        let report = model.train(TRAIN, &url(), &WantedData::List(vec!["absent".into()]), false);
        assert_eq!(report.added, 0);
        assert_eq!(report.unmatched, vec!["absent".to_string()]);
        assert!(model.is_trained());
    }

    #[tokio::test]
    async fn save_and_load_preserve_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("quotes.json");

        let mut model = ScrapeModel::new();
        model.train(TRAIN, &url(), &WantedData::List(vec!["Kurt Vonnegut".into()]), false);
        model.save(&path).await.unwrap();

        let loaded = ScrapeModel::load(&path).await.unwrap();
        assert_eq!(loaded.rules, model.rules);
        assert_eq!(loaded.trained_url.as_deref(), Some("https://quotes.example/page/1/"));
        let found = loaded.scrape(TRAIN, &url(), false);
        assert_eq!(found.values_for("value"), vec!["Oscar Wilde", "Kurt Vonnegut"]);
    }

    #[tokio::test]
    async fn newer_format_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.json");
        tokio::fs::write(&path, r#"{"version": 99, "rules": []}"#).await.unwrap();
        assert!(matches!(ScrapeModel::load(&path).await, Err(Error::InvalidParams(_))));
    }
}
