//! Learn-by-example HTML extraction.
//!
//! Given a page and a handful of values the user wants from it, [`learn`]
//! records where each value lives as a [`Rule`]: the chain of elements from
//! `<html>` down to the value. [`apply`] walks those chains on another page
//! with the same layout and collects everything sitting in the same place.
//!
//! ```
//! use autoscraper_mcp::extractor::{ScrapeModel, WantedData};
//! use url::Url;
//!
//! let page = r#"<ul class="news">
//!     <li><a href="/a">First story</a></li>
//!     <li><a href="/b">Second story</a></li>
//! </ul>"#;
//! let url = Url::parse("https://example.com/").unwrap();
//!
//! let mut model = ScrapeModel::new();
//! model.train(page, &url, &WantedData::List(vec!["First story".into()]), false);
//! let found = model.scrape(page, &url, false);
//! assert_eq!(found.values_for("value"), vec!["First story", "Second story"]);
//! ```

mod extract;
mod learn;
mod model;
mod rule;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use extract::{apply, Extraction, RuleResult};
pub use learn::{learn, Learned};
pub use model::{ScrapeModel, TrainingReport, MODEL_VERSION};
pub use rule::{NodeSpec, Rule};

/// Alias given to values supplied as a plain list.
pub const DEFAULT_ALIAS: &str = "value";

/// Example values to learn from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WantedData {
    /// Plain examples, grouped under [`DEFAULT_ALIAS`].
    List(Vec<String>),
    /// Examples grouped by alias, e.g. `{"title": [...], "price": [...]}`.
    Grouped(BTreeMap<String, Vec<String>>),
}

impl WantedData {
    /// `(alias, value)` pairs in a stable order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        match self {
            WantedData::List(values) => values
                .iter()
                .map(|v| (DEFAULT_ALIAS, v.as_str()))
                .collect(),
            WantedData::Grouped(groups) => groups
                .iter()
                .flat_map(|(alias, values)| values.iter().map(move |v| (alias.as_str(), v.as_str())))
                .collect(),
        }
    }

    /// True when no non-blank example is present.
    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, v)| normalize_text([*v]).is_empty())
    }
}

/// Collapse whitespace runs to single spaces and trim.
pub fn normalize_text<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for part in parts {
        for word in part.split_whitespace() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(word);
        }
    }
    out
}
