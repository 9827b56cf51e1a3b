//! Rule learning from example values.

use scraper::{ElementRef, Html};
use url::Url;

use super::rule::{resolve_link, Rule};
use super::{normalize_text, WantedData};

/// Attributes checked when an example looks like a link or image source.
const LINK_ATTRS: [&str; 2] = ["href", "src"];

/// Outcome of learning on one page.
#[derive(Debug, Clone, Default)]
pub struct Learned {
    /// Distinct rules, in document order per example.
    pub rules: Vec<Rule>,
    /// Examples that matched nothing on the page.
    pub unmatched: Vec<String>,
}

/// Learn rules locating each wanted value in `html`.
pub fn learn(html: &str, base: Option<&Url>, wanted: &WantedData) -> Learned {
    let doc = Html::parse_document(html);
    let elements: Vec<ElementRef<'_>> = doc
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .collect();

    let mut learned = Learned::default();
    for (alias, value) in wanted.entries() {
        let target = normalize_text([value]);
        if target.is_empty() {
            continue;
        }

        let mut found = false;
        for &el in &elements {
            if holds_text(el, &target) {
                found = true;
                push_unique(&mut learned.rules, Rule::for_element(el, alias, None));
            }
            for attr in LINK_ATTRS {
                let Some(raw) = el.value().attr(attr) else {
                    continue;
                };
                let raw = raw.trim();
                if raw == target || resolve_link(attr, raw, base) == target {
                    found = true;
                    push_unique(&mut learned.rules, Rule::for_element(el, alias, Some(attr)));
                }
            }
        }

        if !found {
            tracing::warn!(alias, value = %target, "wanted value not found on page");
            learned.unmatched.push(value.to_string());
        }
    }
    learned
}

/// `el` is the innermost element whose text is exactly `target`.
fn holds_text(el: ElementRef<'_>, target: &str) -> bool {
    if normalize_text(el.text()) != target {
        return false;
    }
    !el.children()
        .filter_map(ElementRef::wrap)
        .any(|child| normalize_text(child.text()) == target)
}

fn push_unique(rules: &mut Vec<Rule>, rule: Rule) {
    if !rules.iter().any(|r| r.id == rule.id) {
        rules.push(rule);
    }
}
