//! Learned element paths.

use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// One level of a rule's element chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Lowercase tag name.
    pub tag: String,
    /// Sorted, de-duplicated class list.
    #[serde(default)]
    pub classes: Vec<String>,
    /// Position among siblings with the same tag.
    #[serde(default)]
    pub index: usize,
}

impl NodeSpec {
    /// Describe `el` as it sits in its parent.
    pub fn of(el: ElementRef<'_>) -> Self {
        let tag = el.value().name().to_string();
        let index = el
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|sib| sib.value().name() == tag)
            .count();
        Self {
            classes: class_list(el),
            tag,
            index,
        }
    }

    /// Tag and class set agree (sibling position ignored).
    pub fn is_similar(&self, el: ElementRef<'_>) -> bool {
        el.value().name() == self.tag && class_list(el) == self.classes
    }
}

/// A learned location of wanted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier derived from the path.
    pub id: String,
    /// Group the extracted values belong to.
    pub alias: String,
    /// Element chain from `<html>` to the value.
    pub stack: Vec<NodeSpec>,
    /// Attribute holding the value; element text when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
}

impl Rule {
    /// Build a rule for `el`, deriving the id from its path.
    pub fn for_element(el: ElementRef<'_>, alias: &str, attr: Option<&str>) -> Self {
        let mut chain: Vec<ElementRef<'_>> = el.ancestors().filter_map(ElementRef::wrap).collect();
        chain.reverse();
        chain.push(el);

        let stack: Vec<NodeSpec> = chain.into_iter().map(NodeSpec::of).collect();
        let id = rule_id(&stack, attr);
        Self {
            id,
            alias: alias.to_string(),
            stack,
            attr: attr.map(str::to_string),
        }
    }

    /// Pull this rule's value out of a matched element.
    pub fn value_of(&self, el: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
        match self.attr.as_deref() {
            None => {
                let text = super::normalize_text(el.text());
                (!text.is_empty()).then_some(text)
            }
            Some(attr) => {
                let raw = el.value().attr(attr)?.trim();
                if raw.is_empty() {
                    return None;
                }
                Some(resolve_link(attr, raw, base))
            }
        }
    }
}

/// Absolute form of `href`/`src` values; other attributes pass through.
pub(crate) fn resolve_link(attr: &str, raw: &str, base: Option<&Url>) -> String {
    if !matches!(attr, "href" | "src") {
        return raw.to_string();
    }
    match base.and_then(|b| b.join(raw).ok()) {
        Some(url) => url.to_string(),
        None => raw.to_string(),
    }
}

fn class_list(el: ElementRef<'_>) -> Vec<String> {
    let mut classes: Vec<String> = el.value().classes().map(str::to_string).collect();
    classes.sort();
    classes.dedup();
    classes
}

fn rule_id(stack: &[NodeSpec], attr: Option<&str>) -> String {
    let mut key = String::new();
    for spec in stack {
        key.push_str(&format!("/{}[{}]{}", spec.tag, spec.index, spec.classes.join(".")));
    }
    if let Some(attr) = attr {
        key.push('@');
        key.push_str(attr);
    }
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
    format!("rule_{}", &uuid.simple().to_string()[..8])
}
