//! Applying learned rules to a page.

use scraper::{ElementRef, Html};
use serde_json::{Map, Value};
use url::Url;

use super::rule::Rule;
use crate::storage::Record;

/// Values one rule produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleResult {
    /// Rule id.
    pub rule_id: String,
    /// Rule alias.
    pub alias: String,
    /// Unique values in document order.
    pub values: Vec<String>,
}

/// Everything extracted from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Per-rule results, in rule order.
    pub rules: Vec<RuleResult>,
}

impl Extraction {
    /// Values grouped by alias, aliases in first-seen order, duplicates dropped.
    pub fn by_alias(&self) -> Vec<(String, Vec<String>)> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for result in &self.rules {
            let idx = match groups.iter().position(|(alias, _)| *alias == result.alias) {
                Some(idx) => idx,
                None => {
                    groups.push((result.alias.clone(), Vec::new()));
                    groups.len() - 1
                }
            };
            let values = &mut groups[idx].1;
            for value in &result.values {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        groups
    }

    /// Values for one alias.
    pub fn values_for(&self, alias: &str) -> Vec<String> {
        self.by_alias()
            .into_iter()
            .find(|(a, _)| a == alias)
            .map(|(_, values)| values)
            .unwrap_or_default()
    }

    /// Total number of values across aliases.
    pub fn value_count(&self) -> usize {
        self.by_alias().iter().map(|(_, values)| values.len()).sum()
    }

    /// `{alias: [values]}`.
    pub fn alias_json(&self) -> Value {
        let map: Map<String, Value> = self
            .by_alias()
            .into_iter()
            .map(|(alias, values)| (alias, Value::from(values)))
            .collect();
        Value::Object(map)
    }

    /// `{rule_id: [values]}`.
    pub fn rule_json(&self) -> Value {
        let map: Map<String, Value> = self
            .rules
            .iter()
            .map(|r| (r.rule_id.clone(), Value::from(r.values.clone())))
            .collect();
        Value::Object(map)
    }

    /// Rows zipped by position across aliases; short columns pad with null.
    pub fn records(&self) -> Vec<Record> {
        let groups = self.by_alias();
        let rows = groups.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        (0..rows)
            .map(|i| {
                groups
                    .iter()
                    .map(|(alias, values)| {
                        let cell = values.get(i).cloned().map(Value::String).unwrap_or(Value::Null);
                        (alias.clone(), cell)
                    })
                    .collect::<Record>()
            })
            .collect()
    }
}

/// Run `rules` against `html`. `exact` also pins sibling positions.
pub fn apply(html: &str, base: Option<&Url>, rules: &[Rule], exact: bool) -> Extraction {
    let doc = Html::parse_document(html);
    let results = rules
        .iter()
        .map(|rule| {
            let mut values: Vec<String> = Vec::new();
            for el in locate(&doc, rule, exact) {
                if let Some(value) = rule.value_of(el, base) {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
            }
            RuleResult {
                rule_id: rule.id.clone(),
                alias: rule.alias.clone(),
                values,
            }
        })
        .collect();
    Extraction { rules: results }
}

fn locate<'a>(doc: &'a Html, rule: &Rule, exact: bool) -> Vec<ElementRef<'a>> {
    let root = doc.root_element();
    let Some((head, rest)) = rule.stack.split_first() else {
        return Vec::new();
    };
    if !head.is_similar(root) {
        return Vec::new();
    }

    let mut frontier = vec![root];
    for spec in rest {
        let mut next = Vec::new();
        for parent in &frontier {
            let mut same_tag = 0;
            for child in parent.children().filter_map(ElementRef::wrap) {
                if child.value().name() != spec.tag {
                    continue;
                }
                let index = same_tag;
                same_tag += 1;
                if spec.is_similar(child) && (!exact || index == spec.index) {
                    next.push(child);
                }
            }
        }
        if next.is_empty() {
            return next;
        }
        frontier = next;
    }
    frontier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{learn, WantedData};
    use std::collections::BTreeMap;

    const PAGE: &str = r#"
        <ul class="results">
          <li class="row"><a href="/p/1">Widget</a> <em class="cost">$3</em></li>
          <li class="row"><a href="/p/2">Gadget</a> <em class="cost">$4</em></li>
          <li class="row sponsored"><a href="/p/3">Ad</a></li>
          <li class="row"><a href="/p/4">Gizmo</a></li>
        </ul>"#;

    fn rules_for(wanted: WantedData, base: Option<&Url>) -> Vec<Rule> {
        learn(PAGE, base, &wanted).rules
    }

    #[test]
    fn similar_mode_collects_siblings_with_same_classes() {
        let rules = rules_for(WantedData::List(vec!["Widget".into()]), None);
        let found = apply(PAGE, None, &rules, false);
        assert_eq!(found.values_for("value"), vec!["Widget", "Gadget", "Gizmo"]);
    }

    #[test]
    fn exact_mode_pins_positions() {
        let rules = rules_for(WantedData::List(vec!["Gadget".into()]), None);
        let found = apply(PAGE, None, &rules, true);
        assert_eq!(found.values_for("value"), vec!["Gadget"]);
    }

    #[test]
    fn attribute_rules_yield_absolute_links() {
        let base = Url::parse("https://store.example/").unwrap();
        let rules = rules_for(
            WantedData::List(vec!["https://store.example/p/1".into()]),
            Some(&base),
        );
        let found = apply(PAGE, Some(&base), &rules, false);
        assert_eq!(
            found.values_for("value"),
            vec![
                "https://store.example/p/1",
                "https://store.example/p/2",
                "https://store.example/p/4"
            ]
        );
    }

    #[test]
    fn records_pad_short_columns_with_null() {
        let mut groups = BTreeMap::new();
        groups.insert("name".to_string(), vec!["Widget".to_string()]);
        groups.insert("cost".to_string(), vec!["$3".to_string()]);
        let rules = rules_for(WantedData::Grouped(groups), None);
        let found = apply(PAGE, None, &rules, false);

        let records = found.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1]["name"], "Gadget");
        assert_eq!(records[1]["cost"], "$4");
        assert_eq!(records[2]["name"], "Gizmo");
        assert_eq!(records[2]["cost"], Value::Null);
    }

    #[test]
    fn unrelated_page_yields_nothing() {
        let rules = rules_for(WantedData::List(vec!["Widget".into()]), None);
        let found = apply("<p>nothing here</p>", None, &rules, false);
        assert_eq!(found.value_count(), 0);
        assert!(found.records().is_empty());
        assert_eq!(found.rule_json()[&rules[0].id], serde_json::json!([]));
    }
}
