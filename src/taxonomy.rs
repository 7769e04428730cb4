//! Taxonomy code trees: labels, parent chains and code validity

use crate::error::{CoreError, CoreResult};
use crate::types::Taxonomy;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

static LEGACY_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-U]|\d{2}|\d{2}\.\d|\d{2}\.\d{2})$").expect("static regex is valid")
});

static HIERARCHICAL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{2}(?:\.\d{1,2}){0,4}$").expect("static regex is valid"));

/// Code-looking tokens inside free text
static CODE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{2}(?:\.\d{1,2})*\b").expect("static regex is valid"));

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyNode {
    pub code: String,
    pub label: String,
    pub parent: Option<String>,
    pub level: usize,
}

#[derive(Debug, Clone)]
pub struct TaxonomyTree {
    taxonomy: Taxonomy,
    nodes: BTreeMap<String, TaxonomyNode>,
}

/// Check a code's shape for a taxonomy
pub fn is_well_formed(taxonomy: Taxonomy, code: &str) -> bool {
    match taxonomy {
        Taxonomy::LegacyCodeTree => LEGACY_CODE.is_match(code),
        Taxonomy::HierarchicalTree => HIERARCHICAL_CODE.is_match(code),
    }
}

/// Parent implied by the dotted structure: `25.94` -> `25.9` -> `25`
fn implied_parent(code: &str) -> Option<String> {
    let (head, last) = code.rsplit_once('.')?;
    if last.len() > 1 {
        Some(format!("{}.{}", head, &last[..last.len() - 1]))
    } else {
        Some(head.to_string())
    }
}

impl TaxonomyTree {
    pub fn new(taxonomy: Taxonomy) -> Self {
        Self {
            taxonomy,
            nodes: BTreeMap::new(),
        }
    }

    pub fn taxonomy(&self) -> Taxonomy {
        self.taxonomy
    }

    /// Add a node. Without an explicit parent the parent is implied by the dotted code.
    pub fn insert(&mut self, code: &str, label: &str, parent: Option<&str>) -> CoreResult<()> {
        if !is_well_formed(self.taxonomy, code) {
            return Err(CoreError::InvalidInput(format!(
                "'{}' is not a {} code",
                code, self.taxonomy
            )));
        }
        let parent = parent.map(str::to_string).or_else(|| implied_parent(code));
        let level = match &parent {
            Some(p) => {
                let node = self.nodes.get(p).ok_or_else(|| {
                    CoreError::InvalidInput(format!("parent '{}' of '{}' is unknown", p, code))
                })?;
                node.level + 1
            }
            None => 0,
        };
        self.nodes.insert(
            code.to_string(),
            TaxonomyNode {
                code: code.to_string(),
                label: label.to_string(),
                parent,
                level,
            },
        );
        Ok(())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.nodes.contains_key(code)
    }

    pub fn node(&self, code: &str) -> Option<&TaxonomyNode> {
        self.nodes.get(code)
    }

    pub fn label(&self, code: &str) -> Option<&str> {
        self.nodes.get(code).map(|n| n.label.as_str())
    }

    /// Ancestors from the direct parent up to the root
    pub fn ancestors(&self, code: &str) -> Vec<&TaxonomyNode> {
        let mut chain = Vec::new();
        let mut current = self.nodes.get(code).and_then(|n| n.parent.as_deref());
        while let Some(code) = current {
            match self.nodes.get(code) {
                Some(node) => {
                    chain.push(node);
                    current = node.parent.as_deref();
                }
                None => break,
            }
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First code mentioned in `text` that exists in this tree.
    /// A bare section letter is accepted for the legacy tree.
    pub fn find_code_in(&self, text: &str) -> Option<&TaxonomyNode> {
        let trimmed = text.trim();
        if let Some(node) = self.nodes.get(trimmed) {
            return Some(node);
        }
        CODE_TOKEN
            .find_iter(text)
            .find_map(|m| self.nodes.get(m.as_str()))
    }

    /// Small built-in tree used by the demo server and tests
    pub fn builtin(taxonomy: Taxonomy) -> Self {
        let mut tree = Self::new(taxonomy);
        let entries: &[(&str, &str, Option<&str>)] = match taxonomy {
            Taxonomy::LegacyCodeTree => &[
                ("C", "Обрабатывающие производства", None),
                ("25", "Производство готовых металлических изделий", Some("C")),
                ("25.9", "Производство прочих готовых металлических изделий", None),
                ("25.94", "Производство крепежных изделий", None),
                ("27", "Производство электрического оборудования", Some("C")),
                ("27.1", "Производство электродвигателей и трансформаторов", None),
                ("27.11", "Производство электродвигателей, генераторов и трансформаторов", None),
                ("27.3", "Производство кабелей и кабельной арматуры", None),
                ("27.32", "Производство прочих проводов и кабелей", None),
                ("G", "Торговля оптовая и розничная", None),
                ("46", "Торговля оптовая", Some("G")),
                ("46.7", "Торговля оптовая специализированная прочая", None),
                ("46.74", "Торговля оптовая скобяными изделиями", None),
            ],
            Taxonomy::HierarchicalTree => &[
                ("25", "Изделия металлические готовые", None),
                ("25.9", "Изделия металлические готовые прочие", None),
                ("25.94", "Изделия крепежные и винты крепежные", None),
                ("25.94.1", "Изделия крепежные с резьбой", None),
                ("25.94.11", "Болты и винты из черных металлов", None),
                ("25.94.12", "Гайки из черных металлов", None),
                ("25.94.13", "Шайбы из черных металлов", None),
                ("27", "Оборудование электрическое", None),
                ("27.1", "Электродвигатели, генераторы и трансформаторы", None),
                ("27.11", "Электродвигатели, генераторы и трансформаторы", None),
                ("27.11.1", "Электродвигатели мощностью не более 37,5 вт", None),
                ("27.3", "Кабели и арматура кабельная", None),
                ("27.32", "Провода и кабели электронные и электрические прочие", None),
                ("27.32.1", "Провода и кабели прочие", None),
            ],
        };
        for (code, label, parent) in entries {
            // Entries are ordered parent-first
            if let Err(e) = tree.insert(code, label, *parent) {
                tracing::error!("Builtin {} tree rejected '{}': {}", taxonomy, code, e);
            }
        }
        tree
    }
}
