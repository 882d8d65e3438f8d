//! Hierarchical category classification and sparse, mixed-granularity selections.
//!
//! Every inventory item is classified by a [CategoryPath] of up to five levels
//! (trade / section / category / subcategory / type). A user selection is a set of path
//! *prefixes* held in a [SelectionTrie]: selecting a trade implicitly selects everything below
//! it, while selecting a single subcategory selects only that subtree. An item is covered when
//! some selected prefix is a prefix of its path.
//!
//! Two persisted shapes exist. The current one nests `tradeName`/`sections`/`categories`/...
//! objects and is written inside a versioned envelope (`{"version": 2, "trades": [...]}`). The
//! legacy shape holds five flat name lists that are intersected level by level. Classification
//! between them is explicit ([SelectionDocument::from_value]); anything ambiguous is an error.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use crate::{error::JobsiteError, inventory::Catalog};

/// Current version of the persisted hierarchical selection envelope.
pub const SELECTION_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HierarchyLevel {
    Trade,
    Section,
    Category,
    Subcategory,
    Type,
}

impl HierarchyLevel {
    pub const ALL: [HierarchyLevel; 5] = [
        HierarchyLevel::Trade,
        HierarchyLevel::Section,
        HierarchyLevel::Category,
        HierarchyLevel::Subcategory,
        HierarchyLevel::Type,
    ];

    pub fn depth(&self) -> usize {
        *self as usize
    }

    pub fn from_depth(depth: usize) -> Option<HierarchyLevel> {
        HierarchyLevel::ALL.get(depth).copied()
    }
}

pub const MAX_DEPTH: usize = HierarchyLevel::ALL.len();

/// Trim and collapse inner whitespace, keeping case. Used for display labels.
pub fn clean_label(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Comparison key for a path segment.
pub fn normalize_key(raw: &str) -> String {
    clean_label(raw).to_lowercase()
}

/// A classification path, trade first. Segments compare case- and whitespace-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CategoryPath {
    labels: Vec<String>,
    keys: Vec<String>,
}

impl CategoryPath {
    pub fn new<I, S>(segments: I) -> Result<CategoryPath, JobsiteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let labels = segments
            .into_iter()
            .map(|s| clean_label(s.as_ref()))
            .collect::<Vec<String>>();
        if labels.is_empty() {
            return Err(JobsiteError::Validation(
                "a category path needs at least a trade".to_string(),
            ));
        }
        if labels.len() > MAX_DEPTH {
            return Err(JobsiteError::Validation(format!(
                "category path '{}' is deeper than {MAX_DEPTH} levels",
                labels.join(" / ")
            )));
        }
        if labels.iter().any(|l| l.is_empty()) {
            return Err(JobsiteError::Validation(format!(
                "category path '{}' contains an empty segment",
                labels.join(" / ")
            )));
        }
        let keys = labels.iter().map(|l| l.to_lowercase()).collect();
        Ok(CategoryPath { labels, keys })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Always false, paths hold at least one segment.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The deepest level this path names.
    pub fn level(&self) -> HierarchyLevel {
        HierarchyLevel::from_depth(self.len() - 1).unwrap_or(HierarchyLevel::Type)
    }

    pub fn segment(&self, level: HierarchyLevel) -> Option<&str> {
        self.labels.get(level.depth()).map(|s| s.as_str())
    }

    pub fn trade(&self) -> &str {
        &self.labels[0]
    }

    pub fn section(&self) -> Option<&str> {
        self.segment(HierarchyLevel::Section)
    }

    pub fn category(&self) -> Option<&str> {
        self.segment(HierarchyLevel::Category)
    }

    /// The first `depth` segments. Returns a clone when `depth` covers the whole path.
    pub fn truncated(&self, depth: usize) -> CategoryPath {
        let depth = depth.clamp(1, self.len());
        CategoryPath {
            labels: self.labels[..depth].to_vec(),
            keys: self.keys[..depth].to_vec(),
        }
    }

    pub fn child(&self, segment: &str) -> Result<CategoryPath, JobsiteError> {
        let mut labels = self.labels.clone();
        labels.push(segment.to_string());
        CategoryPath::new(labels)
    }

    pub fn is_prefix_of(&self, other: &CategoryPath) -> bool {
        self.len() <= other.len() && self.keys.iter().zip(other.keys.iter()).all(|(a, b)| a == b)
    }
}

impl PartialEq for CategoryPath {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
    }
}

impl Eq for CategoryPath {}

impl Hash for CategoryPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.keys.hash(state);
    }
}

impl PartialOrd for CategoryPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CategoryPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keys.cmp(&other.keys)
    }
}

impl Display for CategoryPath {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.labels.join(" / "))
    }
}

impl FromStr for CategoryPath {
    type Err = JobsiteError;

    /// Parses `"Electrical/Rough-In/Wire"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CategoryPath::new(s.split('/'))
    }
}

impl TryFrom<Vec<String>> for CategoryPath {
    type Error = JobsiteError;
    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        CategoryPath::new(value)
    }
}

impl From<CategoryPath> for Vec<String> {
    fn from(path: CategoryPath) -> Vec<String> {
        path.labels
    }
}

/// Tri-state of a prefix relative to a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionState {
    /// The prefix or one of its ancestors is selected.
    Selected,
    /// Some descendant is selected, the prefix itself is not covered.
    Partial,
    None,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TrieNode {
    label: String,
    selected: bool,
    children: BTreeMap<String, TrieNode>,
}

impl TrieNode {
    fn new(label: &str) -> TrieNode {
        TrieNode {
            label: label.to_string(),
            ..Default::default()
        }
    }

    fn selected_count(&self) -> usize {
        usize::from(self.selected)
            + self
                .children
                .values()
                .map(|c| c.selected_count())
                .sum::<usize>()
    }

    fn collect(&self, prefix: &mut Vec<String>, out: &mut Vec<CategoryPath>) {
        prefix.push(self.label.clone());
        if self.selected {
            if let Ok(path) = CategoryPath::new(prefix.iter()) {
                out.push(path);
            }
        } else {
            for child in self.children.values() {
                child.collect(prefix, out);
            }
        }
        prefix.pop();
    }
}

/// A set of selected category prefixes.
///
/// Invariants: a selected node has no children (descendants of a selection are redundant and
/// pruned), and every unselected node has at least one selected descendant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "SelectionEnvelope")]
pub struct SelectionTrie {
    roots: BTreeMap<String, TrieNode>,
    count: usize,
}

impl SelectionTrie {
    pub fn new() -> SelectionTrie {
        SelectionTrie::default()
    }

    /// Select `prefix` and everything beneath it. Returns false when `prefix` was already
    /// covered.
    pub fn select(&mut self, prefix: &CategoryPath) -> bool {
        let mut children = &mut self.roots;
        let last = prefix.len() - 1;
        for (depth, (key, label)) in prefix.keys().iter().zip(prefix.labels()).enumerate() {
            let node = children
                .entry(key.clone())
                .or_insert_with(|| TrieNode::new(label));
            if node.selected {
                return false;
            }
            if depth == last {
                let pruned: usize = node.children.values().map(|c| c.selected_count()).sum();
                node.children.clear();
                node.selected = true;
                self.count = self.count + 1 - pruned;
                return true;
            }
            children = &mut node.children;
        }
        false
    }

    /// Remove `prefix` and every selection beneath it. A prefix that is only covered through a
    /// selected ancestor is left alone. Returns whether anything was removed.
    pub fn deselect(&mut self, prefix: &CategoryPath) -> bool {
        match remove_subtree(&mut self.roots, prefix.keys()) {
            Some(removed) if removed > 0 => {
                self.count -= removed;
                true
            }
            _ => false,
        }
    }

    /// True when some selected prefix is a prefix of `path`.
    pub fn covers(&self, path: &CategoryPath) -> bool {
        let mut children = &self.roots;
        for key in path.keys() {
            match children.get(key) {
                Some(node) if node.selected => return true,
                Some(node) => children = &node.children,
                None => return false,
            }
        }
        false
    }

    pub fn state_of(&self, prefix: &CategoryPath) -> SelectionState {
        let mut children = &self.roots;
        let mut current = None;
        for key in prefix.keys() {
            match children.get(key) {
                Some(node) if node.selected => return SelectionState::Selected,
                Some(node) => {
                    children = &node.children;
                    current = Some(node);
                }
                None => return SelectionState::None,
            }
        }
        match current {
            Some(node) if !node.children.is_empty() => SelectionState::Partial,
            _ => SelectionState::None,
        }
    }

    /// Selected prefixes in key order.
    pub fn prefixes(&self) -> Vec<CategoryPath> {
        let mut out = Vec::with_capacity(self.count);
        let mut scratch = Vec::with_capacity(MAX_DEPTH);
        for node in self.roots.values() {
            node.collect(&mut scratch, &mut out);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.roots.clear();
        self.count = 0;
    }

    pub fn to_hierarchical(&self) -> Vec<TradeSelection> {
        self.roots
            .values()
            .map(|trade| TradeSelection {
                trade_name: trade.label.clone(),
                sections: trade
                    .children
                    .values()
                    .map(|section| SectionSelection {
                        section_name: section.label.clone(),
                        categories: section
                            .children
                            .values()
                            .map(|category| CategoryNodeSelection {
                                category_name: category.label.clone(),
                                subcategories: category
                                    .children
                                    .values()
                                    .map(|sub| SubcategorySelection {
                                        subcategory_name: sub.label.clone(),
                                        types: sub
                                            .children
                                            .values()
                                            .map(|t| t.label.clone())
                                            .collect(),
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn from_hierarchical(trades: &[TradeSelection]) -> Result<SelectionTrie, JobsiteError> {
        let mut trie = SelectionTrie::new();
        for trade in trades {
            let trade_path = CategoryPath::new([&trade.trade_name])?;
            if trade.sections.is_empty() {
                trie.select(&trade_path);
            }
            for section in trade.sections.iter() {
                let section_path = trade_path.child(&section.section_name)?;
                if section.categories.is_empty() {
                    trie.select(&section_path);
                }
                for category in section.categories.iter() {
                    let category_path = section_path.child(&category.category_name)?;
                    if category.subcategories.is_empty() {
                        trie.select(&category_path);
                    }
                    for sub in category.subcategories.iter() {
                        let sub_path = category_path.child(&sub.subcategory_name)?;
                        if sub.types.is_empty() {
                            trie.select(&sub_path);
                        }
                        for type_name in sub.types.iter() {
                            trie.select(&sub_path.child(type_name)?);
                        }
                    }
                }
            }
        }
        Ok(trie)
    }
}

fn remove_subtree(children: &mut BTreeMap<String, TrieNode>, keys: &[String]) -> Option<usize> {
    let (key, rest) = keys.split_first()?;
    if rest.is_empty() {
        return children.remove(key).map(|node| node.selected_count());
    }
    let child = children.get_mut(key)?;
    if child.selected {
        return None;
    }
    let removed = remove_subtree(&mut child.children, rest)?;
    if child.children.is_empty() {
        children.remove(key);
    }
    Some(removed)
}

impl<'a> FromIterator<&'a CategoryPath> for SelectionTrie {
    fn from_iter<T: IntoIterator<Item = &'a CategoryPath>>(iter: T) -> Self {
        let mut trie = SelectionTrie::new();
        for path in iter {
            trie.select(path);
        }
        trie
    }
}

impl TryFrom<Value> for SelectionTrie {
    type Error = JobsiteError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match SelectionDocument::from_value(value)?.into_selection()? {
            CategorySelection::Hierarchical(trie) => Ok(trie),
            CategorySelection::Legacy(_) => Err(JobsiteError::Serialization(
                "legacy flat selection must be migrated against the catalog first".to_string(),
            )),
        }
    }
}

impl From<SelectionTrie> for SelectionEnvelope {
    fn from(trie: SelectionTrie) -> SelectionEnvelope {
        SelectionEnvelope {
            version: SELECTION_VERSION,
            trades: trie.to_hierarchical(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSelection {
    pub trade_name: String,
    #[serde(default)]
    pub sections: Vec<SectionSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSelection {
    pub section_name: String,
    #[serde(default)]
    pub categories: Vec<CategoryNodeSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryNodeSelection {
    pub category_name: String,
    #[serde(default)]
    pub subcategories: Vec<SubcategorySelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubcategorySelection {
    pub subcategory_name: String,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionEnvelope {
    pub version: u32,
    pub trades: Vec<TradeSelection>,
}

/// The pre-hierarchy selection format: five independent name lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacySelection {
    #[serde(default)]
    pub trades: Vec<String>,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub subcategories: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
}

const LEGACY_KEYS: [&str; 5] = ["trades", "sections", "categories", "subcategories", "types"];

impl LegacySelection {
    fn level(&self, level: HierarchyLevel) -> &[String] {
        match level {
            HierarchyLevel::Trade => &self.trades,
            HierarchyLevel::Section => &self.sections,
            HierarchyLevel::Category => &self.categories,
            HierarchyLevel::Subcategory => &self.subcategories,
            HierarchyLevel::Type => &self.types,
        }
    }

    pub fn is_empty(&self) -> bool {
        HierarchyLevel::ALL.iter().all(|l| self.level(*l).is_empty())
    }

    /// Deepest level with a non-empty list.
    pub fn deepest_level(&self) -> Option<HierarchyLevel> {
        HierarchyLevel::ALL
            .iter()
            .rev()
            .find(|l| !self.level(**l).is_empty())
            .copied()
    }

    /// Every non-empty list must name the item's segment at that level. All-empty matches
    /// nothing.
    pub fn matches(&self, path: &CategoryPath) -> bool {
        if self.is_empty() {
            return false;
        }
        HierarchyLevel::ALL.iter().all(|level| {
            let names = self.level(*level);
            if names.is_empty() {
                return true;
            }
            match path.keys().get(level.depth()) {
                Some(key) => names.iter().any(|n| normalize_key(n) == *key),
                None => false,
            }
        })
    }

    /// Convert to a trie using the paths of the catalog items this selection matches, each
    /// truncated to the deepest level the legacy selection constrained.
    pub fn migrate(&self, catalog: &Catalog) -> SelectionTrie {
        let Some(deepest) = self.deepest_level() else {
            return SelectionTrie::new();
        };
        let mut trie = SelectionTrie::new();
        for item in catalog.items() {
            if self.matches(&item.path) {
                trie.select(&item.path.truncated(deepest.depth() + 1));
            }
        }
        tracing::debug!(
            "Migrated legacy selection into {} prefixes",
            trie.len()
        );
        trie
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CategorySelection {
    Hierarchical(SelectionTrie),
    Legacy(LegacySelection),
}

impl Default for CategorySelection {
    fn default() -> Self {
        CategorySelection::Hierarchical(SelectionTrie::new())
    }
}

impl CategorySelection {
    pub fn matches(&self, path: &CategoryPath) -> bool {
        match self {
            CategorySelection::Hierarchical(trie) => trie.covers(path),
            CategorySelection::Legacy(legacy) => legacy.matches(path),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CategorySelection::Hierarchical(trie) => trie.is_empty(),
            CategorySelection::Legacy(legacy) => legacy.is_empty(),
        }
    }

    /// Hierarchical selections pass through, legacy ones are migrated against `catalog`.
    pub fn into_trie(self, catalog: &Catalog) -> SelectionTrie {
        match self {
            CategorySelection::Hierarchical(trie) => trie,
            CategorySelection::Legacy(legacy) => legacy.migrate(catalog),
        }
    }
}

impl From<SelectionTrie> for CategorySelection {
    fn from(trie: SelectionTrie) -> Self {
        CategorySelection::Hierarchical(trie)
    }
}

/// A persisted selection, classified by its shape.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionDocument {
    Empty,
    Versioned(SelectionEnvelope),
    Hierarchical(Vec<TradeSelection>),
    Legacy(LegacySelection),
}

impl SelectionDocument {
    pub fn from_value(value: Value) -> Result<SelectionDocument, JobsiteError> {
        match value {
            Value::Null => Ok(SelectionDocument::Empty),
            Value::Array(ref elements) if elements.is_empty() => Ok(SelectionDocument::Empty),
            Value::Array(ref elements) => {
                let all_trades = elements.iter().all(|e| {
                    e.as_object()
                        .and_then(|o| o.get("tradeName"))
                        .map(|n| n.is_string())
                        .unwrap_or(false)
                });
                if !all_trades {
                    return Err(JobsiteError::Serialization(
                        "selection array mixes hierarchical trade entries with other shapes"
                            .to_string(),
                    ));
                }
                Ok(SelectionDocument::Hierarchical(serde_json::from_value(
                    value,
                )?))
            }
            Value::Object(ref map) if map.contains_key("version") => {
                let envelope: SelectionEnvelope = serde_json::from_value(value)?;
                if envelope.version != SELECTION_VERSION {
                    return Err(JobsiteError::Serialization(format!(
                        "unsupported selection version {}",
                        envelope.version
                    )));
                }
                Ok(SelectionDocument::Versioned(envelope))
            }
            Value::Object(ref map)
                if map.keys().all(|k| LEGACY_KEYS.contains(&k.as_str()))
                    && map.values().all(|v| {
                        v.as_array()
                            .map(|a| a.iter().all(|e| e.is_string()))
                            .unwrap_or(false)
                    }) =>
            {
                Ok(SelectionDocument::Legacy(serde_json::from_value(value)?))
            }
            other => Err(JobsiteError::Serialization(format!(
                "unrecognized selection shape: {}",
                shape_name(&other)
            ))),
        }
    }

    pub fn into_selection(self) -> Result<CategorySelection, JobsiteError> {
        match self {
            SelectionDocument::Empty => Ok(CategorySelection::default()),
            SelectionDocument::Versioned(envelope) => Ok(CategorySelection::Hierarchical(
                SelectionTrie::from_hierarchical(&envelope.trades)?,
            )),
            SelectionDocument::Hierarchical(trades) => Ok(CategorySelection::Hierarchical(
                SelectionTrie::from_hierarchical(&trades)?,
            )),
            SelectionDocument::Legacy(legacy) => Ok(CategorySelection::Legacy(legacy)),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, SelectionDocument::Legacy(_))
    }
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object with non-selection keys",
    }
}
