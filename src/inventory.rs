use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::JobsiteError,
    hierarchy::{normalize_key, CategoryPath, CategorySelection, HierarchyLevel},
    properties::{Cents, ContentType, DocId},
    store::Document,
};

/// Label used for the section or category of items classified only at a coarser level.
pub const GENERAL_LABEL: &str = "General";

fn default_active() -> bool {
    true
}

/// One purchasable or billable thing: a product, a labor rate, a tool, or a piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: DocId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub content_type: ContentType,
    pub path: CategoryPath,
    pub unit: String,
    pub unit_cost: Cents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Document for InventoryItem {
    const COLLECTION: &'static str = "inventory";

    fn doc_id(&self) -> &DocId {
        &self.id
    }
}

impl InventoryItem {
    pub fn new(
        name: &str,
        content_type: ContentType,
        path: CategoryPath,
        unit: &str,
        unit_cost: Cents,
    ) -> InventoryItem {
        InventoryItem {
            id: DocId::new(),
            name: name.trim().to_string(),
            sku: None,
            content_type,
            path,
            unit: unit.trim().to_string(),
            unit_cost,
            description: None,
            active: true,
        }
    }

    pub fn validate(&self) -> Result<(), JobsiteError> {
        if self.name.trim().is_empty() {
            return Err(JobsiteError::Validation(format!(
                "inventory item {} has no name",
                self.id
            )));
        }
        if self.unit_cost.is_negative() {
            return Err(JobsiteError::Validation(format!(
                "inventory item '{}' has a negative unit cost",
                self.name
            )));
        }
        Ok(())
    }

    /// Section label used for tab grouping.
    pub fn tab_section(&self) -> &str {
        self.path.section().unwrap_or(GENERAL_LABEL)
    }

    /// Category label used for tab grouping.
    pub fn tab_category(&self) -> &str {
        self.path.category().unwrap_or(GENERAL_LABEL)
    }
}

/// Item counts per node of the trade/section/category tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineNode {
    pub label: String,
    pub level: HierarchyLevel,
    pub item_count: usize,
    pub children: Vec<OutlineNode>,
}

/// Items sharing a (section, category) pair, the unit a category tab displays.
#[derive(Debug, Clone, PartialEq)]
pub struct TabGroup<'a> {
    pub section: String,
    pub category: String,
    pub items: Vec<&'a InventoryItem>,
}

/// The in-memory product catalog, kept sorted by content type, path, then name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: Vec<InventoryItem>,
    index: BTreeMap<DocId, usize>,
}

impl Catalog {
    pub fn new(mut items: Vec<InventoryItem>) -> Catalog {
        items.sort_by(|a, b| {
            a.content_type
                .cmp(&b.content_type)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.name.cmp(&b.name))
        });
        let index = items
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.id.clone(), idx))
            .collect();
        Catalog { items, index }
    }

    pub fn items(&self) -> impl Iterator<Item = &InventoryItem> {
        self.items.iter()
    }

    pub fn get(&self, id: &DocId) -> Option<&InventoryItem> {
        self.index.get(id).and_then(|idx| self.items.get(*idx))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<InventoryItem> {
        self.items
    }

    /// Active items of `content_type` covered by `selection`, in catalog order.
    pub fn matching(
        &self,
        content_type: ContentType,
        selection: &CategorySelection,
    ) -> Vec<&InventoryItem> {
        self.items
            .iter()
            .filter(|i| i.active && i.content_type == content_type && selection.matches(&i.path))
            .collect()
    }

    /// Trade, section and category tree for one content type.
    pub fn outline(&self, content_type: ContentType) -> Vec<OutlineNode> {
        let mut trades: Vec<OutlineNode> = Vec::new();
        for item in self
            .items
            .iter()
            .filter(|i| i.active && i.content_type == content_type)
        {
            let mut level_nodes = &mut trades;
            for (depth, label) in item.path.labels().iter().take(3).enumerate() {
                let key = normalize_key(label);
                let pos = match level_nodes
                    .iter()
                    .position(|n| normalize_key(&n.label) == key)
                {
                    Some(pos) => pos,
                    None => {
                        level_nodes.push(OutlineNode {
                            label: label.clone(),
                            level: HierarchyLevel::from_depth(depth)
                                .unwrap_or(HierarchyLevel::Category),
                            item_count: 0,
                            children: Vec::new(),
                        });
                        level_nodes.len() - 1
                    }
                };
                let node = &mut level_nodes[pos];
                node.item_count += 1;
                level_nodes = &mut node.children;
            }
        }
        trades
    }

    /// Group items into (section, category) tabs, in order of first appearance.
    pub fn group_by_tab<'a>(items: &[&'a InventoryItem]) -> Vec<TabGroup<'a>> {
        let mut groups: Vec<TabGroup<'a>> = Vec::new();
        let mut positions: BTreeMap<(String, String), usize> = BTreeMap::new();
        for &item in items {
            let key = (
                normalize_key(item.tab_section()),
                normalize_key(item.tab_category()),
            );
            let pos = *positions.entry(key).or_insert_with(|| {
                groups.push(TabGroup {
                    section: item.tab_section().to_string(),
                    category: item.tab_category().to_string(),
                    items: Vec::new(),
                });
                groups.len() - 1
            });
            groups[pos].items.push(item);
        }
        groups
    }
}

impl FromIterator<InventoryItem> for Catalog {
    fn from_iter<T: IntoIterator<Item = InventoryItem>>(iter: T) -> Self {
        Catalog::new(iter.into_iter().collect())
    }
}
