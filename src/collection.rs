//! Reusable category templates.
//!
//! A [Collection] keeps, per [ContentType], a hierarchical category selection, the category
//! tabs derived from it, and the individually picked items with their quantities. Every mutation
//! marks its content type dirty so that persistence layers can tell which parts changed.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::JobsiteError,
    estimate::MAX_QUANTITY,
    hierarchy::{
        normalize_key, CategoryPath, CategorySelection, SelectionDocument, SelectionState,
        SelectionTrie,
    },
    inventory::Catalog,
    properties::{now_millis, ContentMap, ContentSet, ContentType, DocId},
    store::Document,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSelection {
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryTab {
    pub id: DocId,
    pub section: String,
    pub category: String,
    pub label: String,
    pub item_ids: Vec<DocId>,
    pub position: usize,
}

impl CategoryTab {
    pub fn tab_id(content_type: ContentType, section: &str, category: &str) -> DocId {
        DocId::derived(
            "category-tab",
            &format!(
                "{}/{}/{}",
                content_type,
                normalize_key(section),
                normalize_key(category)
            ),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentState {
    #[serde(default)]
    pub selection: SelectionTrie,
    #[serde(default)]
    pub tabs: Vec<CategoryTab>,
    #[serde(default)]
    pub items: BTreeMap<DocId, ItemSelection>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSummary {
    pub selected_prefixes: usize,
    pub tabs: usize,
    pub items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: DocId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default)]
    pub content: ContentMap<ContentState>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip)]
    dirty: ContentSet,
}

impl Document for Collection {
    const COLLECTION: &'static str = "collections";

    fn doc_id(&self) -> &DocId {
        &self.id
    }
}

impl Collection {
    pub fn new(name: &str) -> Result<Collection, JobsiteError> {
        let now = now_millis();
        let collection = Collection {
            id: DocId::new(),
            name: name.trim().to_string(),
            description: None,
            job_type: None,
            content: ContentMap::default(),
            created_at: now,
            updated_at: now,
            dirty: ContentSet::empty(),
        };
        collection.validate()?;
        Ok(collection)
    }

    pub fn validate(&self) -> Result<(), JobsiteError> {
        if self.name.is_empty() {
            return Err(JobsiteError::Validation(
                "collection name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rename(&mut self, name: &str) -> Result<(), JobsiteError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(JobsiteError::Validation(
                "collection name cannot be empty".to_string(),
            ));
        }
        self.name = name.to_string();
        self.updated_at = now_millis();
        Ok(())
    }

    pub fn state(&self, content_type: ContentType) -> Option<&ContentState> {
        self.content.get(content_type)
    }

    fn state_mut(&mut self, content_type: ContentType) -> &mut ContentState {
        self.dirty.insert(content_type);
        self.updated_at = now_millis();
        self.content.entry_or_default(content_type)
    }

    pub fn dirty(&self) -> ContentSet {
        self.dirty
    }

    /// Content types changed since the last call.
    pub fn take_dirty(&mut self) -> ContentSet {
        std::mem::take(&mut self.dirty)
    }

    pub fn select_category(&mut self, content_type: ContentType, prefix: &CategoryPath) -> bool {
        self.state_mut(content_type).selection.select(prefix)
    }

    pub fn deselect_category(&mut self, content_type: ContentType, prefix: &CategoryPath) -> bool {
        self.state_mut(content_type).selection.deselect(prefix)
    }

    pub fn category_state(&self, content_type: ContentType, prefix: &CategoryPath) -> SelectionState {
        self.state(content_type)
            .map(|s| s.selection.state_of(prefix))
            .unwrap_or(SelectionState::None)
    }

    /// Recompute tabs from the current selection. Surviving tabs keep their label and relative
    /// position, new tabs are appended in path order, and tabs without items are dropped.
    pub fn rebuild_tabs(&mut self, content_type: ContentType, catalog: &Catalog) -> &[CategoryTab] {
        let state = self.state_mut(content_type);
        let selection: CategorySelection = state.selection.clone().into();
        let matching = catalog.matching(content_type, &selection);
        let groups = Catalog::group_by_tab(&matching);

        let mut previous: BTreeMap<DocId, CategoryTab> = state
            .tabs
            .drain(..)
            .map(|tab| (tab.id.clone(), tab))
            .collect();
        let mut kept: Vec<CategoryTab> = Vec::new();
        let mut added: Vec<CategoryTab> = Vec::new();
        for group in groups {
            let id = CategoryTab::tab_id(content_type, &group.section, &group.category);
            let item_ids = group.items.iter().map(|i| i.id.clone()).collect();
            match previous.remove(&id) {
                Some(tab) => kept.push(CategoryTab { item_ids, ..tab }),
                None => added.push(CategoryTab {
                    id,
                    label: format!("{} / {}", group.section, group.category),
                    section: group.section,
                    category: group.category,
                    item_ids,
                    position: 0,
                }),
            }
        }
        kept.sort_by_key(|t| t.position);
        kept.extend(added);
        for (position, tab) in kept.iter_mut().enumerate() {
            tab.position = position;
        }
        state.tabs = kept;
        &state.tabs
    }

    pub fn rename_tab(
        &mut self,
        content_type: ContentType,
        tab_id: &DocId,
        label: &str,
    ) -> Result<(), JobsiteError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(JobsiteError::Validation("tab label cannot be empty".to_string()));
        }
        let tab = self
            .state_mut(content_type)
            .tabs
            .iter_mut()
            .find(|t| t.id == *tab_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("tab {tab_id}")))?;
        tab.label = label.to_string();
        Ok(())
    }

    /// Move a tab to `position`, shifting the others. Positions past the end move it last.
    pub fn move_tab(
        &mut self,
        content_type: ContentType,
        tab_id: &DocId,
        position: usize,
    ) -> Result<(), JobsiteError> {
        let tabs = &mut self.state_mut(content_type).tabs;
        let from = tabs
            .iter()
            .position(|t| t.id == *tab_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("tab {tab_id}")))?;
        let tab = tabs.remove(from);
        let to = position.min(tabs.len());
        tabs.insert(to, tab);
        for (idx, tab) in tabs.iter_mut().enumerate() {
            tab.position = idx;
        }
        Ok(())
    }

    pub fn select_item(
        &mut self,
        content_type: ContentType,
        item_id: &DocId,
        quantity: f64,
        catalog: &Catalog,
    ) -> Result<(), JobsiteError> {
        check_quantity(quantity)?;
        let item = catalog
            .get(item_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("inventory item {item_id}")))?;
        if item.content_type != content_type {
            return Err(JobsiteError::Validation(format!(
                "item '{}' is {}, not {}",
                item.name, item.content_type, content_type
            )));
        }
        let state = self.state_mut(content_type);
        state
            .items
            .entry(item_id.clone())
            .and_modify(|s| s.quantity = quantity)
            .or_insert(ItemSelection {
                quantity,
                notes: None,
            });
        Ok(())
    }

    pub fn set_quantity(
        &mut self,
        content_type: ContentType,
        item_id: &DocId,
        quantity: f64,
    ) -> Result<(), JobsiteError> {
        check_quantity(quantity)?;
        let selection = self
            .state_mut(content_type)
            .items
            .get_mut(item_id)
            .ok_or_else(|| JobsiteError::NotFound(format!("selected item {item_id}")))?;
        selection.quantity = quantity;
        Ok(())
    }

    pub fn deselect_item(&mut self, content_type: ContentType, item_id: &DocId) -> bool {
        self.state_mut(content_type).items.remove(item_id).is_some()
    }

    /// Drop item selections the category selection no longer covers, or whose item left the
    /// catalog. Returns the removed ids.
    pub fn prune_items(&mut self, content_type: ContentType, catalog: &Catalog) -> Vec<DocId> {
        let Some(state) = self.content.get(content_type) else {
            return Vec::new();
        };
        let stale: Vec<DocId> = state
            .items
            .keys()
            .filter(|id| {
                catalog
                    .get(id)
                    .map(|item| !state.selection.covers(&item.path))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !stale.is_empty() {
            let state = self.state_mut(content_type);
            for id in stale.iter() {
                state.items.remove(id);
            }
        }
        stale
    }

    pub fn summary(&self) -> BTreeMap<ContentType, ContentSummary> {
        self.content
            .iter()
            .map(|(ct, state)| {
                (
                    ct,
                    ContentSummary {
                        selected_prefixes: state.selection.len(),
                        tabs: state.tabs.len(),
                        items: state.items.len(),
                    },
                )
            })
            .collect()
    }

    /// All selected item ids across content types.
    pub fn selected_item_ids(&self) -> BTreeSet<DocId> {
        self.content
            .iter()
            .flat_map(|(_, state)| state.items.keys().cloned())
            .collect()
    }
}

fn check_quantity(quantity: f64) -> Result<(), JobsiteError> {
    if !quantity.is_finite() || quantity <= 0.0 || quantity > MAX_QUANTITY {
        return Err(JobsiteError::Validation(format!(
            "quantity must be a positive number up to {MAX_QUANTITY}, got {quantity}"
        )));
    }
    Ok(())
}

/// True when any content selection in a raw collection document is in the legacy flat shape.
pub fn has_legacy_selections(doc: &Value) -> bool {
    doc.get("content")
        .and_then(|c| c.as_object())
        .map(|content| {
            content.values().any(|state| {
                state
                    .get("selection")
                    .map(|s| {
                        SelectionDocument::from_value(s.clone())
                            .map(|d| d.is_legacy())
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Rewrite legacy flat selections inside a raw collection document as hierarchical ones,
/// migrated against `catalog`. Returns the number of selections rewritten.
pub fn upgrade_legacy_selections(doc: &mut Value, catalog: &Catalog) -> Result<usize, JobsiteError> {
    let Some(content) = doc.get_mut("content").and_then(|c| c.as_object_mut()) else {
        return Ok(0);
    };
    let mut upgraded = 0;
    for state in content.values_mut() {
        let Some(selection) = state.get_mut("selection") else {
            continue;
        };
        let document = SelectionDocument::from_value(selection.clone())?;
        if document.is_legacy() {
            let trie = document.into_selection()?.into_trie(catalog);
            *selection = serde_json::to_value(&trie)?;
            upgraded += 1;
        }
    }
    if upgraded > 0 {
        tracing::info!("Upgraded {upgraded} legacy selections");
    }
    Ok(upgraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::sample_catalog;
    use serde_json::json;
    use test_log::test;

    fn path(s: &str) -> CategoryPath {
        s.parse().unwrap()
    }

    fn item_id(catalog: &Catalog, name: &str) -> DocId {
        catalog.items().find(|i| i.name == name).unwrap().id.clone()
    }

    #[test]
    fn test_new_requires_name() {
        assert!(Collection::new("   ").is_err());
        let mut c = Collection::new(" Kitchen remodel ").unwrap();
        assert_eq!(c.name, "Kitchen remodel");
        assert!(c.rename("").is_err());
        assert!(c.dirty().is_empty());
    }

    #[test]
    fn test_mutations_mark_content_dirty() {
        let mut c = Collection::new("Bath").unwrap();
        c.select_category(ContentType::Products, &path("Plumbing"));
        c.select_category(ContentType::Labor, &path("Plumbing"));
        assert_eq!(
            c.take_dirty(),
            ContentType::Products | ContentType::Labor
        );
        assert!(c.take_dirty().is_empty());
        c.deselect_category(ContentType::Labor, &path("Plumbing"));
        assert_eq!(c.dirty(), ContentSet::only(ContentType::Labor));
    }

    #[test]
    fn test_rebuild_tabs_keeps_labels_and_order() {
        let catalog = sample_catalog();
        let mut c = Collection::new("Electrical").unwrap();
        c.select_category(ContentType::Products, &path("Electrical/Rough-In"));
        let tabs = c.rebuild_tabs(ContentType::Products, &catalog).to_vec();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].category, "Boxes");
        assert_eq!(tabs[1].item_ids.len(), 1);

        let wire = tabs[1].id.clone();
        c.rename_tab(ContentType::Products, &wire, "Wire & cable").unwrap();
        c.move_tab(ContentType::Products, &wire, 0).unwrap();

        c.select_category(ContentType::Products, &path("Electrical/Finish"));
        let tabs = c.rebuild_tabs(ContentType::Products, &catalog).to_vec();
        let labels: Vec<&str> = tabs.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["Wire & cable", "Rough-In / Boxes", "Finish / Devices"]
        );
        assert_eq!(tabs[2].position, 2);

        c.deselect_category(ContentType::Products, &path("Electrical/Rough-In"));
        let tabs = c.rebuild_tabs(ContentType::Products, &catalog).to_vec();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].position, 0);
    }

    #[test]
    fn test_item_selection_rules() {
        let catalog = sample_catalog();
        let mut c = Collection::new("Job").unwrap();
        let romex = item_id(&catalog, "12/2 Romex");
        assert!(c
            .select_item(ContentType::Products, &romex, 0.0, &catalog)
            .is_err());
        assert!(c
            .select_item(ContentType::Products, &romex, f64::NAN, &catalog)
            .is_err());
        assert!(c
            .select_item(ContentType::Products, &romex, 1e30, &catalog)
            .is_err());
        assert!(c
            .select_item(ContentType::Labor, &romex, 1.0, &catalog)
            .is_err());
        c.select_item(ContentType::Products, &romex, 2.0, &catalog)
            .unwrap();
        c.set_quantity(ContentType::Products, &romex, 3.5).unwrap();
        assert_eq!(
            c.state(ContentType::Products).unwrap().items[&romex].quantity,
            3.5
        );
        assert!(c.deselect_item(ContentType::Products, &romex));
        assert!(!c.deselect_item(ContentType::Products, &romex));
    }

    #[test]
    fn test_prune_items_drops_uncovered() {
        let catalog = sample_catalog();
        let mut c = Collection::new("Job").unwrap();
        let romex = item_id(&catalog, "12/2 Romex");
        let outlet = item_id(&catalog, "Duplex outlet");
        c.select_category(ContentType::Products, &path("Electrical"));
        c.select_item(ContentType::Products, &romex, 1.0, &catalog)
            .unwrap();
        c.select_item(ContentType::Products, &outlet, 1.0, &catalog)
            .unwrap();
        c.deselect_category(ContentType::Products, &path("Electrical"));
        c.select_category(ContentType::Products, &path("Electrical/Rough-In"));
        assert_eq!(c.prune_items(ContentType::Products, &catalog), vec![outlet]);
        assert_eq!(c.summary()[&ContentType::Products].items, 1);
    }

    #[test]
    fn test_serialized_form_omits_dirty_and_round_trips() {
        let mut c = Collection::new("Job").unwrap();
        c.select_category(ContentType::Tools, &path("General"));
        let value = serde_json::to_value(&c).unwrap();
        assert!(value.get("dirty").is_none());
        assert_eq!(value["content"]["tools"]["selection"]["version"], json!(2));
        let restored: Collection = serde_json::from_value(value).unwrap();
        assert!(restored.dirty().is_empty());
        assert_eq!(restored.content, c.content);
    }

    #[test]
    fn test_legacy_selection_upgrade() {
        let catalog = sample_catalog();
        let mut raw = json!({
            "id": "c1",
            "name": "Old",
            "createdAt": 0,
            "updatedAt": 0,
            "content": {
                "products": {"selection": {"trades": ["Electrical"], "sections": ["Rough-In"]}}
            }
        });
        assert!(has_legacy_selections(&raw));
        assert_eq!(upgrade_legacy_selections(&mut raw, &catalog).unwrap(), 1);
        assert!(!has_legacy_selections(&raw));
        let c: Collection = serde_json::from_value(raw).unwrap();
        let selection = &c.state(ContentType::Products).unwrap().selection;
        assert_eq!(selection.prefixes(), vec![path("Electrical/Rough-In")]);
    }
}
