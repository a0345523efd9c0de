//! Core data model: entity keys, selections, preference sets and the
//! per-entity records held in the cache.

use crate::catalog::Catalog;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Sentinel key for the family-level entity.
pub const EVERYONE: &str = "Everyone";

/// Owner of a preference set: the whole family or one member.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Everyone,
    Member(String),
}

impl EntityKey {
    pub fn parse(s: &str) -> Self {
        if s == EVERYONE {
            EntityKey::Everyone
        } else {
            EntityKey::Member(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityKey::Everyone => EVERYONE,
            EntityKey::Member(id) => id,
        }
    }

    pub fn is_everyone(&self) -> bool {
        matches!(self, EntityKey::Everyone)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EntityKey::parse(&s))
    }
}

/// An entity's selections within one category. Flat categories hold a plain
/// item set, grouped categories hold per-group item sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    List(BTreeSet<String>),
    Nested(BTreeMap<String, BTreeSet<String>>),
}

impl Selection {
    /// All selected item names, flattened across groups.
    pub fn items(&self) -> BTreeSet<String> {
        match self {
            Selection::List(items) => items.clone(),
            Selection::Nested(groups) => groups.values().flatten().cloned().collect(),
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        match self {
            Selection::List(items) => items.contains(item),
            Selection::Nested(groups) => groups.values().any(|g| g.contains(item)),
        }
    }

    /// The group holding `item`, for nested selections.
    pub fn group_of(&self, item: &str) -> Option<&str> {
        match self {
            Selection::List(_) => None,
            Selection::Nested(groups) => groups
                .iter()
                .find(|(_, items)| items.contains(item))
                .map(|(name, _)| name.as_str()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Selection::List(items) => items.is_empty(),
            Selection::Nested(groups) => groups.values().all(|g| g.is_empty()),
        }
    }

    /// Drop empty groups from nested selections.
    fn prune(&mut self) {
        if let Selection::Nested(groups) = self {
            groups.retain(|_, items| !items.is_empty());
        }
    }
}

/// A category-keyed record of one entity's selections.
///
/// Invariant: a category entry is either absent or non-empty in at least one
/// group/list; empty containers are pruned, never stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceSet {
    categories: BTreeMap<String, Selection>,
}

impl PreferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, category: &str) -> Option<&Selection> {
        self.categories.get(category)
    }

    /// All item names the entity has selected in `category`.
    pub fn items_in(&self, category: &str) -> BTreeSet<String> {
        self.categories
            .get(category)
            .map(|s| s.items())
            .unwrap_or_default()
    }

    /// Insert a selection, pruning it first. Empty selections clear the entry.
    pub fn set(&mut self, category: impl Into<String>, mut selection: Selection) {
        selection.prune();
        let category = category.into();
        if selection.is_empty() {
            self.categories.remove(&category);
        } else {
            self.categories.insert(category, selection);
        }
    }

    /// Add one item, into `group` for grouped categories.
    pub fn insert_item(&mut self, category: &str, group: Option<&str>, item: &str) {
        match group {
            Some(group) => {
                let selection = self
                    .categories
                    .entry(category.to_string())
                    .or_insert_with(|| Selection::Nested(BTreeMap::new()));
                if let Selection::Nested(groups) = selection {
                    groups
                        .entry(group.to_string())
                        .or_default()
                        .insert(item.to_string());
                }
            }
            None => {
                let selection = self
                    .categories
                    .entry(category.to_string())
                    .or_insert_with(|| Selection::List(BTreeSet::new()));
                if let Selection::List(items) = selection {
                    items.insert(item.to_string());
                }
            }
        }
    }

    /// Remove one item wherever it appears in `category`, pruning emptied
    /// groups and the category entry itself.
    pub fn remove_item(&mut self, category: &str, item: &str) {
        let Some(selection) = self.categories.get_mut(category) else {
            return;
        };
        match selection {
            Selection::List(items) => {
                items.remove(item);
            }
            Selection::Nested(groups) => {
                for items in groups.values_mut() {
                    items.remove(item);
                }
                groups.retain(|_, items| !items.is_empty());
            }
        }
        if selection.is_empty() {
            self.categories.remove(category);
        }
    }

    /// Drop selections for categories the catalog does not declare, and
    /// selections whose shape contradicts the declared one. Prunes empties.
    pub fn conform(&mut self, catalog: &Catalog) {
        self.categories.retain(|name, selection| {
            let Some(category) = catalog.by_display_name(name) else {
                warn!(category = %name, "dropping selection for unknown category");
                return false;
            };
            selection.prune();
            if selection.is_empty() {
                return false;
            }
            let shape_matches = matches!(
                (&*selection, category.is_grouped()),
                (Selection::List(_), false) | (Selection::Nested(_), true)
            );
            if !shape_matches {
                warn!(category = %name, "dropping selection with mismatched shape");
            }
            shape_matches
        });
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Selection)> {
        self.categories.iter()
    }
}

/// One entity's cached state: structured preferences, the free-text notes
/// owned by the assistant writer, and the server-issued version token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub prefs: PreferenceSet,
    pub misc_notes: Vec<String>,
    pub version: i64,
}
