//! In-memory preference store: the entity cache, the single active working
//! set, and the derived association index / canvas aggregate kept consistent
//! with it.

use crate::catalog::Catalog;
use crate::model::{EntityKey, EntityRecord, PreferenceSet};
use crate::remote::FetchAllResponse;
use crate::wire;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;


/// Derived map from (category, item) to the entities that selected it.
///
/// Pure function of the entity cache: rebuilt on hydration and patched
/// incrementally by each local edit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssociationIndex {
    entries: BTreeMap<String, BTreeMap<String, BTreeSet<EntityKey>>>,
}

impl AssociationIndex {
    pub fn add(&mut self, category: &str, item: &str, key: &EntityKey) {
        self.entries
            .entry(category.to_string())
            .or_default()
            .entry(item.to_string())
            .or_default()
            .insert(key.clone());
    }

    /// Remove one entity's attribution. Returns true when the (category, item)
    /// entry emptied and was deleted entirely.
    pub fn remove(&mut self, category: &str, item: &str, key: &EntityKey) -> bool {
        let Some(items) = self.entries.get_mut(category) else {
            return false;
        };
        let Some(keys) = items.get_mut(item) else {
            return false;
        };
        keys.remove(key);
        if !keys.is_empty() {
            return false;
        }
        items.remove(item);
        if items.is_empty() {
            self.entries.remove(category);
        }
        true
    }

    pub fn entities_for(&self, category: &str, item: &str) -> Option<&BTreeSet<EntityKey>> {
        self.entries.get(category).and_then(|items| items.get(item))
    }

    /// Items in `category` currently attributed to `key`.
    pub fn items_attributed_to(&self, category: &str, key: &EntityKey) -> BTreeSet<String> {
        self.entries
            .get(category)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, keys)| keys.contains(key))
                    .map(|(item, _)| item.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The engine's mutable core. All mutation goes through the single logical
/// owner holding this store; the sync layer only reads records and writes
/// back version tokens and re-merged notes.
pub struct PreferenceStore {
    catalog: Arc<Catalog>,
    active_key: EntityKey,
    active_prefs: PreferenceSet,
    cache: BTreeMap<EntityKey, EntityRecord>,
    associations: AssociationIndex,
    canvas: PreferenceSet,
}

impl PreferenceStore {
    /// Create a store holding empty records for the family entity and every
    /// known member. The family entity starts active.
    pub fn new(catalog: Arc<Catalog>, members: impl IntoIterator<Item = String>) -> Self {
        let mut cache = BTreeMap::new();
        cache.insert(EntityKey::Everyone, EntityRecord::default());
        for member in members {
            cache.insert(EntityKey::Member(member), EntityRecord::default());
        }
        Self {
            catalog,
            active_key: EntityKey::Everyone,
            active_prefs: PreferenceSet::new(),
            cache,
            associations: AssociationIndex::default(),
            canvas: PreferenceSet::new(),
        }
    }

    pub fn active_key(&self) -> &EntityKey {
        &self.active_key
    }

    pub fn active_prefs(&self) -> &PreferenceSet {
        &self.active_prefs
    }

    pub fn canvas(&self) -> &PreferenceSet {
        &self.canvas
    }

    pub fn associations(&self) -> &AssociationIndex {
        &self.associations
    }

    pub fn record(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.cache.get(key)
    }

    pub fn entity_keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.cache.keys()
    }

    /// Populate the cache from a full remote load, then rebuild the derived
    /// state from scratch. Entities absent from the response keep an empty
    /// record at version 0.
    pub fn hydrate(&mut self, resp: &FetchAllResponse) {
        let catalog = Arc::clone(&self.catalog);
        for record in self.cache.values_mut() {
            *record = EntityRecord::default();
        }
        if let Some(vc) = &resp.family_record {
            self.cache.insert(
                EntityKey::Everyone,
                EntityRecord {
                    prefs: wire::parse_prefs(&vc.content, &catalog),
                    misc_notes: wire::extract_misc_notes(&vc.content),
                    version: vc.version,
                },
            );
        }
        for (member, vc) in &resp.member_records {
            self.cache.insert(
                EntityKey::Member(member.clone()),
                EntityRecord {
                    prefs: wire::parse_prefs(&vc.content, &catalog),
                    misc_notes: wire::extract_misc_notes(&vc.content),
                    version: vc.version,
                },
            );
        }
        self.rebuild_derived();
        self.active_prefs = self
            .cache
            .get(&self.active_key)
            .map(|r| r.prefs.clone())
            .unwrap_or_default();
        debug!(entities = self.cache.len(), "hydrated preference store");
    }

    /// Drop back to empty records for every known entity. Used when the
    /// initial load fails: the cache must never be left partially populated.
    pub fn reset_empty(&mut self) {
        for record in self.cache.values_mut() {
            *record = EntityRecord::default();
        }
        self.associations.clear();
        self.canvas = PreferenceSet::new();
        self.active_prefs = PreferenceSet::new();
    }

    /// Switch the active entity: write the in-progress working set back under
    /// the old key, then load the target's cached set (or a fresh empty one).
    /// Purely a view change; derived state and the scheduler are untouched.
    pub fn set_active(&mut self, key: EntityKey) {
        let previous = std::mem::replace(&mut self.active_key, key);
        let working = std::mem::take(&mut self.active_prefs);
        self.cache.entry(previous).or_default().prefs = working;
        self.active_prefs = self
            .cache
            .entry(self.active_key.clone())
            .or_default()
            .prefs
            .clone();
    }

    /// Commit a mutated working set for the active entity, patching the
    /// association index and canvas by diffing against this one entity's
    /// previous attribution. Returns the key to schedule for sync.
    pub fn commit_edit(&mut self, mut new_prefs: PreferenceSet) -> EntityKey {
        let catalog = Arc::clone(&self.catalog);
        new_prefs.conform(&catalog);
        let key = self.active_key.clone();
        self.cache.entry(key.clone()).or_default().prefs = new_prefs.clone();

        for category in catalog.categories() {
            let name = category.display_name.as_str();
            let previously = self.associations.items_attributed_to(name, &key);
            let now = new_prefs.items_in(name);
            for item in previously.difference(&now) {
                if self.associations.remove(name, item, &key) {
                    self.canvas.remove_item(name, item);
                }
            }
            for item in now.difference(&previously) {
                self.associations.add(name, item, &key);
                let group = new_prefs.get(name).and_then(|s| s.group_of(item));
                self.canvas.insert_item(name, group, item);
            }
        }

        self.active_prefs = new_prefs;
        key
    }

    pub fn set_version(&mut self, key: &EntityKey, version: i64) {
        self.cache.entry(key.clone()).or_default().version = version;
    }

    /// Replace an entity's notes with the server's authoritative copy, as part
    /// of conflict resolution.
    pub fn set_misc_notes(&mut self, key: &EntityKey, notes: Vec<String>) {
        self.cache.entry(key.clone()).or_default().misc_notes = notes;
    }

    /// Append a free-text note on behalf of the assistant writer. Notes ride
    /// along on the entity's next structured sync.
    pub fn append_misc_note(&mut self, key: &EntityKey, note: String) {
        self.cache
            .entry(key.clone())
            .or_default()
            .misc_notes
            .push(note);
    }

    /// Rebuild associations and canvas as a direct union fold over the cache.
    fn rebuild_derived(&mut self) {
        let catalog = Arc::clone(&self.catalog);
        self.associations.clear();
        self.canvas = PreferenceSet::new();
        for (key, record) in &self.cache {
            for category in catalog.categories() {
                let name = category.display_name.as_str();
                let Some(selection) = record.prefs.get(name) else {
                    continue;
                };
                for item in selection.items() {
                    self.associations.add(name, &item, key);
                    self.canvas.insert_item(name, selection.group_of(&item), &item);
                }
            }
        }
    }
}
