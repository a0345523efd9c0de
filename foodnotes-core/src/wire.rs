//! Wire-content (de)serialization. Remote records are loosely-shaped JSON
//! keyed by category id; this module converts them to and from the typed
//! model, with every decode keyed by the catalog's declared shape so unknown
//! shapes are rejected rather than guessed.

use crate::catalog::{Catalog, CatalogCategory, CategoryLayout};
use crate::model::{EntityRecord, PreferenceSet, Selection};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Reserved top-level key carrying non-category payload.
pub const MISC_KEY: &str = "preferences";
/// Free-text notes sub-field under [`MISC_KEY`], owned by the assistant
/// writer and passed through structured syncs untouched.
pub const MISC_FIELD: &str = "misc";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireItem {
    pub name: String,
    #[serde(rename = "iconName")]
    pub icon_name: String,
}

/// Per-category wire payload: an array of items (flat) or an object of
/// group-name to items (grouped).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CategoryContent {
    Flat(Vec<WireItem>),
    Grouped(BTreeMap<String, Vec<WireItem>>),
}

/// Decode one category's raw value against its declared shape.
fn decode_category(raw: &Value, category: &CatalogCategory) -> Result<CategoryContent> {
    match category.layout {
        CategoryLayout::Flat { .. } => {
            let items: Vec<WireItem> = serde_json::from_value(raw.clone())
                .with_context(|| format!("category '{}' is not a flat item list", category.id))?;
            Ok(CategoryContent::Flat(items))
        }
        CategoryLayout::Grouped { .. } => {
            let groups: BTreeMap<String, Vec<WireItem>> = serde_json::from_value(raw.clone())
                .with_context(|| format!("category '{}' is not a grouped map", category.id))?;
            Ok(CategoryContent::Grouped(groups))
        }
    }
}

fn selection_from(content: CategoryContent) -> Selection {
    match content {
        CategoryContent::Flat(items) => {
            Selection::List(items.into_iter().map(|i| i.name).collect())
        }
        CategoryContent::Grouped(groups) => Selection::Nested(
            groups
                .into_iter()
                .filter(|(_, items)| !items.is_empty())
                .map(|(name, items)| (name, items.into_iter().map(|i| i.name).collect()))
                .collect(),
        ),
    }
}

fn content_from(selection: &Selection, category: &CatalogCategory) -> Option<CategoryContent> {
    let wire_items = |items: &std::collections::BTreeSet<String>| -> Vec<WireItem> {
        items
            .iter()
            .map(|name| WireItem {
                name: name.clone(),
                icon_name: category.icon_for(name).to_string(),
            })
            .collect()
    };
    match (selection, category.is_grouped()) {
        (Selection::List(items), false) => Some(CategoryContent::Flat(wire_items(items))),
        (Selection::Nested(groups), true) => Some(CategoryContent::Grouped(
            groups
                .iter()
                .map(|(name, items)| (name.clone(), wire_items(items)))
                .collect(),
        )),
        _ => {
            warn!(category = %category.id, "selection shape contradicts catalog; omitting");
            None
        }
    }
}

/// Build the outgoing wire content for one entity: every non-empty category
/// in catalog order, plus the reserved misc-notes sub-field.
pub fn build_content(record: &EntityRecord, catalog: &Catalog) -> Result<Value> {
    let mut root = serde_json::Map::new();
    for category in catalog.categories() {
        let Some(selection) = record.prefs.get(&category.display_name) else {
            continue;
        };
        let Some(content) = content_from(selection, category) else {
            continue;
        };
        let value = serde_json::to_value(&content)
            .with_context(|| format!("failed to encode category '{}'", category.id))?;
        root.insert(category.id.clone(), value);
    }
    root.insert(MISC_KEY.to_string(), json!({ MISC_FIELD: record.misc_notes }));
    Ok(Value::Object(root))
}

/// Parse an entity's structured preferences out of wire content. Categories
/// that fail shape-checked decoding are treated as absent for this entity.
pub fn parse_prefs(content: &Value, catalog: &Catalog) -> PreferenceSet {
    let mut prefs = PreferenceSet::new();
    let Some(root) = content.as_object() else {
        warn!("wire content is not an object; treating as empty");
        return prefs;
    };
    for category in catalog.categories() {
        let Some(raw) = root.get(&category.id) else {
            continue;
        };
        match decode_category(raw, category) {
            Ok(content) => {
                let selection = selection_from(content);
                if !selection.is_empty() {
                    prefs.set(category.display_name.clone(), selection);
                }
            }
            Err(err) => {
                warn!(category = %category.id, error = %err, "skipping malformed category content");
            }
        }
    }
    prefs
}

/// Pull the assistant-owned notes out of wire content. Missing or malformed
/// fields read as no notes.
pub fn extract_misc_notes(content: &Value) -> Vec<String> {
    content
        .get(MISC_KEY)
        .and_then(|p| p.get(MISC_FIELD))
        .and_then(|m| m.as_array())
        .map(|notes| {
            notes
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityRecord;

    fn catalog() -> Catalog {
        Catalog::from_json(
            r#"{
              "categories": [
                {
                  "id": "allergies",
                  "displayName": "Allergies",
                  "shape": "flat",
                  "items": [
                    {"name": "Peanuts", "icon": "peanut"},
                    {"name": "Shellfish", "icon": "shrimp"}
                  ]
                },
                {
                  "id": "dislikes",
                  "displayName": "Dislikes",
                  "shape": "grouped",
                  "groups": [
                    {"name": "Vegetables", "items": [{"name": "Broccoli", "icon": "leaf"}]},
                    {"name": "Proteins", "items": [{"name": "Tofu", "icon": "cube"}]}
                  ]
                }
              ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_content_shapes_and_icons() {
        let catalog = catalog();
        let mut record = EntityRecord::default();
        record.prefs.insert_item("Allergies", None, "Peanuts");
        record.prefs.insert_item("Allergies", None, "Dragonfruit");
        record.prefs.insert_item("Dislikes", Some("Vegetables"), "Broccoli");
        record.misc_notes = vec!["no spicy food".to_string()];

        let content = build_content(&record, &catalog).unwrap();
        let allergies = content["allergies"].as_array().unwrap();
        assert_eq!(allergies.len(), 2);
        // Catalog items carry their icon; unknown items fall back.
        assert_eq!(allergies[1]["name"], "Peanuts");
        assert_eq!(allergies[1]["iconName"], "peanut");
        assert_eq!(allergies[0]["name"], "Dragonfruit");
        assert_eq!(allergies[0]["iconName"], crate::catalog::FALLBACK_ICON);

        let dislikes = content["dislikes"].as_object().unwrap();
        assert_eq!(dislikes["Vegetables"][0]["name"], "Broccoli");
        assert_eq!(content[MISC_KEY][MISC_FIELD][0], "no spicy food");
    }

    #[test]
    fn test_empty_categories_are_omitted() {
        let catalog = catalog();
        let record = EntityRecord::default();
        let content = build_content(&record, &catalog).unwrap();
        assert!(content.get("allergies").is_none());
        assert!(content.get("dislikes").is_none());
        assert_eq!(content[MISC_KEY][MISC_FIELD].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_parse_prefs_round_trip() {
        let catalog = catalog();
        let content = serde_json::json!({
            "allergies": [{"name": "Peanuts", "iconName": "peanut"}],
            "dislikes": {"Proteins": [{"name": "Tofu", "iconName": "cube"}]},
            "preferences": {"misc": ["note"]}
        });
        let prefs = parse_prefs(&content, &catalog);
        assert_eq!(
            prefs.items_in("Allergies").into_iter().collect::<Vec<_>>(),
            vec!["Peanuts".to_string()]
        );
        assert_eq!(prefs.get("Dislikes").unwrap().group_of("Tofu"), Some("Proteins"));
        assert_eq!(extract_misc_notes(&content), vec!["note".to_string()]);
    }

    #[test]
    fn test_mismatched_shape_is_treated_as_absent() {
        let catalog = catalog();
        // Grouped payload under a flat category, and vice versa.
        let content = serde_json::json!({
            "allergies": {"Oops": [{"name": "Peanuts", "iconName": "peanut"}]},
            "dislikes": [{"name": "Tofu", "iconName": "cube"}]
        });
        let prefs = parse_prefs(&content, &catalog);
        assert!(prefs.is_empty());
    }

    #[test]
    fn test_misc_notes_missing_or_malformed() {
        assert!(extract_misc_notes(&serde_json::json!({})).is_empty());
        assert!(extract_misc_notes(&serde_json::json!({"preferences": {"misc": 3}})).is_empty());
    }
}
