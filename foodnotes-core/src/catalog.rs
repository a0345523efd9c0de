//! Category catalog: the ordered preference taxonomy supplied by the
//! application at startup. Read-only to the engine; every wire-content build
//! and parse is keyed by the shapes declared here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Icon used for items the catalog does not know (free-text additions).
pub const FALLBACK_ICON: &str = "circle";

fn fallback_icon() -> String {
    FALLBACK_ICON.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub name: String,
    #[serde(default = "fallback_icon")]
    pub icon: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogGroup {
    pub name: String,
    pub items: Vec<CatalogItem>,
}

/// Fixed per category by the catalog; flat and grouped content never mix at
/// runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "camelCase")]
pub enum CategoryLayout {
    Flat { items: Vec<CatalogItem> },
    Grouped { groups: Vec<CatalogGroup> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCategory {
    pub id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub layout: CategoryLayout,
}

impl CatalogCategory {
    pub fn is_grouped(&self) -> bool {
        matches!(self.layout, CategoryLayout::Grouped { .. })
    }

    /// Icon metadata for an item, falling back for items the catalog does not
    /// list.
    pub fn icon_for(&self, item: &str) -> &str {
        let found = match &self.layout {
            CategoryLayout::Flat { items } => items.iter().find(|i| i.name == item),
            CategoryLayout::Grouped { groups } => groups
                .iter()
                .flat_map(|g| g.items.iter())
                .find(|i| i.name == item),
        };
        found.map(|i| i.icon.as_str()).unwrap_or(FALLBACK_ICON)
    }

    /// The declared group holding `item`, for grouped categories.
    pub fn group_of(&self, item: &str) -> Option<&str> {
        match &self.layout {
            CategoryLayout::Flat { .. } => None,
            CategoryLayout::Grouped { groups } => groups
                .iter()
                .find(|g| g.items.iter().any(|i| i.name == item))
                .map(|g| g.name.as_str()),
        }
    }
}

/// Ordered list of categories with id and display-name lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    categories: Vec<CatalogCategory>,
}

impl Catalog {
    pub fn new(categories: Vec<CatalogCategory>) -> Self {
        Self { categories }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse category catalog")
    }

    pub fn categories(&self) -> &[CatalogCategory] {
        &self.categories
    }

    pub fn by_id(&self, id: &str) -> Option<&CatalogCategory> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn by_display_name(&self, name: &str) -> Option<&CatalogCategory> {
        self.categories.iter().find(|c| c.display_name == name)
    }
}
