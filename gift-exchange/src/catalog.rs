//! Gift catalog
//!
//! Static slug → item mapping, loaded once at startup. Catalog files are TOML:
//!
//! ```toml
//! [[gift]]
//! slug = "rose"
//! name = "Rose"
//! coin_cost = 1
//! tier = "common"
//! animation = "petals"
//! ```

use crate::{types::GiftCatalogItem, Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    gift: Vec<GiftCatalogItem>,
}

/// Read-only gift catalog
#[derive(Debug, Clone, Default)]
pub struct GiftCatalog {
    items: BTreeMap<String, GiftCatalogItem>,
}

impl GiftCatalog {
    /// Catalog from items; slugs must be unique and costs positive
    pub fn from_items(items: impl IntoIterator<Item = GiftCatalogItem>) -> Result<Self> {
        let mut map = BTreeMap::new();

        for item in items {
            if item.slug.is_empty() {
                return Err(Error::Config("gift slug must not be empty".to_string()));
            }
            if item.coin_cost == 0 {
                return Err(Error::Config(format!("gift {} has no coin cost", item.slug)));
            }
            if item.broadcaster_share_percent.map_or(false, |p| p > 100) {
                return Err(Error::Config(format!(
                    "gift {} share exceeds 100%",
                    item.slug
                )));
            }
            if map.contains_key(&item.slug) {
                return Err(Error::Config(format!("duplicate gift slug {}", item.slug)));
            }
            map.insert(item.slug.clone(), item);
        }

        Ok(Self { items: map })
    }

    /// Parse a TOML catalog
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse catalog: {}", e)))?;
        Self::from_items(file.gift)
    }

    /// Load a TOML catalog file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Small catalog for local development
    pub fn development() -> Self {
        let items = [
            GiftCatalogItem::new("rose", "Rose", 1)
                .animation("petals")
                .category("classic"),
            GiftCatalogItem::new("troll_heart", "Troll Heart", 10)
                .animation("glow")
                .category("classic"),
            GiftCatalogItem::new("bridge_toll", "Bridge Toll", 25)
                .tier("rare")
                .animation("coins")
                .category("troll"),
            GiftCatalogItem::new("golden_club", "Golden Club", 500)
                .tier("epic")
                .animation("smash")
                .category("troll"),
            GiftCatalogItem::new("troll_crown", "Troll Crown", 5_200)
                .tier("legendary")
                .animation("crown_drop")
                .category("royal"),
        ];

        Self {
            items: items
                .into_iter()
                .map(|item| (item.slug.clone(), item))
                .collect(),
        }
    }

    /// Look up a slug
    pub fn get(&self, slug: &str) -> Result<&GiftCatalogItem> {
        self.items
            .get(slug)
            .ok_or_else(|| Error::GiftNotFound(slug.to_string()))
    }

    /// All items, by slug
    pub fn items(&self) -> impl Iterator<Item = &GiftCatalogItem> {
        self.items.values()
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the catalog has no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_catalog() {
        let catalog = GiftCatalog::development();
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.get("bridge_toll").unwrap().coin_cost, 25);
        assert!(matches!(catalog.get("unicorn"), Err(Error::GiftNotFound(_))));
    }

    #[test]
    fn test_from_toml() {
        let catalog = GiftCatalog::from_toml(
            r#"
            [[gift]]
            slug = "rose"
            name = "Rose"
            coin_cost = 1

            [[gift]]
            slug = "whale"
            name = "Whale"
            coin_cost = 50000
            broadcaster_share_percent = 80
            tier = "legendary"
            animation = "splash"
            "#,
        )
        .unwrap();

        let rose = catalog.get("rose").unwrap();
        assert_eq!(rose.tier, "common");
        assert!(rose.animation.is_none());

        let whale = catalog.get("whale").unwrap();
        assert_eq!(whale.broadcaster_share_percent, Some(80));
        assert_eq!(whale.animation.as_deref(), Some("splash"));
    }

    #[test]
    fn test_duplicate_slug_rejected() {
        let result = GiftCatalog::from_items([
            GiftCatalogItem::new("rose", "Rose", 1),
            GiftCatalogItem::new("rose", "Red Rose", 2),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_free_gift_rejected() {
        let result = GiftCatalog::from_items([GiftCatalogItem::new("air", "Air", 0)]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, "[[gift]]\nslug = \"star\"\nname = \"Star\"\ncoin_cost = 100\n")
            .unwrap();

        let catalog = GiftCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.get("star").unwrap().coin_cost, 100);
    }
}
