//! Configuration for the gift exchange

use crate::types::{DEFAULT_BROADCASTER_SHARE, DEFAULT_CREATOR_BONUS_SHARE};
use coin_ledger::UserId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a purchase reports when its inventory write fails after the coins
/// were spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryFailurePolicy {
    /// Succeed with an unknown inventory quantity; the row is repaired
    /// operationally
    #[default]
    ReportSuccess,
    /// Credit the coins back as a refund and fail the purchase
    Refund,
}

/// Gift exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog file; the built-in development catalog is used when unset
    pub catalog_path: Option<PathBuf>,

    /// Receiver share of a sent gift's value, for items without their own
    pub broadcaster_share: Decimal,

    /// Purchase behaviour when the inventory write fails
    pub inventory_failure_policy: InventoryFailurePolicy,

    /// Extra share of earnings paid to contracted creators
    pub creator_bonus_share: Decimal,

    /// Contracted creators, for deployments without a creator directory
    pub contracted_creators: Vec<UserId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_path: None,
            broadcaster_share: DEFAULT_BROADCASTER_SHARE,
            inventory_failure_policy: InventoryFailurePolicy::default(),
            creator_bonus_share: DEFAULT_CREATOR_BONUS_SHARE,
            contracted_creators: Vec::new(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(path) = std::env::var("GIFT_EXCHANGE_CATALOG") {
            config.catalog_path = Some(PathBuf::from(path));
        }

        if let Ok(share) = std::env::var("GIFT_EXCHANGE_BROADCASTER_SHARE") {
            config.broadcaster_share = share
                .parse()
                .map_err(|e| crate::Error::Config(format!("GIFT_EXCHANGE_BROADCASTER_SHARE: {}", e)))?;
        }

        if let Ok(policy) = std::env::var("GIFT_EXCHANGE_INVENTORY_POLICY") {
            config.inventory_failure_policy = match policy.as_str() {
                "report_success" => InventoryFailurePolicy::ReportSuccess,
                "refund" => InventoryFailurePolicy::Refund,
                other => {
                    return Err(crate::Error::Config(format!(
                        "GIFT_EXCHANGE_INVENTORY_POLICY: unknown policy {}",
                        other
                    )))
                }
            };
        }

        if let Ok(share) = std::env::var("GIFT_EXCHANGE_CREATOR_BONUS_SHARE") {
            config.creator_bonus_share = share.parse().map_err(|e| {
                crate::Error::Config(format!("GIFT_EXCHANGE_CREATOR_BONUS_SHARE: {}", e))
            })?;
        }

        if let Ok(creators) = std::env::var("GIFT_EXCHANGE_CONTRACTED_CREATORS") {
            config.contracted_creators = creators
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(UserId::new)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.broadcaster_share < Decimal::ZERO || self.broadcaster_share > Decimal::ONE {
            return Err(crate::Error::Config(format!(
                "broadcaster_share must be within [0, 1], got {}",
                self.broadcaster_share
            )));
        }

        if self.creator_bonus_share < Decimal::ZERO || self.creator_bonus_share > Decimal::ONE {
            return Err(crate::Error::Config(format!(
                "creator_bonus_share must be within [0, 1], got {}",
                self.creator_bonus_share
            )));
        }

        Ok(())
    }
}
