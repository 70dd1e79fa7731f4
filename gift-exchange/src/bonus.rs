//! Contracted-creator bonus
//!
//! Receivers under a creator contract earn an extra share of their gift
//! earnings. Contract status comes from a [`CreatorDirectory`]; paid bonuses
//! are written to a [`BonusLog`]. Neither a failed lookup nor a failed log
//! write fails the gift: the first pays the base earnings only, the second is
//! logged and counted.

use crate::{types::CreatorBonusRecord, Result};
use async_trait::async_trait;
use coin_ledger::UserId;
use std::collections::HashSet;

/// Creator contract lookup
#[async_trait]
pub trait CreatorDirectory: Send + Sync {
    /// Whether `creator_id` currently holds a creator contract
    async fn is_contracted(&self, creator_id: &UserId) -> Result<bool>;
}

/// Fixed set of contracted creators
#[derive(Debug, Default, Clone)]
pub struct ContractedCreators {
    creators: HashSet<UserId>,
}

impl ContractedCreators {
    /// Directory holding exactly `creators`
    pub fn new(creators: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            creators: creators.into_iter().collect(),
        }
    }

    /// Number of contracted creators
    pub fn len(&self) -> usize {
        self.creators.len()
    }

    /// Whether nobody is contracted
    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }
}

#[async_trait]
impl CreatorDirectory for ContractedCreators {
    async fn is_contracted(&self, creator_id: &UserId) -> Result<bool> {
        Ok(self.creators.contains(creator_id))
    }
}

/// Append-only log of paid creator bonuses
pub trait BonusLog: Send + Sync {
    /// Append one row
    fn record(&self, entry: &CreatorBonusRecord) -> Result<()>;

    /// Rows for a creator, oldest first
    fn bonuses_for_creator(&self, creator_id: &UserId) -> Result<Vec<CreatorBonusRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contracted_creators_lookup() {
        let directory = ContractedCreators::new([UserId::new("bob")]);
        assert_eq!(directory.len(), 1);
        assert!(directory.is_contracted(&UserId::new("bob")).await.unwrap());
        assert!(!directory.is_contracted(&UserId::new("carol")).await.unwrap());
        assert!(ContractedCreators::default().is_empty());
    }
}
