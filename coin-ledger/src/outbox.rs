//! Side-effect outbox
//!
//! Coin-earning events are not delivered inline. They are written as outbox
//! records in the same storage write as the ledger entry that caused them and
//! delivered later by the dispatcher, at least once.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Secondary update derived from a committed credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    /// Accrue part of a credit to the earner's family statistics
    FamilyContribution {
        /// Earner
        user_id: UserId,
        /// Coins credited to the earner
        credited: u64,
        /// Coins accrued to the family
        contribution: u64,
    },

    /// Report earned coins to weekly task progress
    TaskProgress {
        /// Earner
        user_id: UserId,
        /// Coins earned
        coins: u64,
    },

    /// Report earned coins to family war progress
    WarProgress {
        /// Earner
        user_id: UserId,
        /// Coins earned
        coins: u64,
    },
}

impl SideEffect {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            SideEffect::FamilyContribution { .. } => "family_contribution",
            SideEffect::TaskProgress { .. } => "task_progress",
            SideEffect::WarProgress { .. } => "war_progress",
        }
    }

    /// User the effect is about
    pub fn user_id(&self) -> &UserId {
        match self {
            SideEffect::FamilyContribution { user_id, .. }
            | SideEffect::TaskProgress { user_id, .. }
            | SideEffect::WarProgress { user_id, .. } => user_id,
        }
    }
}

/// Delivery state of an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for (re)delivery
    Pending,
    /// Delivered to its sink
    Delivered,
    /// Gave up after the configured attempts; kept for audit
    Failed,
}

/// Durable side-effect record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Record ID (UUIDv7)
    pub id: Uuid,

    /// Ledger entry that produced the effect
    pub entry_id: Option<Uuid>,

    /// Effect payload
    pub effect: SideEffect,

    /// Delivery state
    pub status: OutboxStatus,

    /// Delivery attempts so far
    pub attempts: u32,

    /// Last delivery error
    pub last_error: Option<String>,

    /// Earliest time of the next attempt
    pub next_attempt_at: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Delivery timestamp
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// New pending record, due immediately
    pub fn pending(effect: SideEffect, entry_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            entry_id,
            effect,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            delivered_at: None,
        }
    }

    /// Whether the record should be attempted at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_record_is_due() {
        let record = OutboxRecord::pending(
            SideEffect::TaskProgress {
                user_id: UserId::new("u1"),
                coins: 10,
            },
            None,
        );
        assert!(record.is_due(Utc::now()));
        assert_eq!(record.attempts, 0);
        assert_eq!(record.effect.label(), "task_progress");
    }

    #[test]
    fn test_effect_json_is_tagged() {
        let effect = SideEffect::WarProgress {
            user_id: UserId::new("u1"),
            coins: 7,
        };
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json["kind"], "war_progress");
        assert_eq!(json["coins"], 7);
    }
}
