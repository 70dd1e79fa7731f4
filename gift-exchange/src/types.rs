//! Core types for the gift exchange

use chrono::{DateTime, Utc};
use coin_ledger::UserId;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Receiver share of a gift's value unless the catalog item says otherwise (70%)
pub const DEFAULT_BROADCASTER_SHARE: Decimal = Decimal::from_parts(70, 0, 0, false, 2);

/// Extra share of gift earnings paid to contracted creators (10%)
pub const DEFAULT_CREATOR_BONUS_SHARE: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftCatalogItem {
    /// Stable identifier
    pub slug: String,

    /// Display name
    pub name: String,

    /// Price of one unit in troll coins
    pub coin_cost: u64,

    /// Receiver share in whole percent; the configured default applies when unset
    #[serde(default)]
    pub broadcaster_share_percent: Option<u32>,

    /// Display tier
    #[serde(default = "default_tier")]
    pub tier: String,

    /// Animation played on delivery
    #[serde(default)]
    pub animation: Option<String>,

    /// Catalog category
    #[serde(default)]
    pub category: Option<String>,
}

fn default_tier() -> String {
    "common".to_string()
}

impl GiftCatalogItem {
    /// Item with the default tier and no animation
    pub fn new(slug: impl Into<String>, name: impl Into<String>, coin_cost: u64) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            coin_cost,
            broadcaster_share_percent: None,
            tier: default_tier(),
            animation: None,
            category: None,
        }
    }

    /// Set tier
    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    /// Set animation
    pub fn animation(mut self, animation: impl Into<String>) -> Self {
        self.animation = Some(animation.into());
        self
    }

    /// Set category
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Override the receiver share
    pub fn broadcaster_share_percent(mut self, percent: u32) -> Self {
        self.broadcaster_share_percent = Some(percent);
        self
    }

    /// Receiver share as a fraction
    pub fn broadcaster_share(&self, default: Decimal) -> Decimal {
        self.broadcaster_share_percent
            .map(|p| Decimal::new(p as i64, 2))
            .unwrap_or(default)
    }
}

/// Units of one gift owned by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Owner
    pub user_id: UserId,
    /// Gift slug
    pub gift_slug: String,
    /// Units owned; rows at zero are deleted
    pub quantity: u64,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Side of a transfer a row describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Row owned by the sender
    Sent,
    /// Row owned by the receiver
    Received,
}

impl TransferDirection {
    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Sent => "sent",
            TransferDirection::Received => "received",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a gift transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftTransferRecord {
    /// Row id (UUIDv7)
    pub transfer_id: Uuid,
    /// Row owner
    pub user_id: UserId,
    /// The other party
    pub counterparty_id: UserId,
    /// Side of the transfer
    pub direction: TransferDirection,
    /// Gift slug
    pub gift_slug: String,
    /// Units moved
    pub quantity: u32,
    /// Sent value for the sender row, earnings for the receiver row
    pub coin_value: u64,
    /// Receiver earnings
    pub broadcaster_earnings: u64,
    /// Platform portion
    pub platform_portion: u64,
    /// Where the gift was sent (stream, battle, profile)
    pub context: Option<String>,
    /// Catalog tier
    pub tier: String,
    /// Catalog animation
    pub animation: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Revenue split of a sent gift.
///
/// `broadcaster_earnings + platform_portion == sent_value` always holds;
/// rounding goes to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSplit {
    /// coin_cost × quantity
    pub sent_value: u64,
    /// floor(sent_value × share)
    pub broadcaster_earnings: u64,
    /// sent_value − broadcaster_earnings
    pub platform_portion: u64,
}

impl RevenueSplit {
    /// Split `coin_cost × quantity` with the receiver getting `share`
    pub fn compute(coin_cost: u64, quantity: u32, share: Decimal) -> crate::Result<Self> {
        let sent_value = coin_cost.checked_mul(u64::from(quantity)).ok_or_else(|| {
            crate::Error::InvalidQuantity(format!(
                "{} × {} overflows the coin range",
                quantity, coin_cost
            ))
        })?;

        let share = share.clamp(Decimal::ZERO, Decimal::ONE);
        let broadcaster_earnings = Decimal::from(sent_value)
            .checked_mul(share)
            .map(|v| v.floor())
            .and_then(|v| v.to_u64())
            .ok_or_else(|| crate::Error::Other(format!("cannot split value {}", sent_value)))?
            .min(sent_value);

        Ok(Self {
            sent_value,
            broadcaster_earnings,
            platform_portion: sent_value - broadcaster_earnings,
        })
    }
}

/// Contracted-creator bonus on top of a receiver's earnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorBonus {
    /// Receiver earnings from the split
    pub base_amount: u64,
    /// floor(base_amount × bonus share)
    pub bonus_amount: u64,
    /// base_amount + bonus_amount
    pub total_amount: u64,
}

impl CreatorBonus {
    /// Bonus for `base_amount` earnings at `share`
    pub fn compute(base_amount: u64, share: Decimal) -> Self {
        let share = share.clamp(Decimal::ZERO, Decimal::ONE);
        let bonus_amount = Decimal::from(base_amount)
            .checked_mul(share)
            .and_then(|v| v.floor().to_u64())
            .unwrap_or(0);

        Self {
            base_amount,
            bonus_amount,
            total_amount: base_amount.saturating_add(bonus_amount),
        }
    }
}

/// Logged creator bonus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorBonusRecord {
    /// Row ID (UUIDv7)
    pub bonus_id: Uuid,
    /// Contracted creator who received the gift
    pub creator_id: UserId,
    /// Sender-side transfer row of the gift
    pub transfer_id: Uuid,
    /// Gift sender
    pub sender_id: UserId,
    /// Where the gift was sent
    pub context: Option<String>,
    /// Amounts
    #[serde(flatten)]
    pub bonus: CreatorBonus,
    /// Ledger row of the payout credit
    pub ledger_ref: Option<Uuid>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// What happened to the receiver's payout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutStatus {
    /// Earnings were zero
    NotRequired,
    /// Receiver was credited
    Credited {
        /// Coins the receiver actually got (after any loan repayment)
        credited: u64,
        /// Ledger row of the credit
        ledger_ref: Option<Uuid>,
    },
    /// Credit failed; the transfer stands and the payout is repaired operationally
    Pending {
        /// Failure reason
        reason: String,
    },
}

impl PayoutStatus {
    /// Whether the payout still needs attention
    pub fn is_pending(&self) -> bool {
        matches!(self, PayoutStatus::Pending { .. })
    }
}

/// Successful purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOutcome {
    /// Units owned after the purchase; `None` when the inventory write failed
    pub inventory_quantity: Option<u64>,
    /// Troll coin balance reported by the bank
    pub remaining_balance: Option<u64>,
    /// coin_cost × quantity
    pub total_cost: u64,
    /// Ledger row of the spend
    pub ledger_ref: Option<Uuid>,
}

/// Send-from-inventory request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Sender (inventory owner)
    pub sender_id: UserId,
    /// Receiver (broadcaster)
    pub receiver_id: UserId,
    /// Gift slug
    pub gift_slug: String,
    /// Units to send
    pub quantity: u32,
    /// Where the gift was sent
    pub context: Option<String>,
}

impl SendRequest {
    /// Send `quantity` units of `gift_slug`
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        gift_slug: impl Into<String>,
        quantity: u32,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            gift_slug: gift_slug.into(),
            quantity,
            context: None,
        }
    }

    /// Set context tag
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Sender-side transfer row id
    pub transfer_id: Uuid,
    /// Revenue split
    pub split: RevenueSplit,
    /// Units the sender still owns
    pub remaining_quantity: u64,
    /// Whether the transfer rows were written
    pub transfers_recorded: bool,
    /// Receiver payout
    pub payout: PayoutStatus,
    /// Bonus added to the payout when the receiver is a contracted creator
    pub creator_bonus: Option<CreatorBonus>,
}

impl SendOutcome {
    /// Receiver earnings
    pub fn broadcaster_earnings(&self) -> u64 {
        self.split.broadcaster_earnings
    }

    /// coin_cost × quantity
    pub fn total_value(&self) -> u64 {
        self.split.sent_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_share_constant() {
        assert_eq!(DEFAULT_BROADCASTER_SHARE, dec!(0.70));
    }

    #[test]
    fn test_split_twenty_five_by_four() {
        let split = RevenueSplit::compute(25, 4, dec!(0.70)).unwrap();
        assert_eq!(split.sent_value, 100);
        assert_eq!(split.broadcaster_earnings, 70);
        assert_eq!(split.platform_portion, 30);
    }

    #[test]
    fn test_split_rounds_toward_platform() {
        // 7 × 0.70 = 4.9
        let split = RevenueSplit::compute(7, 1, dec!(0.70)).unwrap();
        assert_eq!(split.broadcaster_earnings, 4);
        assert_eq!(split.platform_portion, 3);
    }

    #[test]
    fn test_split_overflow_rejected() {
        let result = RevenueSplit::compute(u64::MAX, 2, dec!(0.70));
        assert!(matches!(result, Err(crate::Error::InvalidQuantity(_))));
    }

    #[test]
    fn test_item_share_override() {
        let item = GiftCatalogItem::new("rose", "Rose", 1).broadcaster_share_percent(50);
        assert_eq!(item.broadcaster_share(dec!(0.70)), dec!(0.50));

        let plain = GiftCatalogItem::new("rose", "Rose", 1);
        assert_eq!(plain.broadcaster_share(dec!(0.70)), dec!(0.70));
    }

    #[test]
    fn test_creator_bonus_floors() {
        let bonus = CreatorBonus::compute(77, DEFAULT_CREATOR_BONUS_SHARE);
        assert_eq!(
            (bonus.base_amount, bonus.bonus_amount, bonus.total_amount),
            (77, 7, 84)
        );

        // Earnings below 10 coins earn no bonus
        assert_eq!(CreatorBonus::compute(9, dec!(0.10)).bonus_amount, 0);
    }
}
