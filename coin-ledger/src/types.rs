//! Core types for the coin ledger
//!
//! All types are designed for:
//! - Stable JSON row encoding (ledger rows outlive code versions)
//! - Integer arithmetic in the smallest coin unit
//! - Explicit identity (no hidden "current user" globals)

use crate::metadata::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// User identifier (profile id issued by the auth provider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Family (clan) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FamilyId(String);

impl FamilyId {
    /// Create new family ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bank sub-ledger that a credit lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Coins bought with real money
    Paid,
    /// Free / promotional coins (rewards, grants, wins)
    Promo,
    /// Coins received as gift revenue
    Gifted,
}

impl Bucket {
    /// Wire name used by the bank
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Paid => "paid",
            Bucket::Promo => "promo",
            Bucket::Gifted => "gifted",
        }
    }

    /// Resolve the credit bucket for a raw source tag.
    ///
    /// Unknown tags land in `Promo` so that nothing is ever dropped.
    pub fn for_source_tag(tag: &str) -> Self {
        TransactionType::parse_tag(tag)
            .map(|t| t.credit_bucket())
            .unwrap_or(Bucket::Promo)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coin type a mutation is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinType {
    /// Fungible troll coins (sum of paid, promo and gifted buckets)
    #[default]
    TrollCoins,
    /// Non-fungible free coins, only reachable through legacy per-type RPCs
    Trollmonds,
}

impl CoinType {
    /// Tag written to the ledger `coin_type` column
    pub fn tag(&self) -> &'static str {
        match self {
            CoinType::TrollCoins => "troll_coins",
            CoinType::Trollmonds => "trollmonds",
        }
    }

    /// Tag accepted by ledger schemas that predate the troll coin rename
    pub fn legacy_tag(&self) -> &'static str {
        match self {
            CoinType::TrollCoins => "paid",
            CoinType::Trollmonds => "free",
        }
    }

    /// Parse either the current or the legacy tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "troll_coins" | "paid" => Some(CoinType::TrollCoins),
            "trollmonds" | "free" => Some(CoinType::Trollmonds),
            _ => None,
        }
    }

    /// Whether this is the fungible type the bank's secure RPCs operate on
    pub fn is_fungible(&self) -> bool {
        matches!(self, CoinType::TrollCoins)
    }
}

impl fmt::Display for CoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Buying coins or items
    Purchase,
    /// Sending a gift
    GiftSent,
    /// Receiving gift revenue
    GiftReceived,
    /// Broadcaster cashing out
    Cashout,
    /// Admin manually granting coins
    AdminGrant,
    /// Admin manually removing coins
    AdminDeduct,
    /// Buying insurance
    InsurancePurchase,
    /// Buying an entrance effect
    EntranceEffect,
    /// Buying a perk
    PerkPurchase,
    /// Refunding a purchase
    Refund,
    /// System reward (daily login, achievement)
    Reward,
    /// Lucky gift payout
    LuckyGiftWin,
    /// Troll Town property purchase
    TrollTownPurchase,
    /// Troll Town property sale
    TrollTownSale,
    /// Troll Town property upgrade
    TrollTownUpgrade,
}

impl TransactionType {
    /// Every defined transaction type
    pub const ALL: [TransactionType; 15] = [
        TransactionType::Purchase,
        TransactionType::GiftSent,
        TransactionType::GiftReceived,
        TransactionType::Cashout,
        TransactionType::AdminGrant,
        TransactionType::AdminDeduct,
        TransactionType::InsurancePurchase,
        TransactionType::EntranceEffect,
        TransactionType::PerkPurchase,
        TransactionType::Refund,
        TransactionType::Reward,
        TransactionType::LuckyGiftWin,
        TransactionType::TrollTownPurchase,
        TransactionType::TrollTownSale,
        TransactionType::TrollTownUpgrade,
    ];

    /// Wire name, also used as the bank "source" tag
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::GiftSent => "gift_sent",
            TransactionType::GiftReceived => "gift_received",
            TransactionType::Cashout => "cashout",
            TransactionType::AdminGrant => "admin_grant",
            TransactionType::AdminDeduct => "admin_deduct",
            TransactionType::InsurancePurchase => "insurance_purchase",
            TransactionType::EntranceEffect => "entrance_effect",
            TransactionType::PerkPurchase => "perk_purchase",
            TransactionType::Refund => "refund",
            TransactionType::Reward => "reward",
            TransactionType::LuckyGiftWin => "lucky_gift_win",
            TransactionType::TrollTownPurchase => "troll_town_purchase",
            TransactionType::TrollTownSale => "troll_town_sale",
            TransactionType::TrollTownUpgrade => "troll_town_upgrade",
        }
    }

    /// Look up a type by its wire tag
    pub fn parse_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Bucket a credit of this type lands in
    pub fn credit_bucket(&self) -> Bucket {
        match self {
            TransactionType::Purchase | TransactionType::Refund => Bucket::Paid,
            TransactionType::GiftReceived => Bucket::Gifted,
            TransactionType::Reward
            | TransactionType::AdminGrant
            | TransactionType::LuckyGiftWin => Bucket::Promo,
            // Everything else is promo so unmapped sources never vanish
            _ => Bucket::Promo,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user balance as tracked by the bank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinBalance {
    /// Purchased coins
    pub paid: u64,
    /// Free / promotional coins
    pub promo: u64,
    /// Gift revenue
    pub gifted: u64,
    /// Non-fungible free coins
    pub trollmonds: u64,
}

impl CoinBalance {
    /// Fungible troll coin total
    pub fn troll_coins(&self) -> u64 {
        self.paid + self.promo + self.gifted
    }

    /// Balance visible for a coin type
    pub fn of(&self, coin_type: CoinType) -> u64 {
        match coin_type {
            CoinType::TrollCoins => self.troll_coins(),
            CoinType::Trollmonds => self.trollmonds,
        }
    }

    /// Add to a bucket
    pub fn credit(&mut self, bucket: Bucket, amount: u64) {
        match bucket {
            Bucket::Paid => self.paid += amount,
            Bucket::Promo => self.promo += amount,
            Bucket::Gifted => self.gifted += amount,
        }
    }

    /// Remove `amount` from the fungible total, draining promo, then gifted,
    /// then paid. Leaves the balance untouched when it cannot cover the amount.
    pub fn debit_fungible(&mut self, amount: u64) -> bool {
        if self.troll_coins() < amount {
            return false;
        }

        let mut remaining = amount;
        for bucket in [&mut self.promo, &mut self.gifted, &mut self.paid] {
            let take = remaining.min(*bucket);
            *bucket -= take;
            remaining -= take;
        }

        true
    }
}

/// Acting identity for a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: Option<UserId>,
    service_role: bool,
}

impl Session {
    /// Session of an authenticated end user
    pub fn user(id: UserId) -> Self {
        Self {
            user_id: Some(id),
            service_role: false,
        }
    }

    /// Service-role session, allowed to act for any user
    pub fn service() -> Self {
        Self {
            user_id: None,
            service_role: true,
        }
    }

    /// Session without a resolvable identity
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            service_role: false,
        }
    }

    /// Authenticated user, if any
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Whether the session carries the service-role override
    pub fn is_service(&self) -> bool {
        self.service_role
    }

    /// Whether any identity can be resolved
    pub fn is_authenticated(&self) -> bool {
        self.service_role || self.user_id.is_some()
    }

    /// Whether `user` is the session's own user
    pub fn is_user(&self, user: &UserId) -> bool {
        self.user_id.as_ref() == Some(user)
    }
}

/// Immutable audit row describing one balance-affecting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Owning user
    pub user_id: UserId,

    /// User id the caller supplied, when it differed from the session user
    #[serde(default)]
    pub claimed_user_id: Option<UserId>,

    /// Signed amount (credit positive, debit negative)
    pub amount: i64,

    /// Transaction type
    pub transaction_type: TransactionType,

    /// Coin type tag as written (`troll_coins`, or legacy `paid`/`free`)
    pub coin_type: String,

    /// Bank bucket, when known
    #[serde(default)]
    pub bucket: Option<Bucket>,

    /// Source reference (order id, gift transfer id, ...)
    #[serde(default)]
    pub source_ref: Option<String>,

    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,

    /// Structured metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Resulting balance reported by the bank
    #[serde(default)]
    pub balance_after: Option<i64>,

    /// Platform profit (financial reporting)
    #[serde(default)]
    pub platform_profit: Option<i64>,

    /// Outstanding liability towards the user (financial reporting)
    #[serde(default)]
    pub liability: Option<i64>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Parsed coin type
    pub fn coin_type(&self) -> Option<CoinType> {
        CoinType::from_tag(&self.coin_type)
    }

    /// Whether the entry was written with a legacy coin type tag
    pub fn uses_legacy_tag(&self) -> bool {
        matches!(self.coin_type.as_str(), "paid" | "free")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_bucket_mapping() {
        assert_eq!(TransactionType::Purchase.credit_bucket(), Bucket::Paid);
        assert_eq!(TransactionType::GiftReceived.credit_bucket(), Bucket::Gifted);
        assert_eq!(TransactionType::AdminGrant.credit_bucket(), Bucket::Promo);
        assert_eq!(TransactionType::Reward.credit_bucket(), Bucket::Promo);
        assert_eq!(TransactionType::LuckyGiftWin.credit_bucket(), Bucket::Promo);
        assert_eq!(TransactionType::TrollTownSale.credit_bucket(), Bucket::Promo);
    }

    #[test]
    fn test_unknown_source_tag_defaults_to_promo() {
        assert_eq!(Bucket::for_source_tag("wheel_prize"), Bucket::Promo);
        assert_eq!(Bucket::for_source_tag(""), Bucket::Promo);
        assert_eq!(Bucket::for_source_tag("gift_received"), Bucket::Gifted);
    }

    #[test]
    fn test_transaction_type_round_trip_names() {
        for t in TransactionType::ALL {
            assert_eq!(TransactionType::parse_tag(t.as_str()), Some(t));
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert_eq!(TransactionType::parse_tag("wheel_spin"), None);
    }

    #[test]
    fn test_coin_type_tags() {
        assert_eq!(CoinType::from_tag("paid"), Some(CoinType::TrollCoins));
        assert_eq!(CoinType::from_tag("free"), Some(CoinType::Trollmonds));
        assert_eq!(CoinType::from_tag("troll_coins"), Some(CoinType::TrollCoins));
        assert_eq!(CoinType::from_tag("gold"), None);
        assert!(CoinType::TrollCoins.is_fungible());
        assert!(!CoinType::Trollmonds.is_fungible());
    }

    #[test]
    fn test_debit_fungible_drains_promo_first() {
        let mut balance = CoinBalance {
            paid: 100,
            promo: 30,
            gifted: 20,
            trollmonds: 5,
        };

        assert!(balance.debit_fungible(60));
        assert_eq!(balance.promo, 0);
        assert_eq!(balance.gifted, 0);
        assert_eq!(balance.paid, 90);
        assert_eq!(balance.trollmonds, 5);

        assert!(!balance.debit_fungible(91));
        assert_eq!(balance.troll_coins(), 90);
    }

    #[test]
    fn test_session_identity() {
        let alice = UserId::new("alice");
        let session = Session::user(alice.clone());
        assert!(session.is_authenticated());
        assert!(session.is_user(&alice));
        assert!(!session.is_service());

        assert!(!Session::anonymous().is_authenticated());
        assert!(Session::service().is_authenticated());
    }
}
