//! Ledger recorder
//!
//! Appends one immutable [`LedgerEntry`] per balance-affecting event and
//! serves the per-user transaction history.
//!
//! Write rules:
//! - a session must resolve to an identity; a user session may only write
//!   rows it owns, a service session may write for anyone
//! - zero amounts are rejected
//! - metadata is sanitised so its shape can never fail the write
//! - a `coin_type` constraint violation is retried once with the legacy tag

use crate::{
    metadata::Metadata,
    metrics::Metrics,
    outbox::{OutboxRecord, SideEffect},
    store::LedgerStore,
    types::{Bucket, CoinType, LedgerEntry, Session, TransactionType, UserId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default page size for history queries
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Row to record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequest {
    /// User the row is claimed for
    pub user_id: UserId,
    /// Signed amount
    pub amount: i64,
    /// Transaction type
    pub transaction_type: TransactionType,
    /// Coin type
    pub coin_type: CoinType,
    /// Bank bucket
    pub bucket: Option<Bucket>,
    /// Source reference
    pub source_ref: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Metadata
    pub metadata: Metadata,
    /// Balance reported by the bank
    pub balance_after: Option<i64>,
    /// Platform profit
    pub platform_profit: Option<i64>,
    /// Liability
    pub liability: Option<i64>,
}

impl RecordRequest {
    /// New request for fungible coins
    pub fn new(user_id: UserId, amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            user_id,
            amount,
            transaction_type,
            coin_type: CoinType::TrollCoins,
            bucket: None,
            source_ref: None,
            description: None,
            metadata: Metadata::new(),
            balance_after: None,
            platform_profit: None,
            liability: None,
        }
    }

    /// Set coin type
    pub fn coin_type(mut self, coin_type: CoinType) -> Self {
        self.coin_type = coin_type;
        self
    }

    /// Set bucket
    pub fn bucket(mut self, bucket: Bucket) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Set source reference
    pub fn source_ref(mut self, source_ref: Option<String>) -> Self {
        self.source_ref = source_ref;
        self
    }

    /// Set description
    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Set metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set resulting balance
    pub fn balance_after(mut self, balance: Option<u64>) -> Self {
        self.balance_after = balance.and_then(|b| i64::try_from(b).ok());
        self
    }

    /// Set financial reporting fields
    pub fn financials(mut self, platform_profit: Option<i64>, liability: Option<i64>) -> Self {
        self.platform_profit = platform_profit;
        self.liability = liability;
        self
    }
}

/// History filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only this transaction type
    pub transaction_type: Option<TransactionType>,
    /// Created at or after
    pub since: Option<DateTime<Utc>>,
    /// Created at or before
    pub until: Option<DateTime<Utc>>,
    /// Page size
    pub limit: usize,
    /// Rows skipped
    pub offset: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            transaction_type: None,
            since: None,
            until: None,
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
        }
    }
}

impl HistoryQuery {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        self.transaction_type
            .map_or(true, |t| entry.transaction_type == t)
            && self.since.map_or(true, |since| entry.created_at >= since)
            && self.until.map_or(true, |until| entry.created_at <= until)
    }
}

/// Append-only ledger writer
pub struct LedgerRecorder {
    store: Arc<dyn LedgerStore>,
    metrics: Metrics,
}

impl std::fmt::Debug for LedgerRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerRecorder").finish_non_exhaustive()
    }
}

impl LedgerRecorder {
    /// Create recorder over a store
    pub fn new(store: Arc<dyn LedgerStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Record one entry
    pub fn record(&self, session: &Session, request: RecordRequest) -> Result<LedgerEntry> {
        self.record_with_effects(session, request, &[])
    }

    /// Record one entry together with the side effects it triggers.
    ///
    /// The effects are enqueued in the same storage write as the entry.
    pub fn record_with_effects(
        &self,
        session: &Session,
        request: RecordRequest,
        effects: &[SideEffect],
    ) -> Result<LedgerEntry> {
        let (owner, claimed) = resolve_owner(session, &request.user_id)?;

        if request.amount == 0 {
            return Err(Error::InvalidAmount("ledger amount must be non-zero".to_string()));
        }

        let mut entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            user_id: owner,
            claimed_user_id: claimed,
            amount: request.amount,
            transaction_type: request.transaction_type,
            coin_type: request.coin_type.tag().to_string(),
            bucket: request.bucket,
            source_ref: request.source_ref,
            description: request.description,
            metadata: request.metadata.sanitized(),
            balance_after: request.balance_after,
            platform_profit: request.platform_profit,
            liability: request.liability,
            created_at: Utc::now(),
        };

        let records: Vec<OutboxRecord> = effects
            .iter()
            .cloned()
            .map(|effect| OutboxRecord::pending(effect, Some(entry.entry_id)))
            .collect();

        match self.store.append(&entry, &records) {
            Ok(()) => {}
            Err(Error::ConstraintViolation { column, detail }) if column == "coin_type" => {
                let legacy = request.coin_type.legacy_tag();
                debug!(
                    entry_id = %entry.entry_id,
                    rejected = %entry.coin_type,
                    legacy,
                    %detail,
                    "Retrying ledger write with legacy coin type tag"
                );
                entry.coin_type = legacy.to_string();
                self.store.append(&entry, &records)?;
            }
            Err(e) => return Err(e),
        }

        self.metrics.record_entry();
        info!(
            entry_id = %entry.entry_id,
            user_id = %entry.user_id,
            amount = entry.amount,
            transaction_type = %entry.transaction_type,
            "Ledger entry recorded"
        );

        Ok(entry)
    }

    /// Entry by id
    pub fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.store.entry(entry_id)
    }

    /// A user's transactions, newest first
    pub fn history(&self, user_id: &UserId, query: &HistoryQuery) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .store
            .entries_for_user(user_id)?
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();

        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.entry_id.cmp(&a.entry_id))
        });

        Ok(entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

/// Decide who owns a row.
///
/// Returns the owner and, when a user session claimed someone else, the
/// claimed id.
fn resolve_owner(session: &Session, claimed: &UserId) -> Result<(UserId, Option<UserId>)> {
    if session.is_service() {
        return Ok((claimed.clone(), None));
    }

    let actor = session.user_id().ok_or(Error::Unauthenticated)?;
    if actor == claimed {
        return Ok((actor.clone(), None));
    }

    warn!(
        session_user = %actor,
        claimed_user = %claimed,
        "Ledger write claimed a different user; recording under session identity"
    );
    Ok((actor.clone(), Some(claimed.clone())))
}
