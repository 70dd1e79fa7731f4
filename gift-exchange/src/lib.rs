//! Troll City Gift Exchange
//!
//! Gift catalog, inventory and peer-to-peer gifting on top of the coin ledger.
//!
//! # Flow
//!
//! 1. **Purchase**: coins are spent through the ledger and units land in the
//!    buyer's inventory
//! 2. **Send**: units leave the sender's inventory, a sent/received transfer
//!    pair is written and the receiver is credited their share, plus a bonus
//!    when they hold a creator contract
//!
//! # Revenue split
//!
//! `broadcaster = floor(value × share)` and `platform = value − broadcaster`,
//! so the two always add up to the sent value and rounding favours the
//! platform. The default share is 70%.
//!
//! # Example
//!
//! ```no_run
//! use gift_exchange::{Config, GiftExchange, SendRequest};
//! use coin_ledger::{CoinLedger, Session, SimulatedBank, Sinks, TracingSink, UserId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> gift_exchange::Result<()> {
//!     let ledger = CoinLedger::in_memory(
//!         coin_ledger::Config::default(),
//!         Arc::new(SimulatedBank::new()),
//!         Sinks::all(Arc::new(TracingSink)),
//!     )
//!     .await?;
//!     let gifts = GiftExchange::from_ledger(Config::default(), &ledger)?;
//!
//!     let alice = UserId::new("alice");
//!     let session = Session::user(alice.clone());
//!     gifts.purchase(&session, &alice, "bridge_toll", 4).await?;
//!
//!     let sent = gifts
//!         .send_from_inventory(
//!             &session,
//!             SendRequest::new(alice, UserId::new("bob"), "bridge_toll", 4),
//!         )
//!         .await?;
//!     println!("bob earned {}", sent.broadcaster_earnings());
//!
//!     ledger.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod bonus;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod store;
pub mod types;

// Re-exports
pub use bonus::{BonusLog, ContractedCreators, CreatorDirectory};
pub use catalog::GiftCatalog;
pub use config::{Config, InventoryFailurePolicy};
pub use engine::GiftExchange;
pub use error::{Error, Result};
pub use store::{InventoryStore, MemoryGiftStore, RocksGiftStore, TransferStore};
pub use types::*;
