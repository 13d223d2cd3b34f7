//! Core types and traits for susu-ledger storage backends.
//!
//! This crate provides the `Money` type, the ledger's domain models and the
//! `StorageBackend` trait, enabling pluggable storage implementations in
//! separate crates.

pub mod money;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use money::{bankers_round, Money, MoneyError, CURRENCY_SCALE, RATIO_SCALE};
pub use models::{
    account_id_for, Account, AccountId, AccountType, AccrualPeriod, EventId, EventType, GroupId,
    LedgerEvent, MemberId, Posting, ReportStatus, Side, TaxReport,
};
pub use models::read::{BalanceLine, BalanceSheet, EventCursor, EventFilter, EventQuery, PostingRecord};
pub use models::write::NewEvent;
pub use storage::{StorageBackend, StorageError};
