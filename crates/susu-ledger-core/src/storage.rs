use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{
    read::{EventQuery, PostingRecord},
    write::NewEvent,
    Account, EventId, GroupId, LedgerEvent, TaxReport,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient failure of the underlying store; the caller may retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("group already exists: {0}")]
    GroupAlreadyExists(String),
    #[error("group {0} has committed events and can only be archived")]
    GroupHasEvents(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("account already exists: {0}")]
    AccountAlreadyExists(String),
    #[error("event not found: {0}")]
    EventNotFound(EventId),
    #[error("tax report not found: {0}")]
    ReportNotFound(Uuid),
    #[error("tax report already finalized: {0}")]
    ReportAlreadyFinal(Uuid),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Durable home of the event log.
///
/// Implementations must make `append_events` all-or-nothing: either every
/// event and posting in the batch becomes visible to readers, or none does.
/// Sequence numbers are assigned per group, strictly increasing in append
/// order. Callers serialize appends per group; readers may run concurrently.
pub trait StorageBackend: Send + Sync {
    fn create_group(&self, group_id: &str, created_at: OffsetDateTime) -> Result<(), StorageError>;
    fn group_exists(&self, group_id: &str) -> Result<bool, StorageError>;
    fn list_groups(&self) -> Result<Vec<GroupId>, StorageError>;
    /// Removes an empty group. Fails with `GroupHasEvents` once anything was committed.
    fn delete_group(&self, group_id: &str) -> Result<(), StorageError>;

    fn create_account(&self, account: &Account) -> Result<(), StorageError>;
    fn get_account(&self, account_id: &str) -> Result<Account, StorageError>;
    fn list_accounts(&self, group_id: &str) -> Result<Vec<Account>, StorageError>;

    /// Appends a batch of already-validated events for one group.
    fn append_events(&self, group_id: &str, events: &[NewEvent]) -> Result<Vec<LedgerEvent>, StorageError>;
    fn get_event(&self, event_id: EventId) -> Result<LedgerEvent, StorageError>;
    /// Events of a group in ascending `(timestamp, sequence)` order.
    fn load_events(&self, group_id: &str, query: &EventQuery) -> Result<Vec<LedgerEvent>, StorageError>;
    /// Postings against one account, optionally up to and including `as_of`.
    fn account_postings(&self, account_id: &str, as_of: Option<OffsetDateTime>) -> Result<Vec<PostingRecord>, StorageError>;
    /// Running total maintained on append, signed by the account's normal side.
    fn cached_balance(&self, account_id: &str) -> Result<Decimal, StorageError>;

    fn insert_tax_report(&self, report: &TaxReport) -> Result<(), StorageError>;
    /// Reports for a member ordered by year then version.
    fn list_tax_reports(&self, member_id: &str, tax_year: Option<i32>) -> Result<Vec<TaxReport>, StorageError>;
    /// Moves a draft report to final. Fails with `ReportAlreadyFinal` when it
    /// was finalized before.
    fn finalize_tax_report(&self, report_id: Uuid, finalized_at: OffsetDateTime) -> Result<TaxReport, StorageError>;
}
