use thiserror::Error;
use uuid::Uuid;

use susu_ledger_core::{AccountId, EventId, Money, MoneyError, StorageError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("unbalanced event: debits {debits} != credits {credits}")]
    UnbalancedEvent { debits: Money, credits: Money },
    #[error("an event needs at least two postings, got {0}")]
    EmptyEvent(usize),
    #[error("account {account} belongs to group {account_group}, not {group}")]
    CrossGroupPosting {
        account: AccountId,
        account_group: String,
        group: String,
    },
    #[error("account already exists: {0}")]
    DuplicateAccount(String),
    #[error("no member held a balance in group {group} between {start} and {end}")]
    NoEligibleRecipients {
        group: String,
        start: time::OffsetDateTime,
        end: time::OffsetDateTime,
    },
    #[error("tax year {year} is not closed until {closes_at}")]
    PeriodNotClosed {
        year: i32,
        closes_at: time::OffsetDateTime,
    },
    #[error("tax year {year} was already reported for member {member}")]
    PeriodAlreadyReported { member: String, year: i32 },
    #[error("tax year {year} report for member {member} is final")]
    PeriodFinalized { member: String, year: i32 },
    #[error("tax report not found: {0}")]
    ReportNotFound(Uuid),
    #[error("tax report already finalized: {0}")]
    ReportAlreadyFinal(Uuid),
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
    #[error("insufficient funds in {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        available: Money,
        requested: Money,
    },
    #[error("reconciliation of group {group} found {discrepancies} discrepancies")]
    ReconciliationMismatch { group: String, discrepancies: usize },
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("group {0} has committed events and can only be archived")]
    GroupHasEvents(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("event not found: {0}")]
    EventNotFound(EventId),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl LedgerError {
    /// Short label used for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::UnbalancedEvent { .. } => "unbalanced_event",
            LedgerError::EmptyEvent(_) => "empty_event",
            LedgerError::CrossGroupPosting { .. } => "cross_group_posting",
            LedgerError::DuplicateAccount(_) => "duplicate_account",
            LedgerError::NoEligibleRecipients { .. } => "no_eligible_recipients",
            LedgerError::PeriodNotClosed { .. } => "period_not_closed",
            LedgerError::PeriodAlreadyReported { .. } => "period_already_reported",
            LedgerError::PeriodFinalized { .. } => "period_finalized",
            LedgerError::ReportNotFound(_) => "report_not_found",
            LedgerError::ReportAlreadyFinal(_) => "report_already_final",
            LedgerError::InvalidPeriod(_) => "invalid_period",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::ReconciliationMismatch { .. } => "reconciliation_mismatch",
            LedgerError::GroupNotFound(_) => "group_not_found",
            LedgerError::GroupHasEvents(_) => "group_has_events",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::EventNotFound(_) => "event_not_found",
            LedgerError::StorageUnavailable(_) => "storage_unavailable",
            LedgerError::Storage(_) => "storage",
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StorageUnavailable(_))
    }
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => LedgerError::StorageUnavailable(msg),
            StorageError::GroupNotFound(id) => LedgerError::GroupNotFound(id),
            StorageError::GroupHasEvents(id) => LedgerError::GroupHasEvents(id),
            StorageError::AccountNotFound(id) => LedgerError::AccountNotFound(id),
            StorageError::AccountAlreadyExists(id) => LedgerError::DuplicateAccount(id),
            StorageError::EventNotFound(id) => LedgerError::EventNotFound(id),
            StorageError::ReportNotFound(id) => LedgerError::ReportNotFound(id),
            StorageError::ReportAlreadyFinal(id) => LedgerError::ReportAlreadyFinal(id),
            other => LedgerError::Storage(other),
        }
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidAmount(e.to_string())
    }
}
