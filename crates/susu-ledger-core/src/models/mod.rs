use std::{fmt::Display, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::money::Money;

pub mod read;
pub mod write;

pub type GroupId = Arc<str>;
pub type MemberId = Arc<str>;
pub type AccountId = Arc<str>;
pub type EventId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Debit => "debit",
            Side::Credit => "credit",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Debit => Side::Credit,
            Side::Credit => Side::Debit,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(Side::Debit),
            "credit" => Ok(Side::Credit),
            _ => Err(format!("unknown posting side: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    /// The side on which a balance of this type increases.
    pub fn normal_side(&self) -> Side {
        match self {
            AccountType::Asset | AccountType::Expense => Side::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Revenue => Side::Credit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Equity => "equity",
            AccountType::Revenue => "revenue",
            AccountType::Expense => "expense",
        }
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset" => Ok(AccountType::Asset),
            "liability" => Ok(AccountType::Liability),
            "equity" => Ok(AccountType::Equity),
            "revenue" => Ok(AccountType::Revenue),
            "expense" => Ok(AccountType::Expense),
            _ => Err(format!("unknown account type: {}", s)),
        }
    }
}

impl Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Contribution,
    Payout,
    InterestAccrual,
    Correction,
    Fee,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Contribution => "contribution",
            EventType::Payout => "payout",
            EventType::InterestAccrual => "interest_accrual",
            EventType::Correction => "correction",
            EventType::Fee => "fee",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contribution" => Ok(EventType::Contribution),
            "payout" => Ok(EventType::Payout),
            "interest_accrual" => Ok(EventType::InterestAccrual),
            "correction" => Ok(EventType::Correction),
            "fee" => Ok(EventType::Fee),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the identifier of the account for a (group, type, member) triple.
///
/// The triple is unique per group, so the identifier is derived from it.
pub fn account_id_for(group_id: &str, account_type: AccountType, member_id: Option<&str>) -> AccountId {
    match member_id {
        Some(member) => Arc::from(format!("{}:{}:{}", group_id, account_type.as_str(), member)),
        None => Arc::from(format!("{}:{}", group_id, account_type.as_str())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub group_id: GroupId,
    pub account_type: AccountType,
    pub member_id: Option<MemberId>,
}

impl Account {
    pub fn new(group_id: &str, account_type: AccountType, member_id: Option<&str>) -> Self {
        Self {
            id: account_id_for(group_id, account_type, member_id),
            group_id: Arc::from(group_id),
            account_type,
            member_id: member_id.map(Arc::from),
        }
    }

    pub fn normal_side(&self) -> Side {
        self.account_type.normal_side()
    }

    /// Signs a posting amount against this account's normal balance side.
    pub fn signed(&self, side: Side, amount: Decimal) -> Decimal {
        if side == self.normal_side() {
            amount
        } else {
            -amount
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account_id: AccountId,
    pub side: Side,
    pub amount: Money,
}

impl Posting {
    pub fn debit(account_id: impl Into<AccountId>, amount: Money) -> Self {
        Self {
            account_id: account_id.into(),
            side: Side::Debit,
            amount,
        }
    }

    pub fn credit(account_id: impl Into<AccountId>, amount: Money) -> Self {
        Self {
            account_id: account_id.into(),
            side: Side::Credit,
            amount,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            account_id: self.account_id.clone(),
            side: self.side.opposite(),
            amount: self.amount,
        }
    }
}

/// The half-open window `[start, end)` an interest accrual covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl AccrualPeriod {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Whole seconds shared between this period and `[from, to)`.
    pub fn overlap_seconds(&self, from: OffsetDateTime, to: OffsetDateTime) -> i64 {
        let start = self.start.max(from);
        let end = self.end.min(to);
        if start >= end {
            0
        } else {
            (end - start).whole_seconds()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub group_id: GroupId,
    pub sequence: u64,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub description: Arc<str>,
    pub corrects: Option<EventId>,
    pub accrual: Option<AccrualPeriod>,
    pub postings: Vec<Posting>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl LedgerEvent {
    pub fn total(&self, side: Side) -> Money {
        self.postings
            .iter()
            .filter(|p| p.side == side)
            .map(|p| p.amount)
            .sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.total(Side::Debit) == self.total(Side::Credit)
    }

    pub fn touches(&self, account_id: &str) -> bool {
        self.postings.iter().any(|p| p.account_id.as_ref() == account_id)
    }
}

/// Lifecycle of a tax report. Drafts may be regenerated; a final report is
/// frozen and no further versions are produced for its member and year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,
    Final,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Draft => "draft",
            ReportStatus::Final => "final",
        }
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ReportStatus::Draft),
            "final" => Ok(ReportStatus::Final),
            _ => Err(format!("unknown report status: {}", s)),
        }
    }
}

/// An interest statement for one member and one calendar year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxReport {
    pub id: Uuid,
    pub member_id: MemberId,
    pub tax_year: i32,
    pub version: u32,
    pub total_interest: Money,
    pub total_contributions: Money,
    pub total_withdrawals: Money,
    pub event_ids: Vec<EventId>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub checksum: Arc<str>,
    pub supersedes: Option<Uuid>,
    pub status: ReportStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finalized_at: Option<OffsetDateTime>,
}
