use std::{collections::BTreeMap, fmt::Display};

use prettytable::{row, Table};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{AccountId, AccountType, EventId, EventType, GroupId, LedgerEvent, MemberId, Side};
use crate::money::Money;

/// Selection applied when listing a group's events. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to_time: Option<OffsetDateTime>,
    pub event_type: Option<EventType>,
    pub member_id: Option<MemberId>,
}

impl EventFilter {
    pub fn matches_time(&self, timestamp: OffsetDateTime) -> bool {
        self.from_time.map_or(true, |from| timestamp >= from) && self.to_time.map_or(true, |to| timestamp <= to)
    }
}

/// Position in the `(timestamp, sequence)` ordering of a group's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventCursor {
    pub timestamp: OffsetDateTime,
    pub sequence: u64,
}

impl From<&LedgerEvent> for EventCursor {
    fn from(event: &LedgerEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            sequence: event.sequence,
        }
    }
}

/// One page of a keyset-paginated event listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub filter: EventFilter,
    pub after: Option<EventCursor>,
    pub limit: Option<usize>,
}

/// A single posting as seen from its account, used for balance replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingRecord {
    pub event_id: EventId,
    pub sequence: u64,
    pub timestamp: OffsetDateTime,
    pub side: Side,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceLine {
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub member_id: Option<MemberId>,
    pub balance: Money,
}

/// Balances of every account in a group, each signed by its normal side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub group_id: GroupId,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub lines: Vec<BalanceLine>,
}

impl BalanceSheet {
    pub fn balances(&self) -> BTreeMap<AccountId, Money> {
        self.lines.iter().map(|l| (l.account_id.clone(), l.balance)).collect()
    }

    pub fn total(&self, side: Side) -> Money {
        self.lines
            .iter()
            .filter(|l| l.account_type.normal_side() == side)
            .map(|l| l.balance)
            .sum()
    }

    /// Debit-normal balances equal credit-normal balances.
    pub fn is_balanced(&self) -> bool {
        self.total(Side::Debit) == self.total(Side::Credit)
    }
}

impl Display for BalanceSheet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Account", "Debit", "Credit"]);
        table.add_empty_row();

        for line in &self.lines {
            match line.account_type.normal_side() {
                Side::Debit => table.add_row(row![line.account_id, line.balance, ""]),
                Side::Credit => table.add_row(row![line.account_id, "", line.balance]),
            };
        }
        table.add_empty_row();
        table.add_row(row!["Total", self.total(Side::Debit), self.total(Side::Credit)]);

        write!(f, "\n{}\n", table)
    }
}
