use rust_decimal::Decimal;
use time::OffsetDateTime;

use susu_ledger_core::{GroupId, MemberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareEntry {
    pub timestamp: OffsetDateTime,
    pub sequence: u64,
    pub delta: Decimal,
}

/// A member's contribution timeline within one group.
///
/// Entries stay sorted by `(timestamp, sequence)` even when events arrive
/// back-dated, so exposure over any interval can be integrated directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberShare {
    pub group_id: GroupId,
    pub member_id: MemberId,
    entries: Vec<ShareEntry>,
}

impl MemberShare {
    pub fn new(group_id: GroupId, member_id: MemberId) -> Self {
        Self {
            group_id,
            member_id,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[ShareEntry] {
        &self.entries
    }

    pub fn record(&mut self, timestamp: OffsetDateTime, sequence: u64, delta: Decimal) {
        let key = (timestamp, sequence);
        let at = self.entries.partition_point(|e| (e.timestamp, e.sequence) <= key);
        self.entries.insert(at, ShareEntry { timestamp, sequence, delta });
    }

    /// Net contributed balance including every entry at or before `as_of`.
    pub fn balance_at(&self, as_of: OffsetDateTime) -> Decimal {
        self.entries
            .iter()
            .take_while(|e| e.timestamp <= as_of)
            .map(|e| e.delta)
            .sum()
    }

    /// Time integral of the held balance over `[start, end)`, in
    /// balance-seconds. Negative balances contribute nothing.
    pub fn exposure(&self, start: OffsetDateTime, end: OffsetDateTime) -> Decimal {
        if start >= end {
            return Decimal::ZERO;
        }

        let mut balance = self.balance_at(start);
        let mut cursor = start;
        let mut weight = Decimal::ZERO;

        for entry in self.entries.iter().skip_while(|e| e.timestamp <= start) {
            if entry.timestamp >= end {
                break;
            }
            weight += held(balance, cursor, entry.timestamp);
            balance += entry.delta;
            cursor = entry.timestamp;
        }
        weight + held(balance, cursor, end)
    }
}

fn held(balance: Decimal, from: OffsetDateTime, to: OffsetDateTime) -> Decimal {
    if balance <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    balance * Decimal::from((to - from).whole_seconds())
}
