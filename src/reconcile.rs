use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use prettytable::{row, Table};
use serde::Serialize;
use time::OffsetDateTime;

use susu_ledger_core::{
    AccountId, AccountType, EventCursor, EventId, EventQuery, GroupId, Money, Side, StorageBackend,
};

use crate::{error::LedgerError, projector::BalanceProjector};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub account_id: AccountId,
    pub expected: Money,
    pub actual: Money,
}

impl Discrepancy {
    /// `expected - actual`.
    pub fn difference(&self) -> Money {
        self.expected - self.actual
    }
}

/// Pool cash against what the group owes its members. Cash must equal the
/// members' equity plus the group's own net income (fees less interest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolCheck {
    pub pool_cash: Money,
    pub member_equity: Money,
    pub net_income: Money,
    pub difference: Money,
}

impl PoolCheck {
    fn new(pool_cash: Money, member_equity: Money, net_income: Money) -> Self {
        Self {
            pool_cash,
            member_equity,
            net_income,
            difference: pool_cash - member_equity - net_income,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.difference.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub group_id: GroupId,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub events_checked: usize,
    pub unbalanced_events: Vec<EventId>,
    pub discrepancies: Vec<Discrepancy>,
    pub total_debits: Money,
    pub total_credits: Money,
    pub pool: PoolCheck,
    pub matched: bool,
}

impl ReconciliationReport {
    /// Turns a report with findings into `ReconciliationMismatch`.
    pub fn into_result(self) -> Result<Self, LedgerError> {
        if self.matched {
            Ok(self)
        } else {
            Err(LedgerError::ReconciliationMismatch {
                group: self.group_id.to_string(),
                discrepancies: self.discrepancies.len()
                    + self.unbalanced_events.len()
                    + usize::from(!self.pool.is_balanced()),
            })
        }
    }
}

impl Display for ReconciliationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Account", "Expected", "Actual", "Difference"]);
        table.add_empty_row();
        for d in &self.discrepancies {
            table.add_row(row![d.account_id, d.expected, d.actual, d.difference()]);
        }
        for id in &self.unbalanced_events {
            table.add_row(row![format!("event {}", id), "balanced", "unbalanced", ""]);
        }
        table.add_empty_row();
        table.add_row(row!["Debits", self.total_debits, "Credits", self.total_credits]);
        table.add_row(row!["Pool cash", self.pool.pool_cash, "Owed", self.pool.member_equity + self.pool.net_income]);

        write!(f, "\nGroup {} matched: {}\n{}\n", self.group_id, self.matched, table)
    }
}

/// Audits a group's books. Findings are reported, never corrected.
pub struct ReconciliationService {
    storage: Arc<dyn StorageBackend>,
    projector: Arc<BalanceProjector>,
    page_size: usize,
}

impl ReconciliationService {
    pub fn new(storage: Arc<dyn StorageBackend>, projector: Arc<BalanceProjector>, page_size: usize) -> Self {
        Self {
            storage,
            projector,
            page_size: page_size.max(1),
        }
    }

    /// Replays every account and compares with the running totals kept on
    /// append, checks that debit-normal and credit-normal balances agree and
    /// re-verifies the balance of every stored event. Pool cash is checked
    /// against member equity plus the group's net income.
    pub fn reconcile(&self, group_id: &str, checked_at: OffsetDateTime) -> Result<ReconciliationReport, LedgerError> {
        let report = self.audit(group_id, checked_at)?;
        self.finish(report)
    }

    fn audit(&self, group_id: &str, checked_at: OffsetDateTime) -> Result<ReconciliationReport, LedgerError> {
        let mut discrepancies = Vec::new();
        let mut total_debits = Money::ZERO;
        let mut total_credits = Money::ZERO;
        let (mut pool_cash, mut member_equity, mut net_income) = (Money::ZERO, Money::ZERO, Money::ZERO);

        for account in self.storage.list_accounts(group_id)? {
            let replayed = self.projector.account_balance(&account, None)?;
            let cached = self.storage.cached_balance(&account.id)?;
            if replayed.amount() != cached {
                discrepancies.push(Discrepancy {
                    account_id: account.id.clone(),
                    expected: replayed,
                    actual: Money::rounded(cached),
                });
            }
            match account.normal_side() {
                Side::Debit => total_debits += replayed,
                Side::Credit => total_credits += replayed,
            }
            match (account.account_type, &account.member_id) {
                (AccountType::Asset, None) => pool_cash += replayed,
                (AccountType::Equity, Some(_)) => member_equity += replayed,
                (AccountType::Revenue, None) => net_income += replayed,
                (AccountType::Expense, None) => net_income -= replayed,
                _ => {}
            }
        }
        let pool = PoolCheck::new(pool_cash, member_equity, net_income);

        let (events_checked, unbalanced_events) = self.verify_events(group_id)?;
        let matched = discrepancies.is_empty()
            && unbalanced_events.is_empty()
            && total_debits == total_credits
            && pool.is_balanced();

        Ok(ReconciliationReport {
            group_id: Arc::from(group_id),
            checked_at,
            events_checked,
            unbalanced_events,
            discrepancies,
            total_debits,
            total_credits,
            pool,
            matched,
        })
    }

    /// Compares replayed balances with externally supplied totals, such as a
    /// physical cash count.
    pub fn reconcile_against(
        &self,
        group_id: &str,
        external: &BTreeMap<AccountId, Money>,
        checked_at: OffsetDateTime,
    ) -> Result<ReconciliationReport, LedgerError> {
        let mut report = self.audit(group_id, checked_at)?;

        for (account_id, expected) in external {
            let account = self.storage.get_account(account_id)?;
            if account.group_id.as_ref() != group_id {
                return Err(LedgerError::CrossGroupPosting {
                    account: account.id,
                    account_group: account.group_id.to_string(),
                    group: group_id.to_string(),
                });
            }
            let actual = self.projector.account_balance(&account, None)?;
            if actual != *expected {
                report.discrepancies.push(Discrepancy {
                    account_id: account.id,
                    expected: *expected,
                    actual,
                });
            }
        }

        report.matched = report.matched && report.discrepancies.is_empty();
        self.finish(report)
    }

    fn verify_events(&self, group_id: &str) -> Result<(usize, Vec<EventId>), LedgerError> {
        let mut checked = 0;
        let mut unbalanced = Vec::new();
        let mut after: Option<EventCursor> = None;

        loop {
            let page = self.storage.load_events(
                group_id,
                &EventQuery {
                    after,
                    limit: Some(self.page_size),
                    ..EventQuery::default()
                },
            )?;
            checked += page.len();
            unbalanced.extend(page.iter().filter(|e| !e.is_balanced() || e.postings.len() < 2).map(|e| e.id));
            if page.len() < self.page_size {
                break;
            }
            after = page.last().map(EventCursor::from);
        }
        Ok((checked, unbalanced))
    }

    fn finish(&self, report: ReconciliationReport) -> Result<ReconciliationReport, LedgerError> {
        if report.matched {
            tracing::info!(group_id = %report.group_id, events = report.events_checked, "Reconciliation matched");
        } else {
            metrics::counter!("ledger_reconciliation_discrepancies_total", report.discrepancies.len() as u64);
            for d in &report.discrepancies {
                tracing::warn!(
                    group_id = %report.group_id,
                    account_id = %d.account_id,
                    expected = %d.expected,
                    actual = %d.actual,
                    "Reconciliation discrepancy"
                );
            }
            for id in &report.unbalanced_events {
                tracing::warn!(group_id = %report.group_id, event_id = %id, "Unbalanced event in store");
            }
            if !report.pool.is_balanced() {
                tracing::warn!(
                    group_id = %report.group_id,
                    pool_cash = %report.pool.pool_cash,
                    member_equity = %report.pool.member_equity,
                    difference = %report.pool.difference,
                    "Pool cash differs from member totals"
                );
            }
        }
        Ok(report)
    }
}
