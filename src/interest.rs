use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use susu_ledger_core::{
    account_id_for, bankers_round, AccountType, AccrualPeriod, EventType, GroupId, LedgerEvent, MemberId, Money,
    NewEvent, Posting, RATIO_SCALE,
};

use crate::{error::LedgerError, event_store::EventStore, projections::ProjectionCache};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub member_id: MemberId,
    /// Balance-seconds held over the period.
    pub weight: Decimal,
    pub ratio: Decimal,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccrualOutcome {
    pub group_id: GroupId,
    pub period: AccrualPeriod,
    pub total: Money,
    pub allocations: Vec<Allocation>,
    pub events: Vec<LedgerEvent>,
}

/// Splits a group's interest across members by time-weighted balance and
/// posts one accrual per recipient.
pub struct InterestAllocator {
    event_store: Arc<EventStore>,
    projections: Arc<ProjectionCache>,
}

impl InterestAllocator {
    pub fn new(event_store: Arc<EventStore>, projections: Arc<ProjectionCache>) -> Self {
        Self {
            event_store,
            projections,
        }
    }

    /// Time-weighted exposure of every member with a positive weight over
    /// `period`, in ascending member-id order.
    pub fn weights(&self, group_id: &str, period: &AccrualPeriod) -> Vec<(MemberId, Decimal)> {
        self.projections
            .member_shares(group_id)
            .into_iter()
            .map(|share| {
                let weight = share.exposure(period.start, period.end);
                (share.member_id, weight)
            })
            .filter(|(_, weight)| *weight > Decimal::ZERO)
            .collect()
    }

    pub fn run(
        &self,
        group_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        total_interest: Money,
    ) -> Result<AccrualOutcome, LedgerError> {
        let period = AccrualPeriod::new(start, end)
            .ok_or_else(|| LedgerError::InvalidPeriod(format!("accrual start {} is not before end {}", start, end)))?;
        if !total_interest.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "total interest must be positive, got {}",
                total_interest
            )));
        }

        self.event_store.with_group_lock(group_id, || {
            self.projections.refresh()?;
            let weights = self.weights(group_id, &period);
            if weights.is_empty() {
                return Err(LedgerError::NoEligibleRecipients {
                    group: group_id.to_string(),
                    start,
                    end,
                });
            }

            let raw: Vec<Decimal> = weights.iter().map(|(_, w)| *w).collect();
            let amounts = total_interest.allocate(&raw)?;
            // allocate has already checked that the weights sum in range
            let total_weight: Decimal = raw.iter().sum();

            let allocations: Vec<Allocation> = weights
                .into_iter()
                .zip(amounts)
                .map(|((member_id, weight), amount)| Allocation {
                    member_id,
                    weight,
                    ratio: bankers_round(weight / total_weight, RATIO_SCALE),
                    amount,
                })
                .collect();

            let expense = account_id_for(group_id, AccountType::Expense, None);
            let events: Vec<NewEvent> = allocations
                .iter()
                .filter(|a| a.amount.is_positive())
                .map(|a| {
                    NewEvent::new(
                        EventType::InterestAccrual,
                        end,
                        format!("Interest accrual for {}", a.member_id),
                        vec![
                            Posting::debit(expense.clone(), a.amount),
                            Posting::credit(account_id_for(group_id, AccountType::Equity, Some(&a.member_id)), a.amount),
                        ],
                    )
                    .covering(period)
                })
                .collect();

            // Reported member-years are refused by the commit itself
            let committed = self.event_store.commit_locked(group_id, &events)?;
            tracing::info!(
                group_id,
                recipients = committed.len(),
                total = %total_interest,
                "Interest accrual committed"
            );

            Ok(AccrualOutcome {
                group_id: Arc::from(group_id),
                period,
                total: total_interest,
                allocations,
                events: committed,
            })
        })
    }
}
