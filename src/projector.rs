use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;

use susu_ledger_core::{Account, BalanceLine, BalanceSheet, Money, StorageBackend};

use crate::error::LedgerError;

/// Balances computed by replaying postings. Results depend only on the
/// committed postings and `as_of`.
pub struct BalanceProjector {
    storage: Arc<dyn StorageBackend>,
}

impl BalanceProjector {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn account_balance(&self, account: &Account, as_of: Option<OffsetDateTime>) -> Result<Money, LedgerError> {
        let balance: Decimal = self
            .storage
            .account_postings(&account.id, as_of)?
            .iter()
            .map(|p| account.signed(p.side, p.amount.amount()))
            .sum();
        Ok(Money::new(balance)?)
    }

    pub fn get_account_balance(&self, account_id: &str, as_of: Option<OffsetDateTime>) -> Result<Money, LedgerError> {
        let account = self.storage.get_account(account_id)?;
        self.account_balance(&account, as_of)
    }

    /// Sum over every account the member owns in the group.
    pub fn get_member_balance(&self, member_id: &str, group_id: &str, as_of: Option<OffsetDateTime>) -> Result<Money, LedgerError> {
        let mut total = Money::ZERO;
        for account in self.storage.list_accounts(group_id)? {
            if account.member_id.as_deref() == Some(member_id) {
                total += self.account_balance(&account, as_of)?;
            }
        }
        Ok(total)
    }

    pub fn balance_sheet(&self, group_id: &str, as_of: OffsetDateTime) -> Result<BalanceSheet, LedgerError> {
        let lines = self
            .storage
            .list_accounts(group_id)?
            .into_iter()
            .map(|account| {
                let balance = self.account_balance(&account, Some(as_of))?;
                Ok(BalanceLine {
                    account_id: account.id,
                    account_type: account.account_type,
                    member_id: account.member_id,
                    balance,
                })
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;

        Ok(BalanceSheet {
            group_id: Arc::from(group_id),
            as_of,
            lines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use susu_ledger_core::{AccountType, EventType, NewEvent, Posting, Side};
    use susu_ledger_memory::InMemoryStorage;
    use time::macros::datetime;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<InMemoryStorage>, BalanceProjector) {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create_group("g1", datetime!(2024-01-01 0:00 UTC)).unwrap();
        for account in [
            Account::new("g1", AccountType::Asset, None),
            Account::new("g1", AccountType::Equity, Some("alice")),
            Account::new("g1", AccountType::Equity, Some("bob")),
        ] {
            storage.create_account(&account).unwrap();
        }
        storage
            .append_events(
                "g1",
                &[
                    NewEvent::new(
                        EventType::Contribution,
                        datetime!(2024-01-10 0:00 UTC),
                        "Alice",
                        vec![Posting::debit("g1:asset", money("100.00")), Posting::credit("g1:equity:alice", money("100.00"))],
                    ),
                    NewEvent::new(
                        EventType::Contribution,
                        datetime!(2024-01-20 0:00 UTC),
                        "Bob",
                        vec![Posting::debit("g1:asset", money("40.00")), Posting::credit("g1:equity:bob", money("40.00"))],
                    ),
                    NewEvent::new(
                        EventType::Payout,
                        datetime!(2024-01-25 0:00 UTC),
                        "Alice payout",
                        vec![Posting::debit("g1:equity:alice", money("30.00")), Posting::credit("g1:asset", money("30.00"))],
                    ),
                ],
            )
            .unwrap();
        let projector = BalanceProjector::new(storage.clone());
        (storage, projector)
    }

    #[test]
    fn test_account_balance_as_of() {
        let (_, projector) = setup();
        assert_eq!(projector.get_account_balance("g1:asset", None).unwrap(), money("110.00"));
        assert_eq!(
            projector.get_account_balance("g1:asset", Some(datetime!(2024-01-20 0:00 UTC))).unwrap(),
            money("140.00")
        );
        assert_eq!(
            projector.get_account_balance("g1:asset", Some(datetime!(2024-01-01 0:00 UTC))).unwrap(),
            Money::ZERO
        );
    }

    #[test]
    fn test_member_balance() {
        let (_, projector) = setup();
        assert_eq!(projector.get_member_balance("alice", "g1", None).unwrap(), money("70.00"));
        assert_eq!(projector.get_member_balance("carol", "g1", None).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_balance_sheet_nets_to_zero() {
        let (storage, projector) = setup();
        let sheet = projector.balance_sheet("g1", datetime!(2024-12-31 0:00 UTC)).unwrap();
        assert!(sheet.is_balanced());
        assert_eq!(sheet.total(Side::Debit), money("110.00"));

        for line in &sheet.lines {
            assert_eq!(line.balance.amount(), storage.cached_balance(&line.account_id).unwrap());
        }
    }
}
