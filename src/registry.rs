use std::sync::Arc;

use susu_ledger_core::{Account, AccountType, Side, StorageBackend, StorageError};

use crate::error::LedgerError;

/// Standard accounts every group carries, one per type.
pub const GROUP_CHART: [AccountType; 3] = [AccountType::Asset, AccountType::Expense, AccountType::Revenue];

/// The account type of a member's share in the pool.
pub const MEMBER_ACCOUNT_TYPE: AccountType = AccountType::Equity;

pub fn normal_balance_side(account_type: AccountType) -> Side {
    account_type.normal_side()
}

/// Chart of accounts per group.
pub struct AccountRegistry {
    storage: Arc<dyn StorageBackend>,
}

impl AccountRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn create_account(&self, group_id: &str, account_type: AccountType, member_id: Option<&str>) -> Result<Account, LedgerError> {
        let account = Account::new(group_id, account_type, member_id);
        self.storage.create_account(&account)?;
        tracing::info!(group_id, account_id = %account.id, account_type = %account_type, "Account created");
        Ok(account)
    }

    pub fn get_account(&self, account_id: &str) -> Result<Account, LedgerError> {
        Ok(self.storage.get_account(account_id)?)
    }

    pub fn list_accounts(&self, group_id: &str) -> Result<Vec<Account>, LedgerError> {
        Ok(self.storage.list_accounts(group_id)?)
    }

    pub fn seed_group_chart(&self, group_id: &str) -> Result<Vec<Account>, LedgerError> {
        GROUP_CHART
            .iter()
            .map(|account_type| self.create_account(group_id, *account_type, None))
            .collect()
    }

    /// The group-level account of a type from the standard chart.
    pub fn group_account(&self, group_id: &str, account_type: AccountType) -> Result<Account, LedgerError> {
        self.get_account(&Account::new(group_id, account_type, None).id)
    }

    /// The member's equity account, which must already exist.
    pub fn member_account(&self, group_id: &str, member_id: &str) -> Result<Account, LedgerError> {
        self.get_account(&Account::new(group_id, MEMBER_ACCOUNT_TYPE, Some(member_id)).id)
    }

    /// Returns the member's equity account, creating it on first use.
    pub fn ensure_member_account(&self, group_id: &str, member_id: &str) -> Result<Account, LedgerError> {
        let account = Account::new(group_id, MEMBER_ACCOUNT_TYPE, Some(member_id));
        match self.storage.create_account(&account) {
            Ok(()) => {
                tracing::info!(group_id, member_id, account_id = %account.id, "Member account opened");
                Ok(account)
            }
            Err(StorageError::AccountAlreadyExists(_)) => Ok(account),
            Err(e) => Err(e.into()),
        }
    }
}
