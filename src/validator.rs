use susu_ledger_core::{Account, Money, Posting, Side};

use crate::error::LedgerError;

/// Checks a proposed set of postings before anything is written.
///
/// Order of checks: posting count, amounts, account membership, balance.
pub struct PostingValidator;

impl PostingValidator {
    pub fn validate<F>(group_id: &str, postings: &[Posting], mut resolve: F) -> Result<(), LedgerError>
    where
        F: FnMut(&str) -> Result<Account, LedgerError>,
    {
        if postings.len() < 2 {
            return Err(LedgerError::EmptyEvent(postings.len()));
        }

        for posting in postings {
            if !posting.amount.is_positive() {
                return Err(LedgerError::InvalidAmount(format!(
                    "posting to {} must be strictly positive, got {}",
                    posting.account_id, posting.amount
                )));
            }
        }

        for posting in postings {
            let account = resolve(&posting.account_id)?;
            if account.group_id.as_ref() != group_id {
                return Err(LedgerError::CrossGroupPosting {
                    account: account.id,
                    account_group: account.group_id.to_string(),
                    group: group_id.to_string(),
                });
            }
        }

        let debits = total(postings, Side::Debit)?;
        let credits = total(postings, Side::Credit)?;
        if debits != credits {
            return Err(LedgerError::UnbalancedEvent { debits, credits });
        }

        Ok(())
    }
}

fn total(postings: &[Posting], side: Side) -> Result<Money, LedgerError> {
    postings
        .iter()
        .filter(|p| p.side == side)
        .try_fold(Money::ZERO, |acc, p| acc.checked_add(p.amount))
        .map_err(LedgerError::from)
}
