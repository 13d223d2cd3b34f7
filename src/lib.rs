//! Double-entry ledger for rotating savings groups.
//!
//! Every movement of money is an immutable, balanced event. Balances, member
//! shares and tax buckets are projections of the event log and can be
//! rebuilt from it at any time.

pub mod api;
pub mod config;
pub mod error;
pub mod event_store;
pub mod interest;
pub mod ledger;
pub mod projections;
pub mod projector;
pub mod reconcile;
pub mod registry;
pub mod shares;
pub mod storage;
pub mod tax;
pub mod time_source;
pub mod validator;

pub use error::LedgerError;
pub use ledger::{Ledger, LedgerSettings};
pub use time_source::TimeSource;
