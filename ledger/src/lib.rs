//! Card Issuer Ledger
//!
//! Double-entry ledger for card accounts: derived balances, the
//! authorisation/presentment lifecycle and atomic storage backends.

pub mod account;
pub mod balance;
pub mod engine;
pub mod journal;
pub mod store;
pub mod transaction;

pub use account::{Account, SystemAccount};
pub use balance::{AccountBalance, BalanceCalculator};
pub use engine::LedgerEngine;
pub use journal::{Batch, EntryType, Journal};
pub use store::{LedgerStore, LedgerTx, MemoryLedgerStore, PgLedgerStore};
pub use transaction::{CardTransaction, NewAuthorisation, TransactionType};
