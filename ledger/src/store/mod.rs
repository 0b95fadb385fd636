//! Ledger storage.
//!
//! Every ledger mutation happens inside a [`LedgerTx`]: a unit of work that is
//! either committed as a whole or, when dropped without [`LedgerTx::commit`],
//! rolled back as a whole. Backends are interchangeable:
//!
//! - [`MemoryLedgerStore`]: serializes transactions behind one async mutex,
//!   undoing uncommitted changes on drop.
//! - [`PgLedgerStore`]: one PostgreSQL transaction per unit of work, with row
//!   locks (`SELECT ... FOR UPDATE`) guarding balance checks.

use async_trait::async_trait;
use cards_common::{AccountId, BatchId, CardId, Currency, Result, TransactionId};

use crate::account::Account;
use crate::balance::AccountBalance;
use crate::journal::Batch;
use crate::transaction::CardTransaction;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// A ledger backend able to open units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Unit of work type.
    type Tx: LedgerTx;

    /// Open a unit of work.
    async fn begin(&self) -> Result<Self::Tx>;
}

/// Reads and writes performed atomically within one unit of work.
#[async_trait]
pub trait LedgerTx: Send {
    /// Find an account by its (card, currency) key.
    async fn find_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>>;

    /// Find an account and lock it against other `lock_account` callers until
    /// the unit of work ends. Journals may still be posted against it.
    async fn lock_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>>;

    /// Insert a new account. Fails with `DuplicateAccount` if the key exists.
    async fn insert_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account>;

    /// Return the account for the key, creating it if missing. Safe under
    /// concurrent callers: exactly one account is ever created per key.
    async fn get_or_create_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account>;

    /// Aggregate balance of one account.
    async fn balance(&mut self, account: &Account) -> Result<AccountBalance>;

    /// Persist a batch and all of its journals.
    async fn insert_batch(&mut self, batch: &Batch) -> Result<()>;

    /// Load a batch with its journals.
    async fn find_batch(&mut self, batch_id: BatchId) -> Result<Option<Batch>>;

    /// Persist a new card transaction.
    async fn insert_transaction(&mut self, transaction: &CardTransaction) -> Result<()>;

    /// Find the pending authorisation with `transaction_id` and lock it until
    /// the unit of work ends.
    async fn lock_authorisation(&mut self, transaction_id: &TransactionId) -> Result<Option<CardTransaction>>;

    /// Persist the mutable fields of a card transaction.
    async fn update_transaction(&mut self, transaction: &CardTransaction) -> Result<()>;

    /// Card transactions billed to an account, oldest first.
    async fn account_transactions(&mut self, account_id: AccountId) -> Result<Vec<CardTransaction>>;

    /// Make every change of this unit of work durable.
    async fn commit(self) -> Result<()>;
}
