//! In-memory ledger store.
//!
//! One async mutex guards the whole ledger, and a unit of work holds it from
//! `begin` until it is committed or dropped, so units of work are fully
//! serialized. Changes are applied in place and recorded in an undo log that
//! is replayed backwards when an uncommitted unit of work is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use cards_common::{AccountId, BatchId, CardId, Currency, IssuerError, Result, TransactionId};

use crate::account::Account;
use crate::balance::{AccountBalance, BalanceCalculator};
use crate::journal::Batch;
use crate::store::{LedgerStore, LedgerTx};
use crate::transaction::CardTransaction;

/// Ledger rows plus the indexes that keep lookups scoped to one account.
#[derive(Debug, Default)]
struct LedgerState {
    accounts: Vec<Account>,
    account_keys: HashMap<(CardId, Currency), usize>,
    batches: Vec<Batch>,
    batch_positions: HashMap<BatchId, usize>,
    /// (batch position, journal position) per account.
    journals_by_account: HashMap<AccountId, Vec<(usize, usize)>>,
    transactions: Vec<CardTransaction>,
    transaction_positions: HashMap<Uuid, usize>,
    transactions_by_account: HashMap<AccountId, Vec<usize>>,
    pending_authorisations: HashMap<TransactionId, usize>,
}

/// Inverse of one applied change.
#[derive(Debug)]
enum Undo {
    InsertAccount,
    InsertBatch,
    InsertTransaction,
    UpdateTransaction {
        position: usize,
        previous: CardTransaction,
    },
}

impl LedgerState {
    fn find_account(&self, card_id: &CardId, currency: &Currency) -> Option<Account> {
        self.account_keys
            .get(&(card_id.clone(), currency.clone()))
            .map(|&position| self.accounts[position].clone())
    }

    fn push_account(&mut self, account: Account) {
        let key = (account.card_id.clone(), account.currency.clone());
        self.account_keys.insert(key, self.accounts.len());
        self.accounts.push(account);
    }

    fn push_batch(&mut self, batch: Batch) {
        let batch_position = self.batches.len();
        for (journal_position, journal) in batch.journals.iter().enumerate() {
            self.journals_by_account
                .entry(journal.account_id)
                .or_default()
                .push((batch_position, journal_position));
        }
        self.batch_positions.insert(batch.id, batch_position);
        self.batches.push(batch);
    }

    fn push_transaction(&mut self, transaction: CardTransaction) {
        let position = self.transactions.len();
        self.transaction_positions.insert(transaction.id, position);
        self.transactions_by_account
            .entry(transaction.account_id)
            .or_default()
            .push(position);
        if transaction.is_pending() {
            self.pending_authorisations
                .insert(transaction.transaction_id.clone(), position);
        }
        self.transactions.push(transaction);
    }

    /// Replace a stored transaction, keeping the pending index in sync.
    fn replace_transaction(&mut self, position: usize, transaction: CardTransaction) -> CardTransaction {
        let previous = std::mem::replace(&mut self.transactions[position], transaction);
        if previous.is_pending() {
            self.pending_authorisations.remove(&previous.transaction_id);
        }
        let current = &self.transactions[position];
        if current.is_pending() {
            self.pending_authorisations
                .insert(current.transaction_id.clone(), position);
        }
        previous
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::InsertAccount => {
                if let Some(account) = self.accounts.pop() {
                    self.account_keys.remove(&(account.card_id, account.currency));
                }
            }
            Undo::InsertBatch => {
                if let Some(batch) = self.batches.pop() {
                    self.batch_positions.remove(&batch.id);
                    for journal in batch.journals.iter().rev() {
                        if let Some(positions) = self.journals_by_account.get_mut(&journal.account_id) {
                            positions.pop();
                        }
                    }
                }
            }
            Undo::InsertTransaction => {
                if let Some(transaction) = self.transactions.pop() {
                    self.transaction_positions.remove(&transaction.id);
                    if let Some(positions) = self.transactions_by_account.get_mut(&transaction.account_id) {
                        positions.pop();
                    }
                    if transaction.is_pending() {
                        self.pending_authorisations.remove(&transaction.transaction_id);
                    }
                }
            }
            Undo::UpdateTransaction { position, previous } => {
                self.replace_transaction(position, previous);
            }
        }
    }

    fn balance(&self, account: &Account) -> AccountBalance {
        let journals = self
            .journals_by_account
            .get(&account.id)
            .into_iter()
            .flatten()
            .map(|&(batch, journal)| self.batches[batch].journals[journal].amount);

        let authorisations = self
            .transactions_by_account
            .get(&account.id)
            .into_iter()
            .flatten()
            .map(|&position| &self.transactions[position])
            .filter(|t| t.is_pending())
            .map(|t| t.billing_amount);

        BalanceCalculator::compute(account, journals, authorisations)
    }
}

/// Ledger store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every stored batch nets to zero and that ledger-wide debits
    /// equal credits.
    pub async fn verify_integrity(&self) -> bool {
        let state = self.state.lock().await;
        let debits: Decimal = state.batches.iter().map(Batch::total_debits).sum();
        let credits: Decimal = state.batches.iter().map(Batch::total_credits).sum();
        if debits != credits {
            warn!(%debits, %credits, "Ledger debits and credits differ");
            return false;
        }
        state.batches.iter().all(Batch::is_balanced)
    }

    /// All committed batches, oldest first.
    pub async fn batches(&self) -> Vec<Batch> {
        self.state.lock().await.batches.clone()
    }

    /// Number of committed accounts, system accounts included.
    pub async fn account_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryLedgerTx;

    async fn begin(&self) -> Result<MemoryLedgerTx> {
        let state = self.state.clone().lock_owned().await;
        Ok(MemoryLedgerTx {
            state,
            undo: Vec::new(),
        })
    }
}

/// Unit of work over a [`MemoryLedgerStore`].
pub struct MemoryLedgerTx {
    state: OwnedMutexGuard<LedgerState>,
    undo: Vec<Undo>,
}

impl Drop for MemoryLedgerTx {
    fn drop(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        debug!(changes = self.undo.len(), "Rolling back ledger unit of work");
        while let Some(undo) = self.undo.pop() {
            self.state.revert(undo);
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn find_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>> {
        Ok(self.state.find_account(card_id, currency))
    }

    async fn lock_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>> {
        // The unit of work already holds the whole ledger exclusively.
        Ok(self.state.find_account(card_id, currency))
    }

    async fn insert_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        if self.state.find_account(card_id, currency).is_some() {
            return Err(IssuerError::DuplicateAccount {
                card_id: card_id.clone(),
                currency: currency.clone(),
            });
        }

        let account = Account::new(card_id.clone(), currency.clone());
        self.state.push_account(account.clone());
        self.undo.push(Undo::InsertAccount);
        Ok(account)
    }

    async fn get_or_create_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        match self.state.find_account(card_id, currency) {
            Some(account) => Ok(account),
            None => self.insert_account(card_id, currency).await,
        }
    }

    async fn balance(&mut self, account: &Account) -> Result<AccountBalance> {
        Ok(self.state.balance(account))
    }

    async fn insert_batch(&mut self, batch: &Batch) -> Result<()> {
        batch.ensure_balanced()?;
        if self.state.batch_positions.contains_key(&batch.id) {
            return Err(IssuerError::Database(format!("batch {} already exists", batch.id)));
        }

        self.state.push_batch(batch.clone());
        self.undo.push(Undo::InsertBatch);
        Ok(())
    }

    async fn find_batch(&mut self, batch_id: BatchId) -> Result<Option<Batch>> {
        Ok(self
            .state
            .batch_positions
            .get(&batch_id)
            .map(|&position| self.state.batches[position].clone()))
    }

    async fn insert_transaction(&mut self, transaction: &CardTransaction) -> Result<()> {
        if transaction.is_pending()
            && self
                .state
                .pending_authorisations
                .contains_key(&transaction.transaction_id)
        {
            return Err(IssuerError::DuplicateAuthorisation(
                transaction.transaction_id.clone(),
            ));
        }

        self.state.push_transaction(transaction.clone());
        self.undo.push(Undo::InsertTransaction);
        Ok(())
    }

    async fn lock_authorisation(&mut self, transaction_id: &TransactionId) -> Result<Option<CardTransaction>> {
        Ok(self
            .state
            .pending_authorisations
            .get(transaction_id)
            .map(|&position| self.state.transactions[position].clone()))
    }

    async fn update_transaction(&mut self, transaction: &CardTransaction) -> Result<()> {
        let position = *self
            .state
            .transaction_positions
            .get(&transaction.id)
            .ok_or_else(|| IssuerError::Database(format!("transaction row {} not found", transaction.id)))?;

        if transaction.is_pending() {
            if let Some(&other) = self.state.pending_authorisations.get(&transaction.transaction_id) {
                if other != position {
                    return Err(IssuerError::DuplicateAuthorisation(
                        transaction.transaction_id.clone(),
                    ));
                }
            }
        }

        let previous = self.state.replace_transaction(position, transaction.clone());
        self.undo.push(Undo::UpdateTransaction { position, previous });
        Ok(())
    }

    async fn account_transactions(&mut self, account_id: AccountId) -> Result<Vec<CardTransaction>> {
        Ok(self
            .state
            .transactions_by_account
            .get(&account_id)
            .into_iter()
            .flatten()
            .map(|&position| self.state.transactions[position].clone())
            .collect())
    }

    async fn commit(self) -> Result<()> {
        let mut this = self;
        debug!(changes = this.undo.len(), "Committing ledger unit of work");
        this.undo.clear();
        Ok(())
    }
}
