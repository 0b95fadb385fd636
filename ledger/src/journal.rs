//! Journal and batch types for double-entry bookkeeping.

use cards_common::{AccountId, BatchId, IssuerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Side of a journal, derived from the sign of its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Negative amount: funds leave the account.
    Debit,
    /// Positive (or zero) amount: funds enter the account.
    Credit,
}

/// A single signed entry against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    /// Unique entry ID.
    pub id: Uuid,
    /// Batch this entry belongs to.
    pub batch_id: BatchId,
    /// Account affected.
    pub account_id: AccountId,
    /// Signed amount.
    pub amount: Decimal,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

impl Journal {
    /// Create a journal entry.
    pub fn new(batch_id: BatchId, account_id: AccountId, amount: Decimal) -> Self {
        Self {
            id: Uuid::now_v7(),
            batch_id,
            account_id,
            amount,
            created_at: Utc::now(),
        }
    }

    /// Debit or credit, by sign.
    pub fn entry_type(&self) -> EntryType {
        if self.amount < Decimal::ZERO {
            EntryType::Debit
        } else {
            EntryType::Credit
        }
    }
}

/// A set of journals that must be committed together and net to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch ID.
    pub id: BatchId,
    /// Free-form description.
    pub description: Option<String>,
    /// Entries in the batch.
    pub journals: Vec<Journal>,
    /// When the batch was created.
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Create a new empty batch.
    pub fn new(description: Option<String>) -> Self {
        Self {
            id: BatchId::new(),
            description,
            journals: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Add an entry to the batch.
    pub fn add_journal(&mut self, account_id: AccountId, amount: Decimal) -> &Journal {
        self.journals.push(Journal::new(self.id, account_id, amount));
        &self.journals[self.journals.len() - 1]
    }

    /// Sum of all journal amounts.
    pub fn sum(&self) -> Decimal {
        self.journals.iter().map(|j| j.amount).sum()
    }

    /// Whether the journals net to zero.
    pub fn is_balanced(&self) -> bool {
        self.sum().is_zero()
    }

    /// Fail with [`IssuerError::UnbalancedBatch`] unless balanced.
    pub fn ensure_balanced(&self) -> Result<()> {
        if self.is_balanced() {
            Ok(())
        } else {
            Err(IssuerError::UnbalancedBatch {
                batch_id: self.id,
                sum: self.sum(),
            })
        }
    }

    /// Get total debits (as a positive amount).
    pub fn total_debits(&self) -> Decimal {
        -self
            .journals
            .iter()
            .filter(|j| j.entry_type() == EntryType::Debit)
            .map(|j| j.amount)
            .sum::<Decimal>()
    }

    /// Get total credits.
    pub fn total_credits(&self) -> Decimal {
        self.journals
            .iter()
            .filter(|j| j.entry_type() == EntryType::Credit)
            .map(|j| j.amount)
            .sum()
    }

    /// Journals posted against `account_id`.
    pub fn journals_for(&self, account_id: AccountId) -> impl Iterator<Item = &Journal> {
        self.journals.iter().filter(move |j| j.account_id == account_id)
    }
}
