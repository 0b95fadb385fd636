//! Card transactions and their authorisation/presentment lifecycle.

use std::fmt;
use std::str::FromStr;

use cards_common::{AccountId, BatchId, CardId, Currency, Money, TransactionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a card transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Funds held, awaiting settlement.
    Authorisation,
    /// Settled against the ledger. Final.
    Presentment,
}

impl TransactionType {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Authorisation => "authorisation",
            TransactionType::Presentment => "presentment",
        }
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionType] {
        match self {
            TransactionType::Authorisation => &[TransactionType::Presentment],
            TransactionType::Presentment => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionType) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorisation" => Ok(TransactionType::Authorisation),
            "presentment" => Ok(TransactionType::Presentment),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

/// Authorisation request that already passed boundary validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuthorisation {
    pub card_id: CardId,
    pub transaction_id: TransactionId,
    pub merchant_name: String,
    pub merchant_country: String,
    pub merchant_mcc: u16,
    pub billing_amount: Decimal,
    pub billing_currency: Currency,
    pub transaction_amount: Decimal,
    pub transaction_currency: Currency,
}

/// A card transaction as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardTransaction {
    /// Row identifier.
    pub id: Uuid,
    /// Account the transaction is billed to.
    pub account_id: AccountId,
    /// Scheme transaction id.
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
    pub merchant_name: String,
    pub merchant_country: String,
    pub merchant_mcc: u16,
    pub billing_amount: Decimal,
    pub billing_currency: Currency,
    pub transaction_amount: Decimal,
    pub transaction_currency: Currency,
    pub settlement_amount: Option<Decimal>,
    pub settlement_currency: Option<Currency>,
    /// Batch that settled the transaction.
    pub presentment_batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CardTransaction {
    /// Create a pending authorisation against `account_id`.
    pub fn authorisation(account_id: AccountId, request: &NewAuthorisation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            account_id,
            transaction_id: request.transaction_id.clone(),
            transaction_type: TransactionType::Authorisation,
            merchant_name: request.merchant_name.clone(),
            merchant_country: request.merchant_country.clone(),
            merchant_mcc: request.merchant_mcc,
            billing_amount: request.billing_amount,
            billing_currency: request.billing_currency.clone(),
            transaction_amount: request.transaction_amount,
            transaction_currency: request.transaction_currency.clone(),
            settlement_amount: None,
            settlement_currency: None,
            presentment_batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the transaction still holds funds.
    pub fn is_pending(&self) -> bool {
        self.transaction_type == TransactionType::Authorisation
    }

    /// Settlement amount and currency, once presented.
    pub fn settlement(&self) -> Option<Money> {
        match (self.settlement_amount, &self.settlement_currency) {
            (Some(value), Some(currency)) => Some(Money::new(value, currency.clone())),
            _ => None,
        }
    }

    /// Move to presentment, recording the settlement and its batch.
    pub fn present(&mut self, settlement: Money, batch_id: BatchId) -> Result<(), TransactionType> {
        if !self
            .transaction_type
            .can_transition_to(TransactionType::Presentment)
        {
            return Err(self.transaction_type);
        }

        self.transaction_type = TransactionType::Presentment;
        self.settlement_amount = Some(settlement.value);
        self.settlement_currency = Some(settlement.currency);
        self.presentment_batch_id = Some(batch_id);
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl fmt::Display for CardTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.transaction_id, self.transaction_type)
    }
}
