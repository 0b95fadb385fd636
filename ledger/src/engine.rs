//! Double-entry engine.
//!
//! Every funds movement is expressed as one [`Batch`] whose journals net to
//! zero. Batch construction is pure; the async helpers run it against a
//! [`LedgerTx`] so the caller decides when the unit of work commits.

use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use cards_common::{Currency, IssuerError, Money, Result};

use crate::account::{Account, SystemAccount};
use crate::journal::Batch;
use crate::store::LedgerTx;
use crate::transaction::CardTransaction;

/// The double-entry engine builds and posts balanced batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerEngine;

impl LedgerEngine {
    /// Create a new ledger engine.
    pub fn new() -> Self {
        Self
    }

    /// Move `amount` from `debit` to `credit`.
    pub fn transfer(
        &self,
        debit: &Account,
        credit: &Account,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<Batch> {
        if amount <= Decimal::ZERO {
            return Err(IssuerError::invalid_input(
                "amount",
                format!("transfer amount must be positive, got {}", amount),
            ));
        }
        if debit.currency != credit.currency {
            return Err(IssuerError::CurrencyMismatch {
                expected: debit.currency.clone(),
                actual: credit.currency.clone(),
            });
        }

        let mut batch = Batch::new(description);
        batch.add_journal(debit.id, -amount);
        batch.add_journal(credit.id, amount);
        batch.ensure_balanced()?;
        Ok(batch)
    }

    /// Settle a pending authorisation.
    ///
    /// The cardholder is debited the billing amount, the scheme is credited
    /// the settlement amount and the issuer books the difference, which may
    /// be zero or negative. The cardholder account is the one the
    /// authorisation is billed to.
    pub fn presentment_batch(
        &self,
        transaction: &CardTransaction,
        scheme: &Account,
        issuer: &Account,
        settlement: &Money,
    ) -> Result<Batch> {
        if !settlement.is_positive() {
            return Err(IssuerError::invalid_input(
                "settlement_amount",
                format!("settlement must be positive, got {}", settlement),
            ));
        }
        if scheme.currency != settlement.currency {
            return Err(IssuerError::CurrencyMismatch {
                expected: settlement.currency.clone(),
                actual: scheme.currency.clone(),
            });
        }
        if issuer.currency != transaction.billing_currency {
            return Err(IssuerError::CurrencyMismatch {
                expected: transaction.billing_currency.clone(),
                actual: issuer.currency.clone(),
            });
        }

        let profit = transaction.billing_amount - settlement.value;

        let mut batch = Batch::new(Some(format!("presentment {}", transaction.transaction_id)));
        batch.add_journal(transaction.account_id, -transaction.billing_amount);
        batch.add_journal(scheme.id, settlement.value);
        batch.add_journal(issuer.id, profit);
        batch.ensure_balanced()?;
        Ok(batch)
    }

    /// Get or lazily create a system account in `currency`.
    pub async fn system_account<T: LedgerTx>(
        &self,
        tx: &mut T,
        which: SystemAccount,
        currency: &Currency,
    ) -> Result<Account> {
        let account = tx.get_or_create_account(&which.card_id(), currency).await?;
        debug!(account = %account.id, kind = ?which, currency = %currency, "System account resolved");
        Ok(account)
    }

    /// Fund `cardholder` from the issuer account of the same currency.
    #[instrument(skip(self, tx, cardholder), fields(card_id = %cardholder.card_id, currency = %cardholder.currency))]
    pub async fn load<T: LedgerTx>(
        &self,
        tx: &mut T,
        cardholder: &Account,
        amount: Decimal,
    ) -> Result<Batch> {
        let issuer = self
            .system_account(tx, SystemAccount::Issuer, &cardholder.currency)
            .await?;

        let batch = self.transfer(
            &issuer,
            cardholder,
            amount,
            Some(format!("load {} {}", amount, cardholder.currency)),
        )?;
        tx.insert_batch(&batch).await?;

        info!(batch_id = %batch.id, amount = %amount, "Money loaded");
        Ok(batch)
    }

    /// Post the presentment batch for `transaction` and move it to
    /// presentment. `transaction` must have been locked in `tx`.
    #[instrument(skip(self, tx, transaction), fields(transaction_id = %transaction.transaction_id, settlement = %settlement))]
    pub async fn present<T: LedgerTx>(
        &self,
        tx: &mut T,
        transaction: &mut CardTransaction,
        settlement: Money,
    ) -> Result<Batch> {
        if !transaction.is_pending() {
            return Err(IssuerError::AuthorisationNotFound(
                transaction.transaction_id.clone(),
            ));
        }

        let scheme = self
            .system_account(tx, SystemAccount::Scheme, &settlement.currency)
            .await?;
        let issuer = self
            .system_account(tx, SystemAccount::Issuer, &transaction.billing_currency)
            .await?;

        let batch = self.presentment_batch(transaction, &scheme, &issuer, &settlement)?;
        tx.insert_batch(&batch).await?;

        transaction
            .present(settlement, batch.id)
            .map_err(|_| IssuerError::AuthorisationNotFound(transaction.transaction_id.clone()))?;
        tx.update_transaction(transaction).await?;

        info!(
            batch_id = %batch.id,
            billing = %transaction.billing_amount,
            "Authorisation presented"
        );
        Ok(batch)
    }
}
