//! Issuer database adapter.
//!
//! Each operation is one ledger unit of work: it either commits as a whole
//! or, on any error, is dropped and rolled back.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use cards_common::{CardId, Currency, IssuerError, Money, Result, TransactionId};
use cards_ledger::{
    Account, AccountBalance, Batch, CardTransaction, LedgerEngine, LedgerStore, LedgerTx,
    NewAuthorisation,
};

/// Storage operations the issuer service relies on.
#[async_trait]
pub trait IssuerDatabase: Send + Sync {
    /// Whether an account exists for the pair.
    async fn account_exists(&self, card_id: &CardId, currency: &Currency) -> Result<bool>;

    /// Create an account. Fails with `DuplicateAccount` if it exists.
    async fn create_account(&self, card_id: &CardId, currency: &Currency) -> Result<Account>;

    /// Credit an existing account from the issuer account.
    async fn load_money(&self, card_id: &CardId, amount: Decimal, currency: &Currency) -> Result<Batch>;

    /// Hold funds for a card transaction.
    async fn make_authorisation(&self, authorisation: &NewAuthorisation) -> Result<CardTransaction>;

    /// Settle the pending authorisation with `transaction_id`.
    async fn set_presentment(&self, transaction_id: &TransactionId, settlement: Money) -> Result<CardTransaction>;

    /// Current balance of an account.
    async fn balance(&self, card_id: &CardId, currency: &Currency) -> Result<AccountBalance>;
}

/// Translate a missing account row into [`IssuerError::AccountNotFound`].
pub fn require_account(found: Option<Account>, card_id: &CardId, currency: &Currency) -> Result<Account> {
    found.ok_or_else(|| IssuerError::AccountNotFound {
        card_id: card_id.clone(),
        currency: currency.clone(),
    })
}

/// [`IssuerDatabase`] over any ledger store backend.
pub struct LedgerIssuerDatabase<S> {
    store: S,
    engine: LedgerEngine,
}

impl<S: LedgerStore> LedgerIssuerDatabase<S> {
    /// Create an adapter over `store`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            engine: LedgerEngine::new(),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S> IssuerDatabase for LedgerIssuerDatabase<S>
where
    S: LedgerStore + 'static,
{
    async fn account_exists(&self, card_id: &CardId, currency: &Currency) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let found = tx.find_account(card_id, currency).await?;
        tx.commit().await?;
        Ok(found.is_some())
    }

    #[instrument(skip(self), fields(card_id = %card_id, currency = %currency))]
    async fn create_account(&self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        let mut tx = self.store.begin().await?;
        let account = tx.insert_account(card_id, currency).await?;
        tx.commit().await?;

        info!(account_id = %account.id, "Account created");
        Ok(account)
    }

    #[instrument(skip(self), fields(card_id = %card_id, currency = %currency, amount = %amount))]
    async fn load_money(&self, card_id: &CardId, amount: Decimal, currency: &Currency) -> Result<Batch> {
        let mut tx = self.store.begin().await?;
        let account = require_account(tx.find_account(card_id, currency).await?, card_id, currency)?;

        let batch = self.engine.load(&mut tx, &account, amount).await?;
        tx.commit().await?;
        Ok(batch)
    }

    #[instrument(
        skip(self, authorisation),
        fields(
            card_id = %authorisation.card_id,
            transaction_id = %authorisation.transaction_id,
            billing = %authorisation.billing_amount
        )
    )]
    async fn make_authorisation(&self, authorisation: &NewAuthorisation) -> Result<CardTransaction> {
        let mut tx = self.store.begin().await?;

        let account = require_account(
            tx.lock_account(&authorisation.card_id, &authorisation.billing_currency)
                .await?,
            &authorisation.card_id,
            &authorisation.billing_currency,
        )?;

        let balance = tx.balance(&account).await?;
        if !balance.has_sufficient_funds(authorisation.billing_amount) {
            warn!(available = %balance.balance, "Insufficient funds");
            return Err(IssuerError::InsufficientFunds {
                required: authorisation.billing_amount,
                available: balance.balance,
            });
        }

        // A pending authorisation with the same id is rejected by the insert.
        let transaction = CardTransaction::authorisation(account.id, authorisation);
        tx.insert_transaction(&transaction).await?;
        tx.commit().await?;

        debug!(id = %transaction.id, "Authorisation stored");
        Ok(transaction)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn set_presentment(&self, transaction_id: &TransactionId, settlement: Money) -> Result<CardTransaction> {
        let mut tx = self.store.begin().await?;

        let mut transaction = tx
            .lock_authorisation(transaction_id)
            .await?
            .ok_or_else(|| IssuerError::AuthorisationNotFound(transaction_id.clone()))?;

        self.engine.present(&mut tx, &mut transaction, settlement).await?;
        tx.commit().await?;
        Ok(transaction)
    }

    async fn balance(&self, card_id: &CardId, currency: &Currency) -> Result<AccountBalance> {
        let mut tx = self.store.begin().await?;
        let account = require_account(tx.find_account(card_id, currency).await?, card_id, currency)?;
        let balance = tx.balance(&account).await?;
        tx.commit().await?;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cards_ledger::{MemoryLedgerStore, SystemAccount, TransactionType};
    use rust_decimal_macros::dec;

    fn database() -> LedgerIssuerDatabase<MemoryLedgerStore> {
        LedgerIssuerDatabase::new(MemoryLedgerStore::new())
    }

    fn authorisation(card: &str, id: &str, billing: Decimal) -> NewAuthorisation {
        NewAuthorisation {
            card_id: CardId::new(card),
            transaction_id: TransactionId::new(id),
            merchant_name: "SNEAKERS R US".to_string(),
            merchant_country: "US".to_string(),
            merchant_mcc: 5139,
            billing_amount: billing,
            billing_currency: Currency::brl(),
            transaction_amount: billing,
            transaction_currency: Currency::brl(),
        }
    }

    #[test]
    fn test_require_account() {
        let card = CardId::new("CARD1");
        let err = require_account(None, &card, &Currency::brl()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Account not found: CARD1:BRL");
    }

    #[tokio::test]
    async fn test_create_account_twice() {
        let db = database();
        let card = CardId::new("CARD1");

        assert!(!db.account_exists(&card, &Currency::brl()).await.unwrap());
        db.create_account(&card, &Currency::brl()).await.unwrap();
        assert!(db.account_exists(&card, &Currency::brl()).await.unwrap());

        let err = db.create_account(&card, &Currency::brl()).await.unwrap_err();
        assert!(matches!(err, IssuerError::DuplicateAccount { .. }));
    }

    #[tokio::test]
    async fn test_load_money_requires_account() {
        let db = database();
        let err = db
            .load_money(&CardId::new("NOPE"), dec!(10), &Currency::brl())
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::AccountNotFound { .. }));
        assert_eq!(db.store().account_count().await, 0);
    }

    #[tokio::test]
    async fn test_authorisation_holds_funds() {
        let db = database();
        let card = CardId::new("CARD1");
        db.create_account(&card, &Currency::brl()).await.unwrap();
        db.load_money(&card, dec!(100), &Currency::brl()).await.unwrap();

        let txn = db
            .make_authorisation(&authorisation("CARD1", "T1", dec!(60)))
            .await
            .unwrap();
        assert_eq!(txn.transaction_type, TransactionType::Authorisation);

        let balance = db.balance(&card, &Currency::brl()).await.unwrap();
        assert_eq!(balance.journals_sum, dec!(100));
        assert_eq!(balance.authorisations_sum, dec!(60));
        assert_eq!(balance.balance, dec!(40));

        let err = db
            .make_authorisation(&authorisation("CARD1", "T2", dec!(40.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_pending_authorisation() {
        let db = database();
        let card = CardId::new("CARD1");
        db.create_account(&card, &Currency::brl()).await.unwrap();
        db.load_money(&card, dec!(100), &Currency::brl()).await.unwrap();

        db.make_authorisation(&authorisation("CARD1", "T1", dec!(10)))
            .await
            .unwrap();
        let err = db
            .make_authorisation(&authorisation("CARD1", "T1", dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::DuplicateAuthorisation(_)));
    }

    #[tokio::test]
    async fn test_presentment_in_other_currency() {
        let db = database();
        let card = CardId::new("CARD1");
        db.create_account(&card, &Currency::brl()).await.unwrap();
        db.load_money(&card, dec!(100), &Currency::brl()).await.unwrap();
        db.make_authorisation(&authorisation("CARD1", "T1", dec!(50)))
            .await
            .unwrap();

        let txn = db
            .set_presentment(&TransactionId::new("T1"), Money::new(dec!(10), Currency::usd()))
            .await
            .unwrap();
        assert_eq!(txn.settlement(), Some(Money::new(dec!(10), Currency::usd())));

        let scheme_usd = db
            .balance(&SystemAccount::Scheme.card_id(), &Currency::usd())
            .await
            .unwrap();
        let issuer_brl = db
            .balance(&SystemAccount::Issuer.card_id(), &Currency::brl())
            .await
            .unwrap();
        assert_eq!(scheme_usd.balance, dec!(10));
        assert_eq!(issuer_brl.balance, dec!(-100) + dec!(40));
        assert_eq!(db.balance(&card, &Currency::brl()).await.unwrap().balance, dec!(50));
        assert!(db.store().verify_integrity().await);
    }
}
