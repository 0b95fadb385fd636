//! End-to-end issuer flows against the in-memory ledger.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use cards_common::{AccountId, BatchId, CardId, Currency, IssuerError, Result, TransactionId};
use cards_issuer::{AuthorisationRequest, IssuerMetrics, IssuerService, LedgerIssuerDatabase};
use cards_ledger::store::memory::MemoryLedgerTx;
use cards_ledger::{
    Account, AccountBalance, Batch, CardTransaction, LedgerStore, LedgerTx, MemoryLedgerStore,
    TransactionType,
};

fn service_over<S: LedgerStore + 'static>(store: S) -> IssuerService {
    IssuerService::new(
        Arc::new(LedgerIssuerDatabase::new(store)),
        vec![Currency::brl(), Currency::eur(), Currency::gbp(), Currency::usd()],
        Arc::new(IssuerMetrics::new()),
    )
}

fn authorisation(card_id: &str, transaction_id: &str, billing: Decimal) -> AuthorisationRequest {
    AuthorisationRequest {
        card_id: card_id.to_string(),
        transaction_id: transaction_id.to_string(),
        merchant_name: "SNEAKERS R US".to_string(),
        merchant_country: "US".to_string(),
        merchant_mcc: 5139,
        billing_amount: billing,
        billing_currency: "BRL".to_string(),
        transaction_amount: billing,
        transaction_currency: "BRL".to_string(),
    }
}

async fn pending_count(store: &MemoryLedgerStore, service: &IssuerService, card: &str) -> usize {
    let account_id = service.balance(card, "BRL").await.unwrap().account_id;
    let mut tx = store.begin().await.unwrap();
    let transactions = tx.account_transactions(account_id).await.unwrap();
    transactions.iter().filter(|t| t.is_pending()).count()
}

#[tokio::test]
async fn test_load_authorise_present() {
    let store = MemoryLedgerStore::new();
    let service = service_over(store.clone());

    service.load_money("CARD1", dec!(100), "BRL").await.unwrap();
    assert_eq!(service.balance("CARD1", "BRL").await.unwrap().balance, dec!(100.00));

    assert!(service
        .make_authorisation(&authorisation("CARD1", "T1", dec!(100)))
        .await
        .unwrap());
    assert_eq!(service.balance("CARD1", "BRL").await.unwrap().balance, dec!(0));

    let presented = service.set_presentment("T1", dec!(95), "BRL").await.unwrap();
    assert_eq!(presented.transaction_type, TransactionType::Presentment);
    assert_eq!(presented.settlement_amount, Some(dec!(95)));
    assert_eq!(presented.settlement_currency, Some(Currency::brl()));

    let cardholder = service.balance("CARD1", "BRL").await.unwrap();
    let scheme = service.balance(CardId::SCHEME, "BRL").await.unwrap();
    let issuer = service.balance(CardId::ISSUER, "BRL").await.unwrap();
    assert_eq!(cardholder.balance, dec!(0));
    assert_eq!(cardholder.authorisations_sum, dec!(0));
    assert_eq!(scheme.balance, dec!(95));
    assert_eq!(issuer.balance, dec!(-95));

    let batch_id = presented.presentment_batch_id.unwrap();
    let mut tx = store.begin().await.unwrap();
    let batch = tx.find_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.journals.len(), 3);
    assert!(batch.is_balanced());
    drop(tx);

    assert!(store.verify_integrity().await);
}

#[tokio::test]
async fn test_presentment_at_billing_amount_books_no_profit() {
    let store = MemoryLedgerStore::new();
    let service = service_over(store.clone());
    service.load_money("CARD1", dec!(100), "BRL").await.unwrap();
    service
        .make_authorisation(&authorisation("CARD1", "T1", dec!(30)))
        .await
        .unwrap();

    let presented = service.set_presentment("T1", dec!(30), "BRL").await.unwrap();

    let issuer = service.balance(CardId::ISSUER, "BRL").await.unwrap();
    assert_eq!(issuer.balance, dec!(-100));
    assert_eq!(service.balance(CardId::SCHEME, "BRL").await.unwrap().balance, dec!(30));
    assert_eq!(service.balance("CARD1", "BRL").await.unwrap().balance, dec!(70));

    let mut tx = store.begin().await.unwrap();
    let batch = tx
        .find_batch(presented.presentment_batch_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let profit: Vec<_> = batch.journals_for(issuer.account_id).collect();
    assert_eq!(profit.len(), 1);
    assert_eq!(profit[0].amount, dec!(0.00));
    assert!(batch.is_balanced());
    drop(tx);

    assert!(store.verify_integrity().await);
}

#[tokio::test]
async fn test_decline_creates_no_transaction() {
    let store = MemoryLedgerStore::new();
    let service = service_over(store.clone());
    service.load_money("CARD1", dec!(10), "BRL").await.unwrap();

    let approved = service
        .make_authorisation(&authorisation("CARD1", "T1", dec!(10.01)))
        .await
        .unwrap();

    assert!(!approved);
    assert_eq!(pending_count(&store, &service, "CARD1").await, 0);
    assert_eq!(service.balance("CARD1", "BRL").await.unwrap().balance, dec!(10));
}

#[tokio::test]
async fn test_present_twice() {
    let service = service_over(MemoryLedgerStore::new());
    service.load_money("CARD1", dec!(50), "BRL").await.unwrap();
    service
        .make_authorisation(&authorisation("CARD1", "T1", dec!(20)))
        .await
        .unwrap();

    service.set_presentment("T1", dec!(20), "BRL").await.unwrap();
    let err = service.set_presentment("T1", dec!(20), "BRL").await.unwrap_err();

    assert!(matches!(err, IssuerError::AuthorisationNotFound(ref id) if id.as_str() == "T1"));
    assert_eq!(service.balance("CARD1", "BRL").await.unwrap().balance, dec!(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_authorisations_cannot_overspend() {
    let store = MemoryLedgerStore::new();
    let service = Arc::new(service_over(store.clone()));
    service.load_money("CARD1", dec!(100), "BRL").await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .make_authorisation(&authorisation("CARD1", &format!("T{}", i), dec!(100)))
                    .await
            })
        })
        .collect();

    let mut approved = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            approved += 1;
        }
    }

    assert_eq!(approved, 1);
    assert_eq!(service.balance("CARD1", "BRL").await.unwrap().balance, dec!(0));
    assert_eq!(pending_count(&store, &service, "CARD1").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_loads_share_one_account() {
    let store = MemoryLedgerStore::new();
    let service = Arc::new(service_over(store.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.load_money("CARD1", dec!(1), "EUR").await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(service.balance("CARD1", "EUR").await.unwrap().balance, dec!(8));
    // cardholder plus issuer
    assert_eq!(store.account_count().await, 2);
}

#[tokio::test]
async fn test_invalid_currency_message() {
    let service = service_over(MemoryLedgerStore::new());
    let err = service
        .load_money("CARD1", dec!(10), "INVALID_CURRENCY")
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Currency \"INVALID_CURRENCY\" not available.");
    assert_eq!(err.error_code(), "INVALID_CURRENCY");
}

/// Store whose units of work fail when a card transaction is updated.
#[derive(Clone)]
struct FailingUpdateStore {
    inner: MemoryLedgerStore,
}

struct FailingUpdateTx {
    inner: MemoryLedgerTx,
}

#[async_trait]
impl LedgerStore for FailingUpdateStore {
    type Tx = FailingUpdateTx;

    async fn begin(&self) -> Result<FailingUpdateTx> {
        Ok(FailingUpdateTx {
            inner: self.inner.begin().await?,
        })
    }
}

#[async_trait]
impl LedgerTx for FailingUpdateTx {
    async fn find_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>> {
        self.inner.find_account(card_id, currency).await
    }

    async fn lock_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>> {
        self.inner.lock_account(card_id, currency).await
    }

    async fn insert_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        self.inner.insert_account(card_id, currency).await
    }

    async fn get_or_create_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        self.inner.get_or_create_account(card_id, currency).await
    }

    async fn balance(&mut self, account: &Account) -> Result<AccountBalance> {
        self.inner.balance(account).await
    }

    async fn insert_batch(&mut self, batch: &Batch) -> Result<()> {
        self.inner.insert_batch(batch).await
    }

    async fn find_batch(&mut self, batch_id: BatchId) -> Result<Option<Batch>> {
        self.inner.find_batch(batch_id).await
    }

    async fn insert_transaction(&mut self, transaction: &CardTransaction) -> Result<()> {
        self.inner.insert_transaction(transaction).await
    }

    async fn lock_authorisation(&mut self, transaction_id: &TransactionId) -> Result<Option<CardTransaction>> {
        self.inner.lock_authorisation(transaction_id).await
    }

    async fn update_transaction(&mut self, _transaction: &CardTransaction) -> Result<()> {
        Err(IssuerError::Database("update_transaction: connection reset".to_string()))
    }

    async fn account_transactions(&mut self, account_id: AccountId) -> Result<Vec<CardTransaction>> {
        self.inner.account_transactions(account_id).await
    }

    async fn commit(self) -> Result<()> {
        self.inner.commit().await
    }
}

#[tokio::test]
async fn test_failed_presentment_rolls_back() {
    let memory = MemoryLedgerStore::new();
    let healthy = service_over(memory.clone());
    healthy.load_money("CARD1", dec!(100), "BRL").await.unwrap();
    healthy
        .make_authorisation(&authorisation("CARD1", "T1", dec!(40)))
        .await
        .unwrap();
    let accounts_before = memory.account_count().await;
    let batches_before = memory.batches().await.len();

    let failing = service_over(FailingUpdateStore {
        inner: memory.clone(),
    });
    let err = failing
        .set_presentment("T1", dec!(38), "USD")
        .await
        .unwrap_err();
    assert!(matches!(err, IssuerError::Database(_)));

    assert_eq!(memory.account_count().await, accounts_before);
    assert_eq!(memory.batches().await.len(), batches_before);
    assert!(healthy.balance(CardId::SCHEME, "USD").await.unwrap_err().is_not_found());
    assert_eq!(pending_count(&memory, &healthy, "CARD1").await, 1);

    let presented = healthy.set_presentment("T1", dec!(38), "USD").await.unwrap();
    assert_eq!(presented.transaction_type, TransactionType::Presentment);
}
