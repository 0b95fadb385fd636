//! Issuer service.
//!
//! The entry point for every caller. Inputs are validated here, before any
//! storage access; storage outcomes are passed through unchanged except for
//! declined authorisations, which are reported as `false`.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use cards_common::{validate_amount, CardId, Currency, IssuerError, Money, Result, TransactionId};
use cards_ledger::{AccountBalance, Batch, CardTransaction, NewAuthorisation};

use crate::db::IssuerDatabase;
use crate::metrics::SharedMetrics;

/// Longest transaction id accepted from the scheme.
pub const MAX_TRANSACTION_ID_LEN: usize = 64;

/// Highest merchant category code.
pub const MAX_MCC: u32 = 9999;

/// Authorisation as received from the card scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorisationRequest {
    pub card_id: String,
    pub transaction_id: String,
    pub merchant_name: String,
    pub merchant_country: String,
    pub merchant_mcc: u32,
    pub billing_amount: Decimal,
    pub billing_currency: String,
    pub transaction_amount: Decimal,
    pub transaction_currency: String,
}

/// Orchestrates loads, authorisations and presentments.
pub struct IssuerService {
    db: Arc<dyn IssuerDatabase>,
    currencies: Vec<Currency>,
    metrics: SharedMetrics,
}

impl IssuerService {
    /// Create a service over `db` accepting `currencies`.
    pub fn new(db: Arc<dyn IssuerDatabase>, currencies: Vec<Currency>, metrics: SharedMetrics) -> Self {
        Self {
            db,
            currencies,
            metrics,
        }
    }

    /// Metrics recorded by this service.
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Credit `amount` to the card's account, creating the account on first
    /// load.
    #[instrument(skip(self))]
    pub async fn load_money(&self, card_id: &str, amount: Decimal, currency: &str) -> Result<Batch> {
        let currency = self.currency(currency)?;
        let card_id = cardholder_id(card_id)?;
        let amount = validate_amount("amount", amount)?;

        let result = self.provision_and_load(&card_id, amount, &currency).await;
        match &result {
            Ok(batch) => {
                self.metrics.load_recorded();
                info!(batch_id = %batch.id, "Load completed");
            }
            Err(e) => self.record_failure("load_money", e),
        }
        result
    }

    /// Authorise a card transaction. Returns `false` when the account cannot
    /// cover the billing amount.
    #[instrument(skip(self, request), fields(card_id = %request.card_id, transaction_id = %request.transaction_id))]
    pub async fn make_authorisation(&self, request: &AuthorisationRequest) -> Result<bool> {
        let authorisation = self.validate_authorisation(request)?;

        match self.db.make_authorisation(&authorisation).await {
            Ok(transaction) => {
                self.metrics.authorisation_approved();
                info!(id = %transaction.id, "Authorisation approved");
                Ok(true)
            }
            Err(IssuerError::InsufficientFunds { required, available }) => {
                self.metrics.authorisation_declined();
                info!(%required, %available, "Authorisation declined");
                Ok(false)
            }
            Err(e) => {
                self.record_failure("make_authorisation", &e);
                Err(e)
            }
        }
    }

    /// Settle a pending authorisation.
    #[instrument(skip(self))]
    pub async fn set_presentment(
        &self,
        transaction_id: &str,
        settlement_amount: Decimal,
        settlement_currency: &str,
    ) -> Result<CardTransaction> {
        let settlement_currency = self.currency(settlement_currency)?;
        let transaction_id = scheme_transaction_id(transaction_id)?;
        let settlement_amount = validate_amount("settlement_amount", settlement_amount)?;

        let result = self
            .db
            .set_presentment(&transaction_id, Money::new(settlement_amount, settlement_currency))
            .await;
        match &result {
            Ok(transaction) => {
                self.metrics.presentment_recorded();
                info!(batch_id = ?transaction.presentment_batch_id, "Presentment settled");
            }
            Err(e) => self.record_failure("set_presentment", e),
        }
        result
    }

    /// Balance of the card's account in `currency`.
    pub async fn balance(&self, card_id: &str, currency: &str) -> Result<AccountBalance> {
        let currency = self.currency(currency)?;
        let card_id = CardId::new(card_id);
        if !card_id.is_valid() {
            return Err(invalid_card_id());
        }
        self.db.balance(&card_id, &currency).await
    }

    async fn provision_and_load(&self, card_id: &CardId, amount: Decimal, currency: &Currency) -> Result<Batch> {
        if !self.db.account_exists(card_id, currency).await? {
            match self.db.create_account(card_id, currency).await {
                Ok(_) => self.metrics.account_provisioned(),
                Err(IssuerError::DuplicateAccount { .. }) => {
                    debug!("Account created concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        self.db.load_money(card_id, amount, currency).await
    }

    fn validate_authorisation(&self, request: &AuthorisationRequest) -> Result<NewAuthorisation> {
        let billing_currency = self.currency(&request.billing_currency)?;
        let transaction_currency = self.currency(&request.transaction_currency)?;
        let card_id = cardholder_id(&request.card_id)?;
        let transaction_id = scheme_transaction_id(&request.transaction_id)?;
        let billing_amount = validate_amount("billing_amount", request.billing_amount)?;
        let transaction_amount = validate_amount("transaction_amount", request.transaction_amount)?;

        if request.merchant_mcc > MAX_MCC {
            return Err(IssuerError::invalid_input(
                "merchant_mcc",
                format!("must be at most {}", MAX_MCC),
            ));
        }
        if request.merchant_name.trim().is_empty() {
            return Err(IssuerError::invalid_input("merchant_name", "must not be empty"));
        }
        if request.merchant_country.trim().is_empty() {
            return Err(IssuerError::invalid_input("merchant_country", "must not be empty"));
        }

        Ok(NewAuthorisation {
            card_id,
            transaction_id,
            merchant_name: request.merchant_name.clone(),
            merchant_country: request.merchant_country.clone(),
            merchant_mcc: request.merchant_mcc as u16,
            billing_amount,
            billing_currency,
            transaction_amount,
            transaction_currency,
        })
    }

    fn currency(&self, code: &str) -> Result<Currency> {
        let currency = Currency::parse(code)?;
        if self.currencies.contains(&currency) {
            Ok(currency)
        } else {
            Err(IssuerError::InvalidCurrency(currency.code().to_string()))
        }
    }

    fn record_failure(&self, operation: &str, error: &IssuerError) {
        self.metrics.failure();
        warn!(operation, code = error.error_code(), error = %error, "Operation failed");
    }
}

fn invalid_card_id() -> IssuerError {
    IssuerError::invalid_input(
        "card_id",
        format!("must be 1 to {} characters without whitespace", cards_common::MAX_CARD_ID_LEN),
    )
}

fn cardholder_id(raw: &str) -> Result<CardId> {
    let card_id = CardId::new(raw);
    if !card_id.is_valid() {
        return Err(invalid_card_id());
    }
    if card_id.is_reserved() {
        return Err(IssuerError::invalid_input("card_id", "reserved for system accounts"));
    }
    Ok(card_id)
}

fn scheme_transaction_id(raw: &str) -> Result<TransactionId> {
    if raw.is_empty() || raw.chars().count() > MAX_TRANSACTION_ID_LEN {
        return Err(IssuerError::invalid_input(
            "transaction_id",
            format!("must be 1 to {} characters", MAX_TRANSACTION_ID_LEN),
        ));
    }
    Ok(TransactionId::new(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerIssuerDatabase;
    use crate::metrics::IssuerMetrics;
    use cards_ledger::MemoryLedgerStore;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn service() -> IssuerService {
        IssuerService::new(
            Arc::new(LedgerIssuerDatabase::new(MemoryLedgerStore::new())),
            vec![Currency::brl(), Currency::usd()],
            Arc::new(IssuerMetrics::new()),
        )
    }

    fn request(billing: Decimal) -> AuthorisationRequest {
        AuthorisationRequest {
            card_id: "CARD1".to_string(),
            transaction_id: "T1".to_string(),
            merchant_name: "SNEAKERS R US".to_string(),
            merchant_country: "US".to_string(),
            merchant_mcc: 5139,
            billing_amount: billing,
            billing_currency: "BRL".to_string(),
            transaction_amount: billing,
            transaction_currency: "BRL".to_string(),
        }
    }

    #[tokio::test]
    async fn test_invalid_currency() {
        let service = service();
        let err = service
            .load_money("CARD1", dec!(10), "INVALID_CURRENCY")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Currency \"INVALID_CURRENCY\" not available.");

        let mut req = request(dec!(10));
        req.transaction_currency = "JPY".to_string();
        let err = service.make_authorisation(&req).await.unwrap_err();
        assert!(matches!(err, IssuerError::InvalidCurrency(code) if code == "JPY"));
    }

    #[tokio::test]
    async fn test_currency_match_is_exact() {
        let service = service();
        for code in ["brl", "Brl", " BRL"] {
            let err = service.load_money("CARD1", dec!(10), code).await.unwrap_err();
            assert!(matches!(err, IssuerError::InvalidCurrency(ref c) if c == code), "{code:?}");
            assert!(service.balance("CARD1", code).await.is_err());
        }
        assert!(service.balance("CARD1", "BRL").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_reserved_and_malformed_card_ids() {
        let service = service();
        for card in [CardId::ISSUER, CardId::SCHEME, "", "CARD 1", "ELEVENCHARS"] {
            let err = service.load_money(card, dec!(10), "BRL").await.unwrap_err();
            assert!(err.is_validation(), "{card:?} accepted");
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_amounts() {
        let service = service();
        for amount in [dec!(0), dec!(-1), dec!(0.001), dec!(10000000)] {
            let err = service.load_money("CARD1", amount, "BRL").await.unwrap_err();
            assert!(matches!(err, IssuerError::InvalidInput { .. }), "{amount} accepted");
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_authorisation_fields() {
        let service = service();

        let mut req = request(dec!(10));
        req.merchant_mcc = 10000;
        assert!(service.make_authorisation(&req).await.unwrap_err().is_validation());

        let mut req = request(dec!(10));
        req.merchant_name = "  ".to_string();
        assert!(service.make_authorisation(&req).await.unwrap_err().is_validation());

        let mut req = request(dec!(10));
        req.transaction_id = "X".repeat(65);
        assert!(service.make_authorisation(&req).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_load_provisions_account_once() {
        let service = service();
        service.load_money("CARD1", dec!(10), "BRL").await.unwrap();
        service.load_money("CARD1", dec!(15.50), "BRL").await.unwrap();

        let balance = service.balance("CARD1", "BRL").await.unwrap();
        assert_eq!(balance.balance, dec!(25.50));

        let snapshot = service.metrics().snapshot();
        assert_eq!(snapshot.accounts_provisioned, 1);
        assert_eq!(snapshot.loads_total, 2);
    }

    #[tokio::test]
    async fn test_decline_is_false() {
        let service = service();
        service.load_money("CARD1", dec!(10), "BRL").await.unwrap();

        assert!(!service.make_authorisation(&request(dec!(10.01))).await.unwrap());
        assert!(service.make_authorisation(&request(dec!(10))).await.unwrap());

        let snapshot = service.metrics().snapshot();
        assert_eq!(snapshot.authorisations_declined, 1);
        assert_eq!(snapshot.authorisations_approved, 1);
    }

    #[tokio::test]
    async fn test_authorisation_without_account_fails() {
        let service = service();
        let err = service.make_authorisation(&request(dec!(1))).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(service.metrics().snapshot().failures_total, 1);
    }

    #[tokio::test]
    async fn test_unknown_presentment() {
        let service = service();
        let err = service.set_presentment("NOPE", dec!(1), "BRL").await.unwrap_err();
        assert!(matches!(err, IssuerError::AuthorisationNotFound(_)));
    }

    proptest! {
        #[test]
        fn prop_loads_accumulate(cents in proptest::collection::vec(1i64..=100_000, 1..8)) {
            let service = service();
            let expected: Decimal = cents.iter().map(|c| Decimal::new(*c, 2)).sum();

            let balance = tokio_test::block_on(async {
                for c in &cents {
                    service.load_money("CARD1", Decimal::new(*c, 2), "USD").await.unwrap();
                }
                service.balance("CARD1", "USD").await.unwrap()
            });

            prop_assert_eq!(balance.balance, expected);
        }
    }
}
