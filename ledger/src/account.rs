//! Account definitions for ledger.

use cards_common::{AccountId, CardId, Currency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System accounts provisioned lazily, one per currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemAccount {
    Issuer,
    Scheme,
}

impl SystemAccount {
    /// Reserved card id the account is stored under.
    pub fn card_id(&self) -> CardId {
        match self {
            SystemAccount::Issuer => CardId::new(CardId::ISSUER),
            SystemAccount::Scheme => CardId::new(CardId::SCHEME),
        }
    }
}

/// A ledger account. Unique per (card id, currency); it never stores a
/// balance, see [`crate::balance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Card the account belongs to.
    pub card_id: CardId,
    /// Account currency.
    pub currency: Currency,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account.
    pub fn new(card_id: CardId, currency: Currency) -> Self {
        Self {
            id: AccountId::new(),
            card_id,
            currency,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_account_card_ids() {
        let issuer = Account::new(SystemAccount::Issuer.card_id(), Currency::brl());
        assert_eq!(issuer.card_id.as_str(), CardId::ISSUER);
        assert!(issuer.card_id.is_reserved());

        let scheme = Account::new(SystemAccount::Scheme.card_id(), Currency::usd());
        assert_eq!(scheme.card_id.as_str(), CardId::SCHEME);
        assert_ne!(issuer.id, scheme.id);
    }
}
