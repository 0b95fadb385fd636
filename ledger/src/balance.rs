//! Derived account balances.
//!
//! Accounts never store a balance. It is always computed from the account's
//! journals, minus the funds held by authorisations that have not been
//! presented yet:
//!
//! ```text
//! balance = sum(journal.amount) - sum(pending authorisation billing_amount)
//! ```

use cards_common::{to_ledger_scale, AccountId, Currency};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::Account;

/// Account balance at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Currency.
    pub currency: Currency,
    /// Sum of every journal posted against the account.
    pub journals_sum: Decimal,
    /// Billing amounts held by pending authorisations.
    pub authorisations_sum: Decimal,
    /// Spendable balance.
    pub balance: Decimal,
    /// When this balance was computed.
    pub calculated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Check if account has sufficient funds for a transaction.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

/// Computes [`AccountBalance`]s from aggregates.
///
/// Stores feed it either database aggregates (`SUM` coalesced to zero) or
/// amounts gathered from their per-account indexes.
pub struct BalanceCalculator;

impl BalanceCalculator {
    /// Build a balance from already aggregated sums.
    pub fn from_sums(
        account: &Account,
        journals_sum: Decimal,
        authorisations_sum: Decimal,
    ) -> AccountBalance {
        let journals_sum = to_ledger_scale(journals_sum);
        let authorisations_sum = to_ledger_scale(authorisations_sum);

        AccountBalance {
            account_id: account.id,
            currency: account.currency.clone(),
            journals_sum,
            authorisations_sum,
            balance: journals_sum - authorisations_sum,
            calculated_at: Utc::now(),
        }
    }

    /// Aggregate journal amounts and pending authorisation amounts.
    pub fn compute<J, A>(account: &Account, journals: J, authorisations: A) -> AccountBalance
    where
        J: IntoIterator<Item = Decimal>,
        A: IntoIterator<Item = Decimal>,
    {
        Self::from_sums(
            account,
            journals.into_iter().sum(),
            authorisations.into_iter().sum(),
        )
    }
}
