//! PostgreSQL-backed ledger store.
//!
//! Every unit of work is one database transaction at the default READ
//! COMMITTED isolation. Correctness under concurrency comes from row locks
//! and constraints rather than isolation level:
//!
//! | Hazard | Guard |
//! |--------|-------|
//! | Two authorisations both pass the funds check | `lock_account` takes `FOR NO KEY UPDATE` on the account row before the balance query |
//! | Two presentments of one authorisation | `lock_authorisation` takes `FOR UPDATE`; the loser re-evaluates `transaction_type` and finds nothing |
//! | Duplicate system accounts | `UNIQUE (card_id, currency)` plus `ON CONFLICT DO NOTHING` |
//! | Duplicate pending authorisations | partial unique index on `transaction_id`; an insert racing a presentment of the same id waits for it instead of locking the row |
//!
//! The account lock is `NO KEY UPDATE` so it never conflicts with the
//! `KEY SHARE` lock foreign keys take when journals are posted against the
//! same account by a concurrent presentment.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | IssuerError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) on `accounts` | `23505` | `DuplicateAccount` |
//! | Database (unique violation) on `card_transactions` | `23505` | `DuplicateAuthorisation` |
//! | Anything else | any | `Database` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use cards_common::{
    AccountId, BatchId, CardId, Currency, IssuerError, Result, TransactionId,
};

use crate::account::Account;
use crate::balance::{AccountBalance, BalanceCalculator};
use crate::journal::{Batch, Journal};
use crate::store::{LedgerStore, LedgerTx};
use crate::transaction::{CardTransaction, TransactionType};

/// Ledger store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        info!(max_connections, "Connected to ledger database");
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| IssuerError::Database(format!("migrate: {}", e)))?;
        info!("Ledger migrations applied");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<PgLedgerTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgLedgerTx { tx })
    }
}

/// Unit of work over a [`PgLedgerStore`]. Rolled back by sqlx when dropped
/// uncommitted.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn find_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, card_id, currency, created_at
            FROM accounts
            WHERE card_id = $1 AND currency = $2
            "#,
        )
        .bind(card_id.as_str())
        .bind(currency.code())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_account", e))?;

        row.map(|r| account_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_account", e))
    }

    #[instrument(skip(self), fields(card_id = %card_id, currency = %currency))]
    async fn lock_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, card_id, currency, created_at
            FROM accounts
            WHERE card_id = $1 AND currency = $2
            FOR NO KEY UPDATE
            "#,
        )
        .bind(card_id.as_str())
        .bind(currency.code())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_account", e))?;

        row.map(|r| account_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_account", e))
    }

    async fn insert_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        let account = Account::new(card_id.clone(), currency.clone());

        sqlx::query(
            r#"
            INSERT INTO accounts (id, card_id, currency, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(*account.id.as_uuid())
        .bind(account.card_id.as_str())
        .bind(account.currency.code())
        .bind(account.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                IssuerError::DuplicateAccount {
                    card_id: card_id.clone(),
                    currency: currency.clone(),
                }
            } else {
                map_sqlx_error("insert_account", e)
            }
        })?;

        Ok(account)
    }

    async fn get_or_create_account(&mut self, card_id: &CardId, currency: &Currency) -> Result<Account> {
        let candidate = Account::new(card_id.clone(), currency.clone());

        // A concurrent creator makes this insert wait for its commit and then
        // do nothing; the follow-up read sees the committed row.
        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, card_id, currency, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (card_id, currency) DO NOTHING
            RETURNING id, card_id, currency, created_at
            "#,
        )
        .bind(*candidate.id.as_uuid())
        .bind(candidate.card_id.as_str())
        .bind(candidate.currency.code())
        .bind(candidate.created_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_account", e))?;

        if let Some(row) = inserted {
            debug!(card_id = %card_id, currency = %currency, "Account provisioned");
            return account_from_row(&row).map_err(|e| map_sqlx_error("decode_account", e));
        }

        self.find_account(card_id, currency).await?.ok_or_else(|| {
            IssuerError::Database(format!(
                "account {}:{} vanished after conflicting insert",
                card_id, currency
            ))
        })
    }

    async fn balance(&mut self, account: &Account) -> Result<AccountBalance> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(
                    (SELECT SUM(j.amount) FROM journals j WHERE j.account_id = $1),
                    0
                )::NUMERIC AS journals_sum,
                COALESCE(
                    (SELECT SUM(t.billing_amount)
                     FROM card_transactions t
                     WHERE t.account_id = $1 AND t.transaction_type = 'authorisation'),
                    0
                )::NUMERIC AS authorisations_sum
            "#,
        )
        .bind(*account.id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;

        let journals_sum: Decimal = row
            .try_get("journals_sum")
            .map_err(|e| map_sqlx_error("decode_balance", e))?;
        let authorisations_sum: Decimal = row
            .try_get("authorisations_sum")
            .map_err(|e| map_sqlx_error("decode_balance", e))?;

        Ok(BalanceCalculator::from_sums(account, journals_sum, authorisations_sum))
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id, journals = batch.journals.len()))]
    async fn insert_batch(&mut self, batch: &Batch) -> Result<()> {
        batch.ensure_balanced()?;

        sqlx::query(
            r#"
            INSERT INTO batches (id, description, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(*batch.id.as_uuid())
        .bind(batch.description.as_deref())
        .bind(batch.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_batch", e))?;

        for (position, journal) in batch.journals.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO journals (id, batch_id, position, account_id, amount, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(journal.id)
            .bind(*journal.batch_id.as_uuid())
            .bind(position as i16)
            .bind(*journal.account_id.as_uuid())
            .bind(journal.amount)
            .bind(journal.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_journal", e))?;
        }

        Ok(())
    }

    async fn find_batch(&mut self, batch_id: BatchId) -> Result<Option<Batch>> {
        let row = sqlx::query(
            r#"
            SELECT id, description, created_at
            FROM batches
            WHERE id = $1
            "#,
        )
        .bind(*batch_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_batch", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let journal_rows = sqlx::query(
            r#"
            SELECT id, batch_id, account_id, amount, created_at
            FROM journals
            WHERE batch_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(*batch_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_journals", e))?;

        let journals = journal_rows
            .iter()
            .map(journal_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("decode_journal", e))?;

        let decode = |e| map_sqlx_error("decode_batch", e);
        Ok(Some(Batch {
            id: BatchId::from_uuid(row.try_get("id").map_err(decode)?),
            description: row.try_get("description").map_err(decode)?,
            journals,
            created_at: row.try_get("created_at").map_err(decode)?,
        }))
    }

    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.transaction_id))]
    async fn insert_transaction(&mut self, transaction: &CardTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO card_transactions (
                id,
                account_id,
                transaction_id,
                transaction_type,
                merchant_name,
                merchant_country,
                merchant_mcc,
                billing_amount,
                billing_currency,
                transaction_amount,
                transaction_currency,
                settlement_amount,
                settlement_currency,
                presentment_batch_id,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(transaction.id)
        .bind(*transaction.account_id.as_uuid())
        .bind(transaction.transaction_id.as_str())
        .bind(transaction.transaction_type.as_str())
        .bind(&transaction.merchant_name)
        .bind(&transaction.merchant_country)
        .bind(i32::from(transaction.merchant_mcc))
        .bind(transaction.billing_amount)
        .bind(transaction.billing_currency.code())
        .bind(transaction.transaction_amount)
        .bind(transaction.transaction_currency.code())
        .bind(transaction.settlement_amount)
        .bind(transaction.settlement_currency.as_ref().map(|c| c.code()))
        .bind(transaction.presentment_batch_id.map(|b| *b.as_uuid()))
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                IssuerError::DuplicateAuthorisation(transaction.transaction_id.clone())
            } else {
                map_sqlx_error("insert_transaction", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn lock_authorisation(&mut self, transaction_id: &TransactionId) -> Result<Option<CardTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                account_id,
                transaction_id,
                transaction_type,
                merchant_name,
                merchant_country,
                merchant_mcc,
                billing_amount,
                billing_currency,
                transaction_amount,
                transaction_currency,
                settlement_amount,
                settlement_currency,
                presentment_batch_id,
                created_at,
                updated_at
            FROM card_transactions
            WHERE transaction_id = $1 AND transaction_type = 'authorisation'
            FOR UPDATE
            "#,
        )
        .bind(transaction_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_authorisation", e))?;

        row.map(|r| transaction_from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_transaction", e))
    }

    async fn update_transaction(&mut self, transaction: &CardTransaction) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE card_transactions
            SET transaction_type = $2,
                settlement_amount = $3,
                settlement_currency = $4,
                presentment_batch_id = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.settlement_amount)
        .bind(transaction.settlement_currency.as_ref().map(|c| c.code()))
        .bind(transaction.presentment_batch_id.map(|b| *b.as_uuid()))
        .bind(transaction.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                IssuerError::DuplicateAuthorisation(transaction.transaction_id.clone())
            } else {
                map_sqlx_error("update_transaction", e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(IssuerError::Database(format!(
                "transaction row {} not found",
                transaction.id
            )));
        }
        Ok(())
    }

    async fn account_transactions(&mut self, account_id: AccountId) -> Result<Vec<CardTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                account_id,
                transaction_id,
                transaction_type,
                merchant_name,
                merchant_country,
                merchant_mcc,
                billing_amount,
                billing_currency,
                transaction_amount,
                transaction_currency,
                settlement_amount,
                settlement_currency,
                presentment_batch_id,
                created_at,
                updated_at
            FROM card_transactions
            WHERE account_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(*account_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("account_transactions", e))?;

        rows.iter()
            .map(transaction_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("decode_transaction", e))
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

fn account_from_row(row: &PgRow) -> std::result::Result<Account, sqlx::Error> {
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id")?),
        card_id: CardId::new(row.try_get::<String, _>("card_id")?),
        currency: Currency::new(row.try_get::<String, _>("currency")?),
        created_at: row.try_get("created_at")?,
    })
}

fn journal_from_row(row: &PgRow) -> std::result::Result<Journal, sqlx::Error> {
    Ok(Journal {
        id: row.try_get("id")?,
        batch_id: BatchId::from_uuid(row.try_get("batch_id")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> std::result::Result<CardTransaction, sqlx::Error> {
    let transaction_type = row
        .try_get::<String, _>("transaction_type")?
        .parse::<TransactionType>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;
    let merchant_mcc = u16::try_from(row.try_get::<i32, _>("merchant_mcc")?)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let presentment_batch_id: Option<Uuid> = row.try_get("presentment_batch_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(CardTransaction {
        id: row.try_get("id")?,
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        transaction_id: TransactionId::new(row.try_get::<String, _>("transaction_id")?),
        transaction_type,
        merchant_name: row.try_get("merchant_name")?,
        merchant_country: row.try_get("merchant_country")?,
        merchant_mcc,
        billing_amount: row.try_get("billing_amount")?,
        billing_currency: Currency::new(row.try_get::<String, _>("billing_currency")?),
        transaction_amount: row.try_get("transaction_amount")?,
        transaction_currency: Currency::new(row.try_get::<String, _>("transaction_currency")?),
        settlement_amount: row.try_get("settlement_amount")?,
        settlement_currency: row
            .try_get::<Option<String>, _>("settlement_currency")?
            .map(Currency::new),
        presentment_batch_id: presentment_batch_id.map(BatchId::from_uuid),
        created_at,
        updated_at,
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> IssuerError {
    IssuerError::Database(format!("{}: {}", operation, error))
}
