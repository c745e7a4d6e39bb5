//! PostgreSQL record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{info, instrument};

use tallybank_common::{AccountId, BankError, Currency, EntryId, Result, TransferId};

use crate::config::LedgerConfig;
use crate::models::*;
use crate::queries::{Backend, Queries, Transaction};
use crate::store::Store;

/// A store backed by [`PgBackend`].
pub type PgStore = Store<PgBackend>;

impl Store<PgBackend> {
    /// Connect to the database named by `config` and apply its transaction timeout.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let backend = PgBackend::connect(config).await?;
        if config.run_migrations {
            backend.migrate().await?;
        }
        let store = Store::new(backend);
        Ok(match config.transaction_timeout {
            Some(timeout) => store.with_transaction_timeout(timeout),
            None => store,
        })
    }
}

/// Connection pool over the ledger schema.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Open a connection pool.
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| BankError::ConfigurationError("database URL not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| BankError::DatabaseError(format!("connect: {e}")))?;

        info!("Connected to database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BankError::DatabaseError(format!("migrate: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transaction", "begin", e))?;
        Ok(PgTx { tx })
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

/// A transaction on a [`PgBackend`].
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, password_changed_at, created_at";

#[async_trait]
impl Queries for PgTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        );
        sqlx::query_as::<_, AccountRow>(&sql)
            .bind(&params.owner)
            .bind(params.balance)
            .bind(params.currency.code())
            .fetch_one(&mut *self.tx)
            .await
            .map(Account::from)
            .map_err(|e| map_sqlx_error("account", &params.owner, e))
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, AccountRow>(&sql)
            .bind(id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map(Account::from)
            .map_err(|e| map_sqlx_error("account", id, e))
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        let sql =
            format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE");
        sqlx::query_as::<_, AccountRow>(&sql)
            .bind(id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map(Account::from)
            .map_err(|e| map_sqlx_error("account", id, e))
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> Result<Vec<Account>> {
        if params.limit < 0 || params.offset < 0 {
            return Err(BankError::invalid_argument(
                "limit",
                "limit and offset must not be negative",
            ));
        }
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(&params.owner)
            .bind(params.limit)
            .bind(params.offset)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("account", &params.owner, e))?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn add_account_balance(&mut self, params: AddAccountBalanceParams) -> Result<Account> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        );
        sqlx::query_as::<_, AccountRow>(&sql)
            .bind(params.amount)
            .bind(params.id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map(Account::from)
            .map_err(|e| map_sqlx_error("account", params.id, e))
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        );
        sqlx::query_as::<_, EntryRow>(&sql)
            .bind(params.account_id.get())
            .bind(params.amount)
            .fetch_one(&mut *self.tx)
            .await
            .map(Entry::from)
            .map_err(|e| map_sqlx_error("entry", params.account_id, e))
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, EntryRow>(&sql)
            .bind(id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map(Entry::from)
            .map_err(|e| map_sqlx_error("entry", id, e))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        let sql = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        );
        sqlx::query_as::<_, TransferRow>(&sql)
            .bind(params.from_account_id.get())
            .bind(params.to_account_id.get())
            .bind(params.amount)
            .fetch_one(&mut *self.tx)
            .await
            .map(Transfer::from)
            .map_err(|e| map_sqlx_error("transfer", params.from_account_id, e))
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1");
        sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map(Transfer::from)
            .map_err(|e| map_sqlx_error("transfer", id, e))
    }

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User> {
        let sql = format!(
            "INSERT INTO users (username, hashed_password, full_name, email) VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(&params.username)
            .bind(&params.hashed_password)
            .bind(&params.full_name)
            .bind(&params.email)
            .fetch_one(&mut *self.tx)
            .await
            .map(User::from)
            .map_err(|e| map_sqlx_error("user", &params.username, e))
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1");
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(username)
            .fetch_one(&mut *self.tx)
            .await
            .map(User::from)
            .map_err(|e| map_sqlx_error("user", username, e))
    }
}

#[async_trait]
impl Transaction for PgTx {
    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("transaction", "commit", e))
    }

    async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("transaction", "rollback", e))
    }
}

/// Translate a driver error into the ledger taxonomy.
fn map_sqlx_error(entity: &'static str, key: impl ToString, err: sqlx::Error) -> BankError {
    match err {
        sqlx::Error::RowNotFound => BankError::not_found(entity, key),
        sqlx::Error::PoolClosed => BankError::StoreClosed,
        sqlx::Error::Database(db_err) => {
            let constraint = db_err.constraint().unwrap_or_default().to_string();
            match db_err.code().as_deref() {
                Some("23505") => BankError::AlreadyExists { entity, constraint },
                Some("23503") => BankError::ForeignKeyViolation { constraint },
                Some("23514") => BankError::InvalidArgument {
                    message: db_err.message().to_string(),
                    field: None,
                },
                Some("40P01") => BankError::Deadlock(db_err.message().to_string()),
                _ => BankError::DatabaseError(db_err.to_string()),
            }
        }
        other => BankError::DatabaseError(other.to_string()),
    }
}

// SQLx row types

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: i64,
    owner: String,
    balance: i64,
    currency: String,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: AccountId::new(row.id),
            owner: row.owner,
            balance: row.balance,
            currency: Currency::new(row.currency),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: i64,
    account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for Entry {
    fn from(row: EntryRow) -> Self {
        Self {
            id: EntryId::new(row.id),
            account_id: AccountId::new(row.account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransferRow {
    id: i64,
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<TransferRow> for Transfer {
    fn from(row: TransferRow) -> Self {
        Self {
            id: TransferId::new(row.id),
            from_account_id: AccountId::new(row.from_account_id),
            to_account_id: AccountId::new(row.to_account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    username: String,
    hashed_password: String,
    full_name: String,
    email: String,
    password_changed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            username: row.username,
            hashed_password: row.hashed_password,
            full_name: row.full_name,
            email: row.email,
            password_changed_at: row.password_changed_at,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = map_sqlx_error("account", AccountId::new(7), sqlx::Error::RowNotFound);
        match err {
            BankError::NotFound { entity, key } => {
                assert_eq!(entity, "account");
                assert_eq!(key, "7");
            }
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn test_pool_closed_maps_to_store_closed() {
        let err = map_sqlx_error("transaction", "begin", sqlx::Error::PoolClosed);
        assert!(matches!(err, BankError::StoreClosed));
    }

    #[test]
    fn test_other_errors_map_to_database_error() {
        let err = map_sqlx_error("transaction", "begin", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, BankError::DatabaseError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_account_row_conversion() {
        let row = AccountRow {
            id: 3,
            owner: "alice".to_string(),
            balance: 250,
            currency: "usd".to_string(),
            created_at: Utc::now(),
        };
        let account = Account::from(row);
        assert_eq!(account.id, AccountId::new(3));
        assert_eq!(account.currency, Currency::usd());
    }
}
