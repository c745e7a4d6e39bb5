//! Record-store contract.
//!
//! `Queries` is the set of single-row primitives. A `Backend` opens
//! transactions; a `Transaction` is a transaction-scoped `Queries` that is
//! finished by exactly one of `commit` or `rollback`. Dropping an unfinished
//! transaction rolls it back.

use async_trait::async_trait;

use tallybank_common::{AccountId, EntryId, Result, TransferId};

use crate::models::*;

/// Row-level primitives of the ledger record store.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account>;

    async fn get_account(&mut self, id: AccountId) -> Result<Account>;

    /// Read an account and hold its row lock until the transaction ends.
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account>;

    async fn list_accounts(&mut self, params: ListAccountsParams) -> Result<Vec<Account>>;

    /// Add a signed delta to an account balance under the row lock and
    /// return the updated row.
    async fn add_account_balance(&mut self, params: AddAccountBalanceParams) -> Result<Account>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry>;

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer>;

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User>;

    async fn get_user(&mut self, username: &str) -> Result<User>;
}

/// A transaction-scoped handle to the record store.
#[async_trait]
pub trait Transaction: Queries + Sized {
    /// Make every write of this transaction durable and visible.
    async fn commit(self) -> Result<()>;

    /// Discard every write of this transaction.
    async fn rollback(self) -> Result<()>;
}

/// A record store able to open transactions.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Tx: Transaction + 'static;

    async fn begin(&self) -> Result<Self::Tx>;

    /// Release pooled resources; later calls to `begin` fail.
    async fn close(&self);
}
