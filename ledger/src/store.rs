//! Transaction executor and the caller-facing ledger seam.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error};

use tallybank_common::{AccountId, BankError, Context, EntryId, Result, TransferId};

use crate::models::*;
use crate::queries::{Backend, Queries, Transaction};
use crate::transfer::{TransferTxParams, TransferTxResult};
use crate::user::{CreateUserTxParams, CreateUserTxResult};

/// Long-lived handle to a record store.
///
/// Construct one per process and pass it (usually behind an `Arc`) to the
/// components that need it; call [`Ledger::close`] on shutdown.
pub struct Store<B: Backend> {
    backend: B,
    /// Applied to every transaction whose context has no earlier deadline.
    transaction_timeout: Option<Duration>,
}

impl<B: Backend> Store<B> {
    /// Create a store over an open backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            transaction_timeout: None,
        }
    }

    /// Bound the duration of every transaction.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }

    /// Get the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `op` inside one database transaction.
    ///
    /// Commits when `op` succeeds and rolls back when it fails or when `ctx`
    /// is done before the commit. A failed rollback is reported together with
    /// the error that caused it.
    pub async fn exec_tx<T, F>(&self, ctx: &Context, op: F) -> Result<T>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut B::Tx) -> BoxFuture<'q, Result<T>> + Send,
    {
        let ctx = match self.transaction_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let mut tx = ctx.run(self.backend.begin()).await?;

        let outcome = match ctx.run(op(&mut tx)).await {
            Ok(value) => ctx.check().map(|()| value),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "Rolling back transaction");
                match tx.rollback().await {
                    Ok(()) => Err(err),
                    Err(rollback) => {
                        error!(error = %err, rollback_error = %rollback, "Rollback failed");
                        Err(BankError::RollbackFailed {
                            source: Box::new(err),
                            rollback: Box::new(rollback),
                        })
                    }
                }
            }
        }
    }
}

/// Ledger operations offered to request handlers and workers.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Move `amount` between two accounts atomically.
    async fn transfer_tx(&self, ctx: &Context, arg: TransferTxParams) -> Result<TransferTxResult>;

    /// Create a user; the user only survives if `after_create` succeeds.
    async fn create_user_tx(
        &self,
        ctx: &Context,
        arg: CreateUserTxParams,
    ) -> Result<CreateUserTxResult>;

    async fn create_account(&self, ctx: &Context, params: CreateAccountParams) -> Result<Account>;

    async fn get_account(&self, ctx: &Context, id: AccountId) -> Result<Account>;

    async fn list_accounts(
        &self,
        ctx: &Context,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>>;

    async fn get_transfer(&self, ctx: &Context, id: TransferId) -> Result<Transfer>;

    async fn get_entry(&self, ctx: &Context, id: EntryId) -> Result<Entry>;

    async fn get_user(&self, ctx: &Context, username: &str) -> Result<User>;

    /// Shut the store down.
    async fn close(&self);
}

#[async_trait]
impl<B: Backend> Ledger for Store<B> {
    async fn transfer_tx(&self, ctx: &Context, arg: TransferTxParams) -> Result<TransferTxResult> {
        Store::transfer_tx(self, ctx, arg).await
    }

    async fn create_user_tx(
        &self,
        ctx: &Context,
        arg: CreateUserTxParams,
    ) -> Result<CreateUserTxResult> {
        Store::create_user_tx(self, ctx, arg).await
    }

    async fn create_account(&self, ctx: &Context, params: CreateAccountParams) -> Result<Account> {
        if !params.currency.is_supported() {
            return Err(BankError::invalid_argument(
                "currency",
                format!("unsupported currency {}", params.currency),
            ));
        }
        self.exec_tx(ctx, move |q| {
            Box::pin(async move { q.create_account(params).await })
        })
        .await
    }

    async fn get_account(&self, ctx: &Context, id: AccountId) -> Result<Account> {
        self.exec_tx(ctx, move |q| Box::pin(async move { q.get_account(id).await }))
            .await
    }

    async fn list_accounts(
        &self,
        ctx: &Context,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>> {
        self.exec_tx(ctx, move |q| {
            Box::pin(async move { q.list_accounts(params).await })
        })
        .await
    }

    async fn get_transfer(&self, ctx: &Context, id: TransferId) -> Result<Transfer> {
        self.exec_tx(ctx, move |q| Box::pin(async move { q.get_transfer(id).await }))
            .await
    }

    async fn get_entry(&self, ctx: &Context, id: EntryId) -> Result<Entry> {
        self.exec_tx(ctx, move |q| Box::pin(async move { q.get_entry(id).await }))
            .await
    }

    async fn get_user(&self, ctx: &Context, username: &str) -> Result<User> {
        let username = username.to_owned();
        self.exec_tx(ctx, move |q| {
            Box::pin(async move { q.get_user(&username).await })
        })
        .await
    }

    async fn close(&self) {
        self.backend.close().await;
    }
}
