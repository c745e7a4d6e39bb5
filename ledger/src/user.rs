//! Atomic user creation with a post-insert callback.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{info, instrument};

use tallybank_common::{Context, Result};

use crate::models::{CreateUserParams, User};
use crate::queries::{Backend, Queries};
use crate::store::Store;

/// Callback run with the inserted, not yet committed, user.
///
/// An error from the callback rolls the insert back.
pub type AfterCreate = Box<dyn FnOnce(User) -> BoxFuture<'static, Result<()>> + Send>;

/// Input of [`Store::create_user_tx`].
pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreate,
}

impl CreateUserTxParams {
    pub fn new<F, Fut>(params: CreateUserParams, after_create: F) -> Self
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            params,
            after_create: Box::new(move |user| Box::pin(after_create(user))),
        }
    }

    /// Create the user with a callback that always succeeds.
    pub fn without_callback(params: CreateUserParams) -> Self {
        Self::new(params, |_| async { Ok(()) })
    }
}

impl fmt::Debug for CreateUserTxParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateUserTxParams")
            .field("username", &self.params.username)
            .field("email", &self.params.email)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateUserTxResult {
    pub user: User,
}

impl<B: Backend> Store<B> {
    /// Insert a user and run `arg.after_create` in the same transaction.
    #[instrument(skip(self, ctx))]
    pub async fn create_user_tx(
        &self,
        ctx: &Context,
        arg: CreateUserTxParams,
    ) -> Result<CreateUserTxResult> {
        let CreateUserTxParams {
            params,
            after_create,
        } = arg;

        let user = self
            .exec_tx(ctx, move |q| {
                Box::pin(async move {
                    let user = q.create_user(params).await?;
                    after_create(user.clone()).await?;
                    Ok(user)
                })
            })
            .await?;

        info!(username = %user.username, "User created");
        Ok(CreateUserTxResult { user })
    }
}
