//! Simulated bank customers.

use std::sync::Arc;

use tallybank_common::{Context, Currency};
use tallybank_ledger::{Account, CreateAccountParams, CreateUserParams, Ledger, User};
use tallybank_worker::{create_user_with_verify_email, TaskDistributor, TaskOptions};

/// A registered user with one open account.
#[derive(Debug, Clone)]
pub struct Customer {
    pub user: User,
    pub account: Account,
}

/// Creates customers through the ledger.
pub struct CustomerFactory {
    ledger: Arc<dyn Ledger>,
    distributor: Arc<dyn TaskDistributor>,
    verify_email: TaskOptions,
}

impl CustomerFactory {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        distributor: Arc<dyn TaskDistributor>,
        verify_email: TaskOptions,
    ) -> Self {
        Self {
            ledger,
            distributor,
            verify_email,
        }
    }

    /// Register `count` users and open a USD account for each.
    ///
    /// `run_id` keeps usernames unique across runs against the same database.
    pub async fn create_customers(
        &self,
        ctx: &Context,
        run_id: &str,
        count: usize,
        initial_balance: i64,
    ) -> anyhow::Result<Vec<Customer>> {
        let names = [
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy",
        ];

        let mut customers = Vec::with_capacity(count);
        for i in 0..count {
            let name = match names.get(i) {
                Some(name) => name.to_string(),
                None => format!("customer{}", i + 1),
            };
            let username = format!("{name}_{run_id}");

            let params = CreateUserParams {
                email: format!("{username}@tallybank.test"),
                full_name: name,
                hashed_password: format!("sim-hash-{username}"),
                username,
            };
            let arg = create_user_with_verify_email(
                params,
                self.distributor.clone(),
                ctx.clone(),
                self.verify_email.clone(),
            );
            let user = self.ledger.create_user_tx(ctx, arg).await?.user;

            let account = self
                .ledger
                .create_account(
                    ctx,
                    CreateAccountParams {
                        owner: user.username.clone(),
                        balance: initial_balance,
                        currency: Currency::usd(),
                    },
                )
                .await?;

            customers.push(Customer { user, account });
        }

        Ok(customers)
    }
}
