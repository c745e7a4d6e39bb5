//! Random fixtures shared by the ledger tests.

use rand::distributions::Alphanumeric;
use rand::Rng;

use tallybank_common::{Context, Currency};

use crate::models::{Account, CreateAccountParams, CreateUserParams, User};
use crate::store::Ledger;
use crate::user::CreateUserTxParams;

pub(crate) fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

pub(crate) fn random_money() -> i64 {
    rand::thread_rng().gen_range(100..=1_000)
}

pub(crate) fn random_user_params() -> CreateUserParams {
    let username = random_string(12);
    CreateUserParams {
        email: format!("{username}@example.com"),
        full_name: random_string(8),
        hashed_password: random_string(32),
        username,
    }
}

pub(crate) async fn create_random_user(ledger: &dyn Ledger) -> User {
    let ctx = Context::background();
    let result = ledger
        .create_user_tx(&ctx, CreateUserTxParams::without_callback(random_user_params()))
        .await
        .expect("create user");
    result.user
}

/// Create a USD account with a random balance owned by a new user.
pub(crate) async fn create_random_account(ledger: &dyn Ledger) -> Account {
    create_account_with_balance(ledger, random_money()).await
}

pub(crate) async fn create_account_with_balance(ledger: &dyn Ledger, balance: i64) -> Account {
    create_account_in(ledger, balance, Currency::usd()).await
}

pub(crate) async fn create_account_in(
    ledger: &dyn Ledger,
    balance: i64,
    currency: Currency,
) -> Account {
    let user = create_random_user(ledger).await;
    ledger
        .create_account(
            &Context::background(),
            CreateAccountParams {
                owner: user.username,
                balance,
                currency,
            },
        )
        .await
        .expect("create account")
}
