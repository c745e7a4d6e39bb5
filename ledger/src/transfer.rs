//! Money-transfer engine.
//!
//! A transfer inserts one transfer row and two balancing entries, then adjusts
//! both balances. The adjustments always run lower account id first, so two
//! transfers between the same pair of accounts take their row locks in the
//! same order whatever their direction, and can never wait on each other in a
//! cycle.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use tallybank_common::{AccountId, BankError, Context, Result};

use crate::models::*;
use crate::queries::{Backend, Queries};
use crate::store::Store;

/// Input of [`Store::transfer_tx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Minor units; must be positive.
    pub amount: i64,
}

impl TransferTxParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> Result<()> {
        if self.from_account_id == self.to_account_id {
            return Err(BankError::invalid_argument(
                "to_account_id",
                "cannot transfer to the same account",
            ));
        }
        if self.amount <= 0 {
            return Err(BankError::invalid_argument(
                "amount",
                "amount must be positive",
            ));
        }
        Ok(())
    }
}

/// Rows written by a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    /// Source account as committed by this transfer.
    pub from_account: Account,
    /// Destination account as committed by this transfer.
    pub to_account: Account,
}

/// One signed balance change of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAdjustment {
    pub account_id: AccountId,
    pub delta: i64,
}

/// Order the two adjustments of a transfer by ascending account id.
pub fn lock_order(arg: &TransferTxParams) -> [BalanceAdjustment; 2] {
    let debit = BalanceAdjustment {
        account_id: arg.from_account_id,
        delta: -arg.amount,
    };
    let credit = BalanceAdjustment {
        account_id: arg.to_account_id,
        delta: arg.amount,
    };
    if arg.from_account_id < arg.to_account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

async fn add_money<Q: Queries + ?Sized>(
    q: &mut Q,
    first: BalanceAdjustment,
    second: BalanceAdjustment,
) -> Result<(Account, Account)> {
    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first.account_id,
            amount: first.delta,
        })
        .await?;
    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second.account_id,
            amount: second.delta,
        })
        .await?;
    Ok((first, second))
}

/// Apply both adjustments in lock order and return `(from, to)`.
async fn adjust_balances<Q: Queries + ?Sized>(
    q: &mut Q,
    arg: &TransferTxParams,
) -> Result<(Account, Account)> {
    let [first, second] = lock_order(arg);
    let (first, second) = add_money(q, first, second).await?;
    if first.id == arg.from_account_id {
        Ok((first, second))
    } else {
        Ok((second, first))
    }
}

impl<B: Backend> Store<B> {
    /// Move `arg.amount` from one account to another in one transaction.
    ///
    /// Fails without side effects when either account is missing, the
    /// currencies differ, or the source balance would go negative.
    #[instrument(skip(self, ctx), fields(from = %arg.from_account_id, to = %arg.to_account_id, amount = arg.amount))]
    pub async fn transfer_tx(&self, ctx: &Context, arg: TransferTxParams) -> Result<TransferTxResult> {
        arg.validate()?;

        let result = self
            .exec_tx(ctx, move |q| {
                Box::pin(async move {
                    let transfer = q
                        .create_transfer(CreateTransferParams {
                            from_account_id: arg.from_account_id,
                            to_account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let from_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.from_account_id,
                            amount: -arg.amount,
                        })
                        .await?;

                    let to_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let (from_account, to_account) = adjust_balances(q, &arg).await?;

                    if from_account.currency != to_account.currency {
                        return Err(BankError::CurrencyMismatch {
                            from_account: from_account.id,
                            from_currency: from_account.currency,
                            to_account: to_account.id,
                            to_currency: to_account.currency,
                        });
                    }

                    if from_account.balance < 0 {
                        return Err(BankError::InsufficientFunds {
                            account_id: from_account.id,
                            balance: from_account.balance + arg.amount,
                            required: arg.amount,
                        });
                    }

                    Ok(TransferTxResult {
                        transfer,
                        from_entry,
                        to_entry,
                        from_account,
                        to_account,
                    })
                })
            })
            .await;

        match &result {
            Ok(result) => info!(transfer_id = %result.transfer.id, "Transfer committed"),
            Err(err) => warn!(error = %err, code = err.error_code(), "Transfer failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use tallybank_common::Currency;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::memory::{MemoryBackend, MemoryStore};
    use crate::queries::Transaction;
    use crate::store::Ledger;
    use crate::testutil::{create_account_in, create_account_with_balance, create_random_account};

    #[tokio::test]
    async fn test_concurrent_transfers_same_direction() {
        let store = Arc::new(MemoryStore::in_memory());
        let ctx = Context::background();
        let account1 = create_random_account(store.as_ref()).await;
        let account2 = create_random_account(store.as_ref()).await;

        let n = 5;
        let amount = 10;
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = store.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    store
                        .transfer_tx(&ctx, TransferTxParams::new(account1.id, account2.id, amount))
                        .await
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            let result = assert_ok!(assert_ok!(handle.await));

            let transfer = &result.transfer;
            assert!(transfer.id.get() > 0);
            assert_eq!(transfer.from_account_id, account1.id);
            assert_eq!(transfer.to_account_id, account2.id);
            assert_eq!(transfer.amount, amount);
            assert_eq!(assert_ok!(store.get_transfer(&ctx, transfer.id).await), *transfer);

            assert_eq!(result.from_entry.account_id, account1.id);
            assert_eq!(result.from_entry.amount, -amount);
            assert_eq!(
                assert_ok!(store.get_entry(&ctx, result.from_entry.id).await),
                result.from_entry
            );

            assert_eq!(result.to_entry.account_id, account2.id);
            assert_eq!(result.to_entry.amount, amount);
            assert_eq!(
                assert_ok!(store.get_entry(&ctx, result.to_entry.id).await),
                result.to_entry
            );

            let diff1 = account1.balance - result.from_account.balance;
            let diff2 = result.to_account.balance - account2.balance;
            assert_eq!(diff1, diff2);
            assert!(diff1 > 0);
            assert_eq!(diff1 % amount, 0);

            let k = diff1 / amount;
            assert!((1..=n).contains(&k));
            assert!(seen.insert(k));
        }
        assert_eq!(seen, (1..=n).collect::<BTreeSet<_>>());

        let updated1 = assert_ok!(store.get_account(&ctx, account1.id).await);
        let updated2 = assert_ok!(store.get_account(&ctx, account2.id).await);
        assert_eq!(updated1.balance, account1.balance - n * amount);
        assert_eq!(updated2.balance, account2.balance + n * amount);
    }

    #[tokio::test]
    async fn test_concurrent_transfers_opposite_directions_do_not_deadlock() {
        let store = Arc::new(MemoryStore::in_memory());
        store.backend().faults().set_row_latency(Duration::from_millis(2));
        let ctx = Context::background();
        let account1 = create_account_with_balance(store.as_ref(), 100).await;
        let account2 = create_account_with_balance(store.as_ref(), 100).await;

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                let ctx = ctx.clone();
                let (from, to) = if i % 2 == 1 {
                    (account2.id, account1.id)
                } else {
                    (account1.id, account2.id)
                };
                tokio::spawn(async move {
                    store
                        .transfer_tx(&ctx, TransferTxParams::new(from, to, 10))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_ok!(assert_ok!(handle.await));
        }

        let updated1 = assert_ok!(store.get_account(&ctx, account1.id).await);
        let updated2 = assert_ok!(store.get_account(&ctx, account2.id).await);
        assert_eq!(updated1.balance, 100);
        assert_eq!(updated2.balance, 100);
    }

    #[tokio::test]
    async fn test_unordered_adjustments_deadlock() {
        let backend = MemoryBackend::new();
        let store = MemoryStore::new(backend.clone());
        let account1 = create_account_with_balance(&store, 100).await;
        let account2 = create_account_with_balance(&store, 100).await;
        backend.faults().set_row_latency(Duration::from_millis(20));

        let transfer = |from: AccountId, to: AccountId| {
            let backend = backend.clone();
            async move {
                let mut tx = backend.begin().await?;
                let debit = BalanceAdjustment { account_id: from, delta: -10 };
                let credit = BalanceAdjustment { account_id: to, delta: 10 };
                add_money(&mut tx, debit, credit).await?;
                tx.commit().await
            }
        };

        let (forward, backward) = tokio::join!(
            transfer(account1.id, account2.id),
            transfer(account2.id, account1.id)
        );

        let deadlocks = [&forward, &backward]
            .iter()
            .filter(|r| matches!(r, Err(BankError::Deadlock(_))))
            .count();
        assert_eq!(deadlocks, 1);
        assert!(forward.is_ok() || backward.is_ok());
    }

    #[tokio::test]
    async fn test_transfer_rejects_same_account() {
        let store = MemoryStore::in_memory();
        let ctx = Context::background();
        let account = create_random_account(&store).await;

        let err = assert_err!(
            store
                .transfer_tx(&ctx, TransferTxParams::new(account.id, account.id, 10))
                .await
        );
        assert!(matches!(err, BankError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_transfer_rejects_non_positive_amount() {
        let store = MemoryStore::in_memory();
        let ctx = Context::background();
        let account1 = create_random_account(&store).await;
        let account2 = create_random_account(&store).await;

        for amount in [0, -5] {
            let err = assert_err!(
                store
                    .transfer_tx(&ctx, TransferTxParams::new(account1.id, account2.id, amount))
                    .await
            );
            assert!(matches!(err, BankError::InvalidArgument { .. }));
        }
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let store = MemoryStore::in_memory();
        let ctx = Context::background();
        let account1 = create_account_with_balance(&store, 30).await;
        let account2 = create_account_with_balance(&store, 0).await;
        let before = store.backend().row_counts();

        let err = assert_err!(
            store
                .transfer_tx(&ctx, TransferTxParams::new(account1.id, account2.id, 50))
                .await
        );
        match err {
            BankError::InsufficientFunds {
                account_id,
                balance,
                required,
            } => {
                assert_eq!(account_id, account1.id);
                assert_eq!(balance, 30);
                assert_eq!(required, 50);
            }
            other => panic!("expected insufficient funds, got {other:?}"),
        }

        assert_eq!(store.backend().row_counts(), before);
        assert_eq!(assert_ok!(store.get_account(&ctx, account1.id).await).balance, 30);
        assert_eq!(assert_ok!(store.get_account(&ctx, account2.id).await).balance, 0);
    }

    #[tokio::test]
    async fn test_transfer_to_missing_account_rolls_back() {
        let store = MemoryStore::in_memory();
        let ctx = Context::background();
        let account = create_account_with_balance(&store, 100).await;
        let before = store.backend().row_counts();

        let err = assert_err!(
            store
                .transfer_tx(&ctx, TransferTxParams::new(account.id, AccountId::new(i64::MAX), 10))
                .await
        );
        assert!(matches!(err, BankError::ForeignKeyViolation { .. }));

        assert_eq!(store.backend().row_counts(), before);
        assert_eq!(assert_ok!(store.get_account(&ctx, account.id).await).balance, 100);
    }

    #[tokio::test]
    async fn test_transfer_rejects_currency_mismatch() {
        let store = MemoryStore::in_memory();
        let ctx = Context::background();
        let usd = create_account_in(&store, 100, Currency::usd()).await;
        let eur = create_account_in(&store, 100, Currency::eur()).await;

        let err = assert_err!(
            store
                .transfer_tx(&ctx, TransferTxParams::new(usd.id, eur.id, 10))
                .await
        );
        assert!(matches!(err, BankError::CurrencyMismatch { .. }));
        assert_eq!(assert_ok!(store.get_account(&ctx, usd.id).await).balance, 100);
        assert_eq!(assert_ok!(store.get_account(&ctx, eur.id).await).balance, 100);
    }

    #[tokio::test]
    async fn test_entries_balance_to_zero() {
        let store = MemoryStore::in_memory();
        let ctx = Context::background();
        let account1 = create_account_with_balance(&store, 500).await;
        let account2 = create_account_with_balance(&store, 500).await;

        let result = assert_ok!(
            store
                .transfer_tx(&ctx, TransferTxParams::new(account2.id, account1.id, 125))
                .await
        );
        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
        assert_eq!(result.from_account.id, account2.id);
        assert_eq!(result.from_account.balance, 375);
        assert_eq!(result.to_account.id, account1.id);
        assert_eq!(result.to_account.balance, 625);
    }

    proptest! {
        #[test]
        fn lock_order_is_ascending_and_preserves_deltas(
            from in 1i64..1_000,
            to in 1i64..1_000,
            amount in 1i64..1_000_000,
        ) {
            prop_assume!(from != to);
            let arg = TransferTxParams::new(AccountId::new(from), AccountId::new(to), amount);
            let [first, second] = lock_order(&arg);

            prop_assert!(first.account_id < second.account_id);
            prop_assert_eq!(first.delta + second.delta, 0);

            let reversed = TransferTxParams::new(AccountId::new(to), AccountId::new(from), amount);
            let [rfirst, rsecond] = lock_order(&reversed);
            prop_assert_eq!(first.account_id, rfirst.account_id);
            prop_assert_eq!(second.account_id, rsecond.account_id);

            for adj in [first, second] {
                let expected = if adj.account_id == arg.from_account_id { -amount } else { amount };
                prop_assert_eq!(adj.delta, expected);
            }
        }
    }
}
