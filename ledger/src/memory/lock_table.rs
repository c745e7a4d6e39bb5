//! Exclusive row locks for the in-memory store.
//!
//! Locks are held until the owning transaction ends. Before a transaction
//! starts waiting, the wait-for graph is walked; if the wait would close a
//! cycle the waiter is aborted with `BankError::Deadlock`, mirroring what a
//! database does when two transactions lock the same rows in opposite order.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use tallybank_common::{AccountId, BankError, Result};

pub(crate) type TxId = u64;

#[derive(Debug, Default)]
struct LockState {
    /// Row -> transaction holding its lock.
    owners: HashMap<AccountId, TxId>,
    /// Transaction -> row it is blocked on.
    waits_for: HashMap<TxId, AccountId>,
}

impl LockState {
    /// Whether `waiter` blocking on a row held by `holder` closes a cycle.
    fn closes_cycle(&self, waiter: TxId, mut holder: TxId) -> bool {
        for _ in 0..=self.waits_for.len() {
            if holder == waiter {
                return true;
            }
            let Some(row) = self.waits_for.get(&holder) else {
                return false;
            };
            let Some(&next) = self.owners.get(row) else {
                return false;
            };
            holder = next;
        }
        false
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockTable {
    /// Acquire the lock on `row` for `tx`, waiting while another transaction
    /// holds it. Re-acquiring a held lock is a no-op.
    pub(crate) async fn acquire(&self, tx: TxId, row: AccountId) -> Result<()> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire(tx, row)? {
                return Ok(());
            }
            released.await;
        }
    }

    fn try_acquire(&self, tx: TxId, row: AccountId) -> Result<bool> {
        let mut state = self.state.lock();
        match state.owners.get(&row).copied() {
            None => {
                state.owners.insert(row, tx);
                state.waits_for.remove(&tx);
                Ok(true)
            }
            Some(owner) if owner == tx => Ok(true),
            Some(owner) => {
                state.waits_for.insert(tx, row);
                if state.closes_cycle(tx, owner) {
                    state.waits_for.remove(&tx);
                    warn!(tx, account_id = %row, holder = owner, "Deadlock detected");
                    return Err(BankError::Deadlock(format!(
                        "transaction {tx} waits for account {row} held by transaction {owner}, \
                         which waits for transaction {tx}"
                    )));
                }
                Ok(false)
            }
        }
    }

    /// Release every lock held by `tx` and forget any wait it registered.
    pub(crate) fn release_all(&self, tx: TxId) {
        {
            let mut state = self.state.lock();
            state.owners.retain(|_, owner| *owner != tx);
            state.waits_for.remove(&tx);
        }
        self.released.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn holder(&self, row: AccountId) -> Option<TxId> {
        self.state.lock().owners.get(&row).copied()
    }
}
