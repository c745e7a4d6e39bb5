//! In-memory transactional record store.
//!
//! Every transaction buffers its writes and applies them atomically on
//! commit, so other transactions only ever see committed rows. Balance
//! updates and `get_account_for_update` take exclusive row locks that are held
//! until the transaction ends; lock cycles abort the waiter with
//! `BankError::Deadlock`. Unique keys and foreign keys follow the SQL schema.

mod lock_table;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use tallybank_common::{AccountId, BankError, EntryId, Result, TransferId};

use crate::models::*;
use crate::queries::{Backend, Queries, Transaction};
use crate::store::Store;

use lock_table::{LockTable, TxId};

/// A store backed by [`MemoryBackend`].
pub type MemoryStore = Store<MemoryBackend>;

impl Store<MemoryBackend> {
    /// Create an empty in-memory store.
    pub fn in_memory() -> Self {
        Store::new(MemoryBackend::new())
    }
}

/// Failure injection for exercising error paths.
///
/// Commit and rollback failures are one-shot; row latency applies to every
/// locked row until cleared.
#[derive(Debug, Default)]
pub struct Faults {
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    row_latency_us: AtomicU64,
}

impl Faults {
    /// Make the next commit fail after discarding its writes.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next rollback report a failure.
    pub fn fail_next_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    /// Hold every row lock for at least `latency` after acquiring it.
    pub fn set_row_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.row_latency_us.store(micros, Ordering::SeqCst);
    }

    /// Remove all injected faults.
    pub fn clear(&self) {
        self.fail_commit.store(false, Ordering::SeqCst);
        self.fail_rollback.store(false, Ordering::SeqCst);
        self.row_latency_us.store(0, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> bool {
        self.fail_commit.swap(false, Ordering::SeqCst)
    }

    fn take_rollback_failure(&self) -> bool {
        self.fail_rollback.swap(false, Ordering::SeqCst)
    }

    fn row_latency(&self) -> Option<Duration> {
        match self.row_latency_us.load(Ordering::SeqCst) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }
}

/// Number of committed rows per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub accounts: usize,
    pub entries: usize,
    pub transfers: usize,
    pub users: usize,
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: HashMap<EntryId, Entry>,
    transfers: HashMap<TransferId, Transfer>,
    users: HashMap<String, User>,
}

impl Tables {
    fn owner_has_currency(&self, account: &Account) -> bool {
        self.accounts
            .values()
            .any(|a| a.id != account.id && a.owner == account.owner && a.currency == account.currency)
    }

    fn email_taken(&self, email: &str) -> bool {
        self.users.values().any(|u| u.email == email)
    }

    /// Re-check unique keys against rows committed since the writes were made.
    fn check_unique(&self, pending: &Pending) -> Result<()> {
        for user in &pending.users {
            if self.users.contains_key(&user.username) {
                return Err(unique_violation("user", "users_pkey"));
            }
            if self.email_taken(&user.email) {
                return Err(unique_violation("user", "users_email_key"));
            }
        }
        for account in pending.accounts.values() {
            if !self.accounts.contains_key(&account.id) && self.owner_has_currency(account) {
                return Err(unique_violation("account", "owner_currency_key"));
            }
        }
        Ok(())
    }

    fn apply(&mut self, pending: Pending) {
        self.accounts.extend(pending.accounts);
        self.entries
            .extend(pending.entries.into_iter().map(|e| (e.id, e)));
        self.transfers
            .extend(pending.transfers.into_iter().map(|t| (t.id, t)));
        self.users
            .extend(pending.users.into_iter().map(|u| (u.username.clone(), u)));
    }
}

/// Writes of one transaction, invisible to others until commit.
#[derive(Debug, Default)]
struct Pending {
    /// New accounts and new versions of locked accounts.
    accounts: BTreeMap<AccountId, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    users: Vec<User>,
}

#[derive(Debug)]
struct Sequences {
    account: AtomicI64,
    entry: AtomicI64,
    transfer: AtomicI64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            account: AtomicI64::new(1),
            entry: AtomicI64::new(1),
            transfer: AtomicI64::new(1),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: LockTable,
    faults: Faults,
    sequences: Sequences,
    next_tx: AtomicU64,
    closed: AtomicBool,
}

/// In-memory record store; clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the fault injection switches.
    pub fn faults(&self) -> &Faults {
        &self.shared.faults
    }

    /// Count committed rows.
    pub fn row_counts(&self) -> RowCounts {
        let tables = self.shared.tables.lock();
        RowCounts {
            accounts: tables.accounts.len(),
            entries: tables.entries.len(),
            transfers: tables.transfers.len(),
            users: tables.users.len(),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BankError::StoreClosed);
        }
        let id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryTx {
            id,
            shared: self.shared.clone(),
            pending: Pending::default(),
        })
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// A transaction on a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryTx {
    id: TxId,
    shared: Arc<Shared>,
    pending: Pending,
}

impl MemoryTx {
    async fn lock_row(&self, id: AccountId) -> Result<()> {
        self.shared.locks.acquire(self.id, id).await?;
        if let Some(latency) = self.shared.faults.row_latency() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn read_account(&self, id: AccountId) -> Result<Account> {
        if let Some(account) = self.pending.accounts.get(&id) {
            return Ok(account.clone());
        }
        self.shared
            .tables
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| BankError::not_found("account", id))
    }

    fn account_exists(&self, id: AccountId) -> bool {
        self.pending.accounts.contains_key(&id) || self.shared.tables.lock().accounts.contains_key(&id)
    }

    fn user_exists(&self, username: &str) -> bool {
        self.pending.users.iter().any(|u| u.username == username)
            || self.shared.tables.lock().users.contains_key(username)
    }

    fn require_account(&self, id: AccountId, constraint: &str) -> Result<()> {
        if self.account_exists(id) {
            Ok(())
        } else {
            Err(BankError::ForeignKeyViolation {
                constraint: constraint.to_string(),
            })
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.shared.locks.release_all(self.id);
    }
}

fn unique_violation(entity: &'static str, constraint: &str) -> BankError {
    BankError::AlreadyExists {
        entity,
        constraint: constraint.to_string(),
    }
}

fn non_negative(field: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| BankError::invalid_argument(field, format!("{field} must not be negative")))
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account> {
        if !self.user_exists(&params.owner) {
            return Err(BankError::ForeignKeyViolation {
                constraint: "accounts_owner_fkey".to_string(),
            });
        }

        let account = Account {
            id: AccountId::new(self.shared.sequences.account.fetch_add(1, Ordering::SeqCst)),
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };

        let duplicate = self.pending.accounts.values().any(|a| {
            a.owner == account.owner && a.currency == account.currency
        }) || self.shared.tables.lock().owner_has_currency(&account);
        if duplicate {
            return Err(unique_violation("account", "owner_currency_key"));
        }

        self.pending.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        self.read_account(id)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        self.lock_row(id).await?;
        self.read_account(id)
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> Result<Vec<Account>> {
        let limit = non_negative("limit", params.limit)?;
        let offset = non_negative("offset", params.offset)?;

        let mut accounts: BTreeMap<AccountId, Account> = self
            .shared
            .tables
            .lock()
            .accounts
            .values()
            .filter(|a| a.owner == params.owner)
            .map(|a| (a.id, a.clone()))
            .collect();
        accounts.extend(
            self.pending
                .accounts
                .values()
                .filter(|a| a.owner == params.owner)
                .map(|a| (a.id, a.clone())),
        );

        Ok(accounts.into_values().skip(offset).take(limit).collect())
    }

    async fn add_account_balance(&mut self, params: AddAccountBalanceParams) -> Result<Account> {
        self.lock_row(params.id).await?;

        let mut account = self.read_account(params.id)?;
        account.balance = account.balance.checked_add(params.amount).ok_or_else(|| {
            BankError::DatabaseError(format!("balance of account {} out of range", params.id))
        })?;

        debug!(tx = self.id, account_id = %account.id, balance = account.balance, "Balance updated");
        self.pending.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        self.require_account(params.account_id, "entries_account_id_fkey")?;

        let entry = Entry {
            id: EntryId::new(self.shared.sequences.entry.fetch_add(1, Ordering::SeqCst)),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.pending.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        if let Some(entry) = self.pending.entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        self.shared
            .tables
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| BankError::not_found("entry", id))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        if params.amount <= 0 {
            return Err(BankError::invalid_argument(
                "amount",
                "violates check constraint transfers_amount_check",
            ));
        }
        self.require_account(params.from_account_id, "transfers_from_account_id_fkey")?;
        self.require_account(params.to_account_id, "transfers_to_account_id_fkey")?;

        let transfer = Transfer {
            id: TransferId::new(self.shared.sequences.transfer.fetch_add(1, Ordering::SeqCst)),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.pending.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        if let Some(transfer) = self.pending.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        self.shared
            .tables
            .lock()
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| BankError::not_found("transfer", id))
    }

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User> {
        if self.user_exists(&params.username) {
            return Err(unique_violation("user", "users_pkey"));
        }
        let email_taken = self.pending.users.iter().any(|u| u.email == params.email)
            || self.shared.tables.lock().email_taken(&params.email);
        if email_taken {
            return Err(unique_violation("user", "users_email_key"));
        }

        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            password_changed_at: DateTime::<Utc>::default(),
            created_at: Utc::now(),
        };
        self.pending.users.push(user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        if let Some(user) = self.pending.users.iter().find(|u| u.username == username) {
            return Ok(user.clone());
        }
        self.shared
            .tables
            .lock()
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| BankError::not_found("user", username))
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(mut self) -> Result<()> {
        if self.shared.faults.take_commit_failure() {
            return Err(BankError::DatabaseError("injected commit failure".to_string()));
        }

        let pending = std::mem::take(&mut self.pending);
        {
            let mut tables = self.shared.tables.lock();
            tables.check_unique(&pending)?;
            tables.apply(pending);
        }
        debug!(tx = self.id, "Transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        if self.shared.faults.take_rollback_failure() {
            return Err(BankError::DatabaseError("injected rollback failure".to_string()));
        }
        debug!(tx = self.id, "Transaction rolled back");
        Ok(())
    }
}
