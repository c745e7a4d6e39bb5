//! Tallybank Ledger Engine
//!
//! Transactional core of the bank: a transaction executor over a pluggable
//! record store, the money-transfer engine with deadlock-free lock ordering,
//! and atomic user creation with a post-insert callback.

pub mod config;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;
pub mod store;
pub mod transfer;
pub mod user;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::LedgerConfig;
pub use memory::{MemoryBackend, MemoryStore};
pub use models::*;
pub use postgres::{PgBackend, PgStore};
pub use queries::{Backend, Queries, Transaction};
pub use store::{Ledger, Store};
pub use transfer::{TransferTxParams, TransferTxResult};
pub use user::{AfterCreate, CreateUserTxParams, CreateUserTxResult};
