//! Tallybank Common Types
//!
//! Shared types used across the Tallybank ledger crates: row identifiers,
//! currency codes, the error taxonomy and the cancellation context that every
//! ledger operation takes as its first argument.

pub mod context;
pub mod error;
pub mod identifiers;
pub mod monetary;

pub use context::*;
pub use error::*;
pub use identifiers::*;
pub use monetary::*;
