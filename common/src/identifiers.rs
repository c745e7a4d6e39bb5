//! Identifier types for ledger rows.
//!
//! Row identifiers are assigned by the store from monotonically increasing
//! sequences. `AccountId` ordering is the global lock order used by transfers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Create from a raw store identifier.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw store identifier.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

row_id!(
    /// Identifier of an account row.
    AccountId
);

row_id!(
    /// Identifier of an entry row.
    EntryId
);

row_id!(
    /// Identifier of a transfer row.
    TransferId
);
