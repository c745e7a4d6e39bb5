//! Monetary types.
//!
//! Amounts are signed integers in the currency's minor units; only the
//! currency code needs a dedicated type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Currencies accounts may be opened in.
pub const SUPPORTED_CURRENCIES: [&str; 3] = ["USD", "EUR", "CAD"];

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Check if accounts can be opened in this currency.
    pub fn is_supported(&self) -> bool {
        SUPPORTED_CURRENCIES.contains(&self.0.as_str())
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn cad() -> Self {
        Self::new("CAD")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Currency {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_normalized() {
        assert_eq!(Currency::new("usd"), Currency::usd());
        assert_eq!(Currency::from("eur").code(), "EUR");
    }

    #[test]
    fn test_supported_currencies() {
        assert!(Currency::usd().is_supported());
        assert!(Currency::cad().is_supported());
        assert!(!Currency::new("JPY").is_supported());
    }
}
