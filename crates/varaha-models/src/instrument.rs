//! Tradable instrument identity and derivative classification.

use serde::{Deserialize, Serialize};

/// One tradable token in the engine's universe.
///
/// Supplied by configuration, immutable per tick. `token` is the exchange's
/// numeric instrument token kept as a string because vendors are not
/// consistent about width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange segment (e.g., "NSE" for cash, "NFO" for F&O).
    pub exchange: String,
    /// Exchange instrument token.
    pub token: String,
    /// Declared trading symbol, if known (e.g., "NIFTY").
    #[serde(default)]
    pub symbol: Option<String>,
    /// Company/index name, if declared.
    #[serde(default)]
    pub name: Option<String>,
}

impl Instrument {
    pub fn new(exchange: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            token: token.into(),
            symbol: None,
            name: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Lookup key used for live-feed fact maps: "EXCHANGE:TOKEN".
    pub fn feed_key(&self) -> String {
        format!("{}:{}", self.exchange, self.token)
    }
}

/// Derivative instrument kind, as the exchange classifies contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentKind {
    /// Index future.
    FutIdx,
    /// Stock future.
    FutStk,
    /// Index option.
    OptIdx,
    /// Stock option.
    OptStk,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::FutIdx => "FUTIDX",
            InstrumentKind::FutStk => "FUTSTK",
            InstrumentKind::OptIdx => "OPTIDX",
            InstrumentKind::OptStk => "OPTSTK",
        }
    }

    pub fn is_option(&self) -> bool {
        matches!(self, InstrumentKind::OptIdx | InstrumentKind::OptStk)
    }
}

/// Option right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    /// Parse from exchange instrument_type ("CE" or "PE").
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "CE" => Some(OptionRight::Call),
            "PE" => Some(OptionRight::Put),
            _ => None,
        }
    }

    pub fn to_exchange(&self) -> &'static str {
        match self {
            OptionRight::Call => "CE",
            OptionRight::Put => "PE",
        }
    }
}

/// Order/position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionSide {
    Buy,
    Sell,
}

impl TransactionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSide::Buy => "BUY",
            TransactionSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TransactionSide::Buy => TransactionSide::Sell,
            TransactionSide::Sell => TransactionSide::Buy,
        }
    }
}

/// Which expiry of the derivative ladder a trade wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Earliest expiry on or after today.
    Nearest,
    /// Earliest monthly expiry (last Thursday of its month) on or after today.
    Monthly,
}

impl ExpiryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryPolicy::Nearest => "nearest",
            ExpiryPolicy::Monthly => "monthly",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_key() {
        let inst = Instrument::new("NSE", "256265").with_symbol("NIFTY");
        assert_eq!(inst.feed_key(), "NSE:256265");
    }

    #[test]
    fn test_right_parsing() {
        assert_eq!(OptionRight::from_exchange("CE"), Some(OptionRight::Call));
        assert_eq!(OptionRight::from_exchange("PE"), Some(OptionRight::Put));
        assert_eq!(OptionRight::from_exchange("FUT"), None);
        assert_eq!(OptionRight::Put.to_exchange(), "PE");
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(TransactionSide::Buy.opposite(), TransactionSide::Sell);
        assert_eq!(TransactionSide::Sell.as_str(), "SELL");
    }
}
