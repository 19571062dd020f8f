//! Resolved trade legs: a single derivative contract or a credit spread.
//!
//! Computed on demand by the contract resolver; only the resulting
//! Position's leg fields are ever persisted.

use crate::instrument::{InstrumentKind, OptionRight};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One resolved derivative contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Exchange trading symbol (e.g., "NIFTY25FEB25000PE").
    pub tradingsymbol: String,
    /// Exchange instrument token.
    pub token: String,
    /// Contract lot size.
    pub lot_size: u32,
    /// Expiry date (always YYYY-MM-DD on the wire).
    pub expiry: NaiveDate,
    /// Strike in index points; 0 for futures.
    pub strike: f64,
    /// Exchange classification.
    pub kind: InstrumentKind,
    /// Option right; None for futures.
    pub right: Option<OptionRight>,
}

/// A credit spread: the at-the-money leg sold, a further out-of-the-money
/// hedge leg bought, same expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditSpread {
    /// Primary leg (sold).
    pub atm: Contract,
    /// Protective leg (bought).
    pub hedge: Contract,
}

impl CreditSpread {
    /// Lot size shared by both legs.
    pub fn lot_size(&self) -> u32 {
        self.atm.lot_size
    }

    pub fn expiry(&self) -> NaiveDate {
        self.atm.expiry
    }
}
