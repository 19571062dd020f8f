//! Position aggregate and the durable session snapshot.
//!
//! `SessionState` is the single record persisted to disk every tick and
//! read once at startup. Datetime fields serialize as RFC 3339 so the
//! on-disk form stays lexically sortable.

use crate::events::ExitRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// The mutable domain aggregate for one live trade.
///
/// Exactly one Position may exist per token at a time; the state manager
/// enforces this on entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Owning instrument token.
    pub token: String,
    /// Strategy label ("unknown" for reconciled ghosts).
    pub strategy: String,
    /// Position kind: "future", "credit_spread", ...
    pub position_type: String,
    /// Underlying side the trade expresses.
    pub side: crate::instrument::TransactionSide,
    /// Entry timestamp.
    pub entry_time: DateTime<Utc>,
    /// Entry price of the primary leg.
    pub entry_price: f64,
    /// Number of lots.
    pub lots: u32,
    /// Contract lot size at entry.
    pub lot_size: u32,
    /// Primary (ATM, sold) leg trading symbol, for spreads.
    #[serde(default)]
    pub atm_symbol: Option<String>,
    /// Primary leg instrument token, for quote lookups while open.
    #[serde(default)]
    pub atm_token: Option<String>,
    /// Protective (hedge, bought) leg trading symbol, for spreads.
    #[serde(default)]
    pub hedge_symbol: Option<String>,
    /// Hedge leg instrument token.
    #[serde(default)]
    pub hedge_token: Option<String>,
    /// Premium collected on the primary leg at entry.
    #[serde(default)]
    pub atm_premium: Option<f64>,
    /// Premium paid on the hedge leg at entry.
    #[serde(default)]
    pub hedge_premium: Option<f64>,
    /// Running maximum favorable PnL, for trailing-stop logic.
    pub max_pnl: f64,
    /// Lifecycle status.
    pub status: PositionStatus,
    /// Latest marked PnL. Recomputed every tick; never persisted.
    #[serde(skip)]
    pub current_pnl: f64,
}

impl Position {
    /// Ratchet `max_pnl` with a fresh mark and remember the mark.
    pub fn mark_pnl(&mut self, pnl: f64) {
        self.current_pnl = pnl;
        if pnl > self.max_pnl {
            self.max_pnl = pnl;
        }
    }

    pub fn is_spread(&self) -> bool {
        self.hedge_symbol.is_some()
    }
}

/// Process-wide durable snapshot, owned and exclusively mutated by the
/// state manager. Written to disk at the end of every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Unix epoch seconds of the last save. Drives the freshness check.
    pub last_updated_epoch: i64,
    /// token -> live position.
    pub active_positions: BTreeMap<String, Position>,
    /// token -> closed-trade records for this session.
    pub exit_history: BTreeMap<String, Vec<ExitRecord>>,
    /// token -> score at position entry.
    pub opening_scores: BTreeMap<String, f64>,
    /// Portfolio-level maximum favorable PnL this session.
    pub max_portfolio_pnl: f64,
    /// Whether the portfolio trailing stop has armed.
    pub global_trailing_stop_active: bool,
    /// Realized PnL this session.
    pub realized_pnl: f64,
    /// Closed-trade count this session.
    pub trade_count: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            last_updated_epoch: 0,
            active_positions: BTreeMap::new(),
            exit_history: BTreeMap::new(),
            opening_scores: BTreeMap::new(),
            max_portfolio_pnl: 0.0,
            global_trailing_stop_active: false,
            realized_pnl: 0.0,
            trade_count: 0,
        }
    }
}

impl SessionState {
    /// Sum of current marks across open positions.
    pub fn open_pnl(&self) -> f64 {
        self.active_positions.values().map(|p| p.current_pnl).sum()
    }

    pub fn open_position_count(&self) -> usize {
        self.active_positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::TransactionSide;

    fn sample_position(token: &str) -> Position {
        Position {
            token: token.to_string(),
            strategy: "trend_rider".to_string(),
            position_type: "future".to_string(),
            side: TransactionSide::Buy,
            entry_time: Utc::now(),
            entry_price: 23450.0,
            lots: 1,
            lot_size: 75,
            atm_symbol: None,
            atm_token: None,
            hedge_symbol: None,
            hedge_token: None,
            atm_premium: None,
            hedge_premium: None,
            max_pnl: 0.0,
            status: PositionStatus::Open,
            current_pnl: 0.0,
        }
    }

    #[test]
    fn test_max_pnl_ratchet() {
        let mut pos = sample_position("256265");
        pos.mark_pnl(500.0);
        pos.mark_pnl(1200.0);
        pos.mark_pnl(300.0);
        assert_eq!(pos.max_pnl, 1200.0);
        assert_eq!(pos.current_pnl, 300.0);
    }

    #[test]
    fn test_current_pnl_not_persisted() {
        let mut pos = sample_position("256265");
        pos.mark_pnl(900.0);
        let json = serde_json::to_string(&pos).unwrap();
        assert!(!json.contains("current_pnl"));
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_pnl, 0.0);
        assert_eq!(back.max_pnl, 900.0);
    }

    #[test]
    fn test_session_open_pnl() {
        let mut state = SessionState::default();
        let mut a = sample_position("1");
        a.mark_pnl(100.0);
        let mut b = sample_position("2");
        b.mark_pnl(-40.0);
        state.active_positions.insert("1".into(), a);
        state.active_positions.insert("2".into(), b);
        assert_eq!(state.open_pnl(), 60.0);
        assert_eq!(state.open_position_count(), 2);
    }
}
