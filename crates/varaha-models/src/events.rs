//! Structured records the engine emits for reporting collaborators.
//!
//! These are plain rows with no feedback into the core. External sinks
//! (spreadsheet, chat notifier) render them; the engine only produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row per instrument per tick: what the scanner saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub ts: DateTime<Utc>,
    pub token: String,
    pub symbol: String,
    /// Last traded price, if the feed had one.
    pub ltp: Option<f64>,
    /// Strongest matching rule score this tick.
    pub score: f64,
    /// Named filter scores that fed the decision.
    pub filter_scores: BTreeMap<String, f64>,
    /// Margin snapshot for the would-be trade, when computed.
    pub margin_required: Option<f64>,
    /// Whether a position is currently open on this token.
    pub position_open: bool,
}

/// Emitted when an entry action executes successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub ts: DateTime<Utc>,
    pub token: String,
    pub symbol: String,
    pub strategy: String,
    pub side: crate::instrument::TransactionSide,
    pub score: f64,
    /// Free-text context (legs, premiums, order ids).
    pub detail: String,
}

/// Closed-position row; also appended to the session exit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub ts: DateTime<Utc>,
    pub token: String,
    pub strategy: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    /// Structured reason code ("target", "stop", "square_off_rule", ...).
    pub reason: String,
}

/// Consumer of emitted records. Default methods are no-ops so sinks
/// implement only what they render.
pub trait EventSink: Send + Sync {
    fn on_scan(&self, _record: &ScanRecord) {}
    fn on_signal(&self, _record: &SignalRecord) {}
    fn on_exit(&self, _record: &ExitRecord) {}
}

/// Sink that drops everything. Used when no reporting is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_accepts_records() {
        let sink = NullSink;
        sink.on_exit(&ExitRecord {
            ts: Utc::now(),
            token: "256265".into(),
            strategy: "trend_rider".into(),
            entry_price: 100.0,
            exit_price: 110.0,
            pnl: 750.0,
            reason: "target".into(),
        });
    }

    #[test]
    fn test_scan_record_serializes() {
        let rec = ScanRecord {
            ts: Utc::now(),
            token: "256265".into(),
            symbol: "NIFTY".into(),
            ltp: Some(23450.5),
            score: 72.0,
            filter_scores: BTreeMap::from([("orb".to_string(), 1.0)]),
            margin_required: None,
            position_open: false,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"score\":72.0"));
    }
}
