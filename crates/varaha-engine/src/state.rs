//! State manager: the durable ledger of active positions and session
//! aggregates.
//!
//! ## Persistence
//!
//! Saved atomically every tick (write temp, rename over). A save failure
//! is logged, never fatal: in-memory state stays authoritative for the
//! rest of the run. On load, a snapshot older than the freshness window
//! is discarded entirely - stale positions are never silently resumed.
//!
//! ## Reconciliation
//!
//! Broker-reported positions with non-zero net quantity that are missing
//! from the ledger become "ghost" positions synthesized from a template;
//! their strategy label is derived from an ordered rule list over the raw
//! broker fields, falling back to "unknown". Unexplained broker state
//! must never block startup.

use crate::config::{GhostRule, GhostTemplate};
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use varaha_broker::BrokerPosition;
use varaha_models::{ExitRecord, Position, PositionStatus, SessionState, TransactionSide};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("position already open for token {0}")]
    DuplicatePosition(String),
}

/// Owns the session ledger and its on-disk snapshot.
pub struct SessionStore {
    path: PathBuf,
    freshness: chrono::Duration,
    pub state: SessionState,
}

impl SessionStore {
    /// Open the store: load the last snapshot if it exists and is fresh,
    /// start empty otherwise.
    pub fn open(path: impl Into<PathBuf>, freshness_minutes: i64, now: DateTime<Utc>) -> Self {
        let path = path.into();
        let freshness = chrono::Duration::minutes(freshness_minutes);
        let state = Self::load(&path, freshness, now);
        Self {
            path,
            freshness,
            state,
        }
    }

    fn load(path: &Path, freshness: chrono::Duration, now: DateTime<Utc>) -> SessionState {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(path = %path.display(), "[STATE] no snapshot, starting empty");
                return SessionState::default();
            }
        };
        let state: SessionState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "[STATE] corrupt snapshot discarded");
                return SessionState::default();
            }
        };
        let snapshot_ts = Utc
            .timestamp_opt(state.last_updated_epoch, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        if now - snapshot_ts > freshness {
            warn!(
                age_minutes = (now - snapshot_ts).num_minutes(),
                positions = state.active_positions.len(),
                "[STATE] snapshot stale, starting empty"
            );
            return SessionState::default();
        }
        info!(
            positions = state.active_positions.len(),
            realized_pnl = state.realized_pnl,
            "[STATE] session snapshot restored"
        );
        state
    }

    /// Persist the full session state atomically: temp file, then rename.
    pub fn save(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.state.last_updated_epoch = now.timestamp();
        // Transient fields (`current_pnl`) are serde-skipped, so the
        // snapshot only ever carries durable state.
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Freshness window this store was opened with.
    pub fn freshness(&self) -> chrono::Duration {
        self.freshness
    }

    /// Register a new position. At most one position per token.
    pub fn open_position(&mut self, position: Position) -> Result<(), StateError> {
        if self.state.active_positions.contains_key(&position.token) {
            return Err(StateError::DuplicatePosition(position.token));
        }
        info!(
            token = %position.token,
            strategy = %position.strategy,
            entry_price = position.entry_price,
            "[STATE] position opened"
        );
        self.state
            .active_positions
            .insert(position.token.clone(), position);
        Ok(())
    }

    /// Remove a position with an explicit exit record; updates realized
    /// PnL and trade count. No position ever leaves the ledger without
    /// one of these.
    pub fn close_position(&mut self, token: &str, exit: ExitRecord) {
        if self.state.active_positions.remove(token).is_none() {
            warn!(token = %token, "[STATE] close for unknown position");
        }
        self.state.opening_scores.remove(token);
        self.state.realized_pnl += exit.pnl;
        self.state.trade_count += 1;
        info!(token = %token, pnl = exit.pnl, reason = %exit.reason, "[STATE] position closed");
        self.state
            .exit_history
            .entry(token.to_string())
            .or_default()
            .push(exit);
    }

    /// Fold broker-reported live positions into the ledger.
    ///
    /// After this, the ledger's key set is a superset of all non-zero
    /// broker positions. Entries the broker reports flat are left for the
    /// next tick's exit detection, not force-deleted here. Idempotent.
    pub fn reconcile_with_broker(
        &mut self,
        broker_positions: &[BrokerPosition],
        rules: &[GhostRule],
        template: &GhostTemplate,
        now: DateTime<Utc>,
    ) {
        for bp in broker_positions {
            if bp.net_qty == 0 {
                continue;
            }
            if self.state.active_positions.contains_key(&bp.token) {
                continue;
            }
            let strategy = derive_strategy(bp, rules, &template.strategy_fallback);
            warn!(
                token = %bp.token,
                symbol = %bp.tradingsymbol,
                net_qty = bp.net_qty,
                strategy = %strategy,
                "[STATE] ghost position adopted from broker"
            );
            let ghost = Position {
                token: bp.token.clone(),
                strategy,
                position_type: template.position_type.clone(),
                side: if bp.net_qty > 0 {
                    TransactionSide::Buy
                } else {
                    TransactionSide::Sell
                },
                entry_time: now,
                entry_price: bp.avg_price,
                lots: 1,
                lot_size: bp.net_qty.unsigned_abs() as u32,
                atm_symbol: Some(bp.tradingsymbol.clone()),
                atm_token: Some(bp.token.clone()),
                hedge_symbol: None,
                hedge_token: None,
                atm_premium: None,
                hedge_premium: None,
                max_pnl: 0.0,
                status: PositionStatus::Open,
                current_pnl: bp.unrealized_pnl,
            };
            self.state.active_positions.insert(bp.token.clone(), ghost);
        }
    }
}

/// Evaluate the ordered ghost derivation rules against raw broker
/// fields. First match wins; no match falls back.
fn derive_strategy(bp: &BrokerPosition, rules: &[GhostRule], fallback: &str) -> String {
    for rule in rules {
        if let Some(ref needle) = rule.symbol_contains {
            if !bp.tradingsymbol.contains(needle.as_str()) {
                continue;
            }
        }
        if let Some(sign) = rule.net_qty_sign {
            if bp.net_qty.signum() as i8 != sign {
                continue;
            }
        }
        return rule.strategy.clone();
    }
    fallback.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_at(dir: &tempfile::TempDir, now: DateTime<Utc>) -> SessionStore {
        SessionStore::open(dir.path().join("session_state.json"), 30, now)
    }

    fn position(token: &str, entry_price: f64) -> Position {
        Position {
            token: token.to_string(),
            strategy: "trend_rider".to_string(),
            position_type: "credit_spread".to_string(),
            side: TransactionSide::Sell,
            entry_time: Utc::now(),
            entry_price,
            lots: 1,
            lot_size: 75,
            atm_symbol: Some("NIFTY26FEB25000PE".to_string()),
            atm_token: Some("1001".to_string()),
            hedge_symbol: Some("NIFTY26FEB24800PE".to_string()),
            hedge_token: Some("1002".to_string()),
            atm_premium: Some(120.0),
            hedge_premium: Some(45.0),
            max_pnl: 0.0,
            status: PositionStatus::Open,
            current_pnl: 0.0,
        }
    }

    fn broker_position(token: &str, symbol: &str, net_qty: i64) -> BrokerPosition {
        BrokerPosition {
            exchange: "NFO".to_string(),
            token: token.to_string(),
            tradingsymbol: symbol.to_string(),
            net_qty,
            avg_price: 100.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn test_one_position_per_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, Utc::now());
        store.open_position(position("1001", 120.0)).unwrap();
        let err = store.open_position(position("1001", 130.0));
        assert!(matches!(err, Err(StateError::DuplicatePosition(_))));
        assert_eq!(store.state.active_positions.len(), 1);
        // Entry price of the original is untouched.
        assert_eq!(store.state.active_positions["1001"].entry_price, 120.0);
    }

    #[test]
    fn test_save_load_roundtrip_within_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut store = store_at(&dir, now);
        store.open_position(position("1001", 120.0)).unwrap();
        store.open_position(position("1002", 95.5)).unwrap();
        store.save(now).unwrap();

        let reopened = store_at(&dir, now + Duration::minutes(5));
        assert_eq!(reopened.state.active_positions.len(), 2);
        assert_eq!(reopened.state.active_positions["1001"].entry_price, 120.0);
        assert_eq!(reopened.state.active_positions["1002"].entry_price, 95.5);
    }

    #[test]
    fn test_stale_snapshot_discarded_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut store = store_at(&dir, now);
        store.open_position(position("1001", 120.0)).unwrap();
        store.save(now).unwrap();

        let reopened = store_at(&dir, now + Duration::minutes(31));
        assert!(reopened.state.active_positions.is_empty());
        assert_eq!(reopened.state.trade_count, 0);
    }

    #[test]
    fn test_corrupt_snapshot_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = SessionStore::open(path, 30, Utc::now());
        assert!(store.state.active_positions.is_empty());
    }

    #[test]
    fn test_close_position_records_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir, Utc::now());
        store.open_position(position("1001", 120.0)).unwrap();
        store.close_position(
            "1001",
            ExitRecord {
                ts: Utc::now(),
                token: "1001".into(),
                strategy: "trend_rider".into(),
                entry_price: 120.0,
                exit_price: 80.0,
                pnl: 3000.0,
                reason: "target".into(),
            },
        );
        assert!(store.state.active_positions.is_empty());
        assert_eq!(store.state.realized_pnl, 3000.0);
        assert_eq!(store.state.trade_count, 1);
        assert_eq!(store.state.exit_history["1001"].len(), 1);
    }

    #[test]
    fn test_reconcile_adopts_ghosts_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut store = store_at(&dir, now);
        let rules = vec![GhostRule {
            symbol_contains: Some("PE".to_string()),
            net_qty_sign: Some(-1),
            strategy: "short_put_spread".to_string(),
        }];
        let template = GhostTemplate::default();
        let broker = vec![
            broker_position("2001", "NIFTY26FEB25000PE", -75),
            broker_position("2002", "NIFTY26FEBFUT", 75),
            broker_position("2003", "BANKNIFTY26FEBFUT", 0), // flat, ignored
        ];

        store.reconcile_with_broker(&broker, &rules, &template, now);
        assert_eq!(store.state.active_positions.len(), 2);
        assert_eq!(
            store.state.active_positions["2001"].strategy,
            "short_put_spread"
        );
        // No rule matched the long future: lenient fallback.
        assert_eq!(store.state.active_positions["2002"].strategy, "unknown");
        assert!(!store.state.active_positions.contains_key("2003"));

        // Same snapshot again: no duplicates.
        store.reconcile_with_broker(&broker, &rules, &template, now);
        assert_eq!(store.state.active_positions.len(), 2);
    }

    #[test]
    fn test_reconcile_leaves_existing_entries_alone() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut store = store_at(&dir, now);
        store.open_position(position("2001", 120.0)).unwrap();
        // Broker reports 2001 flat; ledger entry must survive for the
        // next tick's exit detection.
        let broker = vec![broker_position("2001", "NIFTY26FEB25000PE", 0)];
        store.reconcile_with_broker(&broker, &[], &GhostTemplate::default(), now);
        assert!(store.state.active_positions.contains_key("2001"));
        assert_eq!(store.state.active_positions["2001"].strategy, "trend_rider");
    }

    #[test]
    fn test_save_is_atomic_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut store = store_at(&dir, now);
        store.open_position(position("1001", 120.0)).unwrap();
        store.save(now).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
