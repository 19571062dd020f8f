//! Engine configuration, TOML-loaded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use varaha_broker::PriceType;

/// Rule for labelling a ghost position found on the broker during
/// reconciliation. First match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostRule {
    /// Substring the broker tradingsymbol must contain.
    #[serde(default)]
    pub symbol_contains: Option<String>,
    /// Required sign of the broker net quantity (+1 long, -1 short).
    #[serde(default)]
    pub net_qty_sign: Option<i8>,
    /// Strategy label to assign on match.
    pub strategy: String,
}

/// Template for synthesizing ghost positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostTemplate {
    /// position_type assigned to synthesized entries.
    pub position_type: String,
    /// Label when no derivation rule matches.
    pub strategy_fallback: String,
}

impl Default for GhostTemplate {
    fn default() -> Self {
        Self {
            position_type: "reconciled".to_string(),
            strategy_fallback: "unknown".to_string(),
        }
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Broker account id for margin baskets.
    pub account_id: String,
    /// Derivative segment orders go to.
    pub derivative_exchange: String,
    /// Broker product type for carry-forward F&O.
    pub product_type: String,
    /// When set, order placement short-circuits to synthetic success.
    pub dry_run: bool,
    /// Collateral haircut used for the pledge requirement.
    pub haircut: f64,
    /// Slippage buffer applied to limit prices, in percent.
    pub slippage_pct: f64,
    /// Price type when no per-symbol override applies.
    pub default_price_type: PriceType,
    /// Per-symbol price type overrides.
    pub price_type_overrides: HashMap<String, PriceType>,
    /// Fallback lot sizes when the contract master lacks one.
    pub lot_sizes: HashMap<String, u32>,
    /// Durable session snapshot path.
    pub session_file: PathBuf,
    /// Snapshots older than this are discarded on load.
    pub freshness_minutes: i64,
    /// Default hedge distance in strike steps for credit spreads.
    pub hedge_steps: u32,
    /// Minimum seconds between contract-universe refresh attempts.
    pub contract_refresh_cooldown_secs: u64,
    /// Margin cache entry lifetime.
    pub margin_cache_ttl_secs: u64,
    /// Candle interval requested from the broker.
    pub candle_interval_minutes: u32,
    /// History window requested per tick, in minutes.
    pub history_minutes: i64,
    /// Ghost strategy derivation rules, evaluated in order.
    pub ghost_rules: Vec<GhostRule>,
    /// Ghost synthesis template.
    pub ghost_template: GhostTemplate,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            derivative_exchange: "NFO".to_string(),
            product_type: "NRML".to_string(),
            dry_run: false,
            haircut: 0.10,
            slippage_pct: 0.25,
            default_price_type: PriceType::Limit,
            price_type_overrides: HashMap::new(),
            lot_sizes: HashMap::from([
                ("NIFTY".to_string(), 75),
                ("BANKNIFTY".to_string(), 35),
            ]),
            session_file: PathBuf::from("session_state.json"),
            freshness_minutes: 30,
            hedge_steps: 4,
            contract_refresh_cooldown_secs: 300,
            margin_cache_ttl_secs: 300,
            candle_interval_minutes: 5,
            history_minutes: 2 * 375, // two trading days of 5-minute bars
            ghost_rules: Vec::new(),
            ghost_template: GhostTemplate::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| anyhow::anyhow!("Could not find config file: {}", path))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.derivative_exchange, "NFO");
        assert_eq!(cfg.freshness_minutes, 30);
        assert_eq!(cfg.lot_sizes.get("NIFTY"), Some(&75));
        assert_eq!(cfg.ghost_template.strategy_fallback, "unknown");
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            account_id = "Z12345"
            dry_run = true
            haircut = 0.12

            [[ghost_rules]]
            symbol_contains = "PE"
            net_qty_sign = -1
            strategy = "short_put_spread"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.account_id, "Z12345");
        assert!(cfg.dry_run);
        assert_eq!(cfg.haircut, 0.12);
        assert_eq!(cfg.ghost_rules.len(), 1);
        // Untouched fields keep defaults.
        assert_eq!(cfg.product_type, "NRML");
        assert_eq!(cfg.hedge_steps, 4);
    }
}
