//! Fact calculator: a declarative catalogue of named facts mapped to
//! computed values.
//!
//! Two provider kinds: `indicator` facts read a field off the tick's
//! `TechSnapshot`; `filter` facts call a registered scoring plugin that
//! may return a bare score or a score plus named sub-facts. A failing
//! provider degrades that fact to 0.0 with a warning; one bad filter must
//! never block the rest of the catalogue or other instruments.

use crate::indicators::{ema_series, TechSnapshot};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use varaha_models::facts::FactScope;
use varaha_models::{FactMap, FactValue, PriceSeries};

/// Field of the indicator bundle an `indicator` fact exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorField {
    EmaFast,
    EmaMid,
    EmaSlow,
    EmaLong,
    Rsi,
    Adx,
    Atr,
    BollUpper,
    BollMid,
    BollLower,
    SuperTrend,
    SuperTrendDir,
    Close,
}

impl IndicatorField {
    fn read(&self, tech: &TechSnapshot, series: &PriceSeries) -> f64 {
        match self {
            IndicatorField::EmaFast => tech.ema_fast,
            IndicatorField::EmaMid => tech.ema_mid,
            IndicatorField::EmaSlow => tech.ema_slow,
            IndicatorField::EmaLong => tech.ema_long,
            IndicatorField::Rsi => tech.rsi,
            IndicatorField::Adx => tech.adx,
            IndicatorField::Atr => tech.atr,
            IndicatorField::BollUpper => tech.boll_upper,
            IndicatorField::BollMid => tech.boll_mid,
            IndicatorField::BollLower => tech.boll_lower,
            IndicatorField::SuperTrend => tech.supertrend,
            IndicatorField::SuperTrendDir => tech.supertrend_dir as f64,
            IndicatorField::Close => series.last_close().unwrap_or(0.0),
        }
    }
}

/// Where a fact's value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum FactProvider {
    Indicator { field: IndicatorField },
    Filter { filter: String },
}

fn default_true() -> bool {
    true
}

fn default_scope() -> FactScope {
    FactScope::Instrument
}

/// One catalogue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactDef {
    pub name: String,
    #[serde(default = "default_scope")]
    pub scope: FactScope,
    #[serde(flatten)]
    pub provider: FactProvider,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: HashMap<String, f64>,
}

/// Strategy-side tuning for one fact: disable it or override parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub params: HashMap<String, f64>,
}

/// What a custom filter returns: a bare score, or a score with named
/// sub-facts that flatten to `<fact>.<key>`.
#[derive(Debug, Clone)]
pub enum FilterResult {
    Score(f64),
    Detailed {
        score: f64,
        extras: HashMap<String, f64>,
    },
}

/// Custom filter signature.
pub type FilterFn = fn(&PriceSeries, &TechSnapshot, &HashMap<String, f64>) -> Result<FilterResult>;

/// Registry mapping filter names to implementations.
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Registry with the built-in filters pre-registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("opening_range_breakout", opening_range_breakout);
        registry.register("ema_slope", ema_slope);
        registry
    }

    pub fn register(&mut self, name: &str, filter: FilterFn) {
        self.filters.insert(name.to_string(), filter);
    }

    pub fn get(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }
}

/// Opening-range breakout: score +1 above the range high, -1 below the
/// range low, 0 inside. Exposes `.orb_high` / `.orb_low` beside `.score`.
fn opening_range_breakout(
    series: &PriceSeries,
    _tech: &TechSnapshot,
    params: &HashMap<String, f64>,
) -> Result<FilterResult> {
    let range_bars = params.get("range_bars").copied().unwrap_or(3.0) as usize;
    if series.len() <= range_bars || range_bars == 0 {
        bail!("opening range needs more than {} bars", range_bars);
    }
    let orb_high = series.high[..range_bars]
        .iter()
        .cloned()
        .fold(f64::MIN, f64::max);
    let orb_low = series.low[..range_bars]
        .iter()
        .cloned()
        .fold(f64::MAX, f64::min);
    let close = series.close[series.len() - 1];
    let score = if close > orb_high {
        1.0
    } else if close < orb_low {
        -1.0
    } else {
        0.0
    };
    Ok(FilterResult::Detailed {
        score,
        extras: HashMap::from([("orb_high".to_string(), orb_high), ("orb_low".to_string(), orb_low)]),
    })
}

/// EMA slope over a lookback, as percent of the earlier value.
fn ema_slope(
    series: &PriceSeries,
    _tech: &TechSnapshot,
    params: &HashMap<String, f64>,
) -> Result<FilterResult> {
    let period = params.get("period").copied().unwrap_or(20.0) as usize;
    let lookback = params.get("lookback").copied().unwrap_or(5.0) as usize;
    let ema = ema_series(&series.close, period);
    if ema.len() <= lookback || lookback == 0 {
        bail!("ema slope needs more than {} bars", lookback);
    }
    let now = ema[ema.len() - 1];
    let then = ema[ema.len() - 1 - lookback];
    if then == 0.0 {
        bail!("ema slope base is zero");
    }
    Ok(FilterResult::Score((now - then) / then * 100.0))
}

/// The default instrument fact catalogue.
pub fn default_catalog() -> Vec<FactDef> {
    let indicator = |name: &str, field: IndicatorField| FactDef {
        name: name.to_string(),
        scope: FactScope::Instrument,
        provider: FactProvider::Indicator { field },
        enabled: true,
        params: HashMap::new(),
    };
    let filter = |name: &str, filter_name: &str| FactDef {
        name: name.to_string(),
        scope: FactScope::Instrument,
        provider: FactProvider::Filter {
            filter: filter_name.to_string(),
        },
        enabled: true,
        params: HashMap::new(),
    };
    vec![
        indicator("close", IndicatorField::Close),
        indicator("ema_fast", IndicatorField::EmaFast),
        indicator("ema_mid", IndicatorField::EmaMid),
        indicator("ema_slow", IndicatorField::EmaSlow),
        indicator("ema_long", IndicatorField::EmaLong),
        indicator("rsi", IndicatorField::Rsi),
        indicator("adx", IndicatorField::Adx),
        indicator("atr", IndicatorField::Atr),
        indicator("boll_upper", IndicatorField::BollUpper),
        indicator("boll_lower", IndicatorField::BollLower),
        indicator("supertrend", IndicatorField::SuperTrend),
        indicator("supertrend_dir", IndicatorField::SuperTrendDir),
        filter("orb", "opening_range_breakout"),
        filter("ema_slope", "ema_slope"),
    ]
}

/// Maps the catalogue to values for one instrument's series.
pub struct FactCalculator {
    catalog: Vec<FactDef>,
    registry: FilterRegistry,
}

impl FactCalculator {
    pub fn new(catalog: Vec<FactDef>, registry: FilterRegistry) -> Self {
        Self { catalog, registry }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_catalog(), FilterRegistry::with_builtins())
    }

    /// Names of the catalogue's filter-backed facts (for scan reporting).
    pub fn filter_fact_names(&self) -> Vec<String> {
        self.catalog
            .iter()
            .filter(|d| matches!(d.provider, FactProvider::Filter { .. }))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Compute the flat fact map. Provider failures degrade to 0.0.
    pub fn compute(
        &self,
        series: &PriceSeries,
        tech: &TechSnapshot,
        overrides: &HashMap<String, FactOverride>,
    ) -> FactMap {
        let mut facts = FactMap::new();
        for def in &self.catalog {
            let tuning = overrides.get(&def.name);
            let enabled = tuning
                .and_then(|t| t.enabled)
                .unwrap_or(def.enabled);
            if !enabled {
                continue;
            }
            let mut params = def.params.clone();
            if let Some(t) = tuning {
                params.extend(t.params.iter().map(|(k, v)| (k.clone(), *v)));
            }

            match &def.provider {
                FactProvider::Indicator { field } => {
                    facts.insert(def.name.clone(), FactValue::Num(field.read(tech, series)));
                }
                FactProvider::Filter { filter } => {
                    let result = match self.registry.get(filter) {
                        Some(f) => f(series, tech, &params),
                        None => Err(anyhow::anyhow!("unregistered filter: {}", filter)),
                    };
                    match result {
                        Ok(FilterResult::Score(score)) => {
                            facts.insert(def.name.clone(), FactValue::Num(score));
                        }
                        Ok(FilterResult::Detailed { score, extras }) => {
                            facts.insert(format!("{}.score", def.name), FactValue::Num(score));
                            facts.insert(def.name.clone(), FactValue::Num(score));
                            for (key, value) in extras {
                                facts.insert(
                                    format!("{}.{}", def.name, key),
                                    FactValue::Num(value),
                                );
                            }
                        }
                        Err(e) => {
                            warn!(fact = %def.name, error = %e, "[FACTS] provider failed, using neutral default");
                            facts.insert(def.name.clone(), FactValue::Num(0.0));
                        }
                    }
                }
            }
        }
        facts
    }
}
