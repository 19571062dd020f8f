//! Margin calculator: broker SPAN engine front-end with a keyed cache.
//!
//! Builds the basket payload for one or two legs, interprets only
//! `span + exposure`, and derives the haircut-adjusted pledge
//! requirement. Everything else the broker returns passes through
//! verbatim for audit. Results are cached by a composite key so repeated
//! scans of the same structure do not hammer the margin endpoint.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};
use varaha_broker::{BrokerApi, MarginLeg};
use varaha_models::{Contract, CreditSpread, ExpiryPolicy, TransactionSide};

#[derive(Debug, Error)]
pub enum MarginError {
    /// A genuine zero-margin basket is not a realistic broker response;
    /// it far more likely means a malformed payload.
    #[error("span_zero")]
    SpanZero,
    #[error("margin_api_failed: {0}")]
    Api(String),
}

/// Interpreted margin figures plus the verbatim remainder.
#[derive(Debug, Clone)]
pub struct MarginFigures {
    pub span: f64,
    pub exposure: f64,
    /// SPAN + exposure.
    pub total: f64,
    /// total / (1 - haircut): collateral to pledge.
    pub pledged_required: f64,
    /// Broker's incremental/addon fields, uninterpreted.
    pub extras: serde_json::Map<String, serde_json::Value>,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct CachedMargin {
    figures: MarginFigures,
    cached_at: Instant,
}

/// Composite cache key: same structure, same margin.
fn cache_key(symbol: &str, policy: ExpiryPolicy, kind_str: &str, hedge_steps: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    policy.as_str().hash(&mut hasher);
    kind_str.hash(&mut hasher);
    hedge_steps.hash(&mut hasher);
    hasher.finish()
}

/// Front-end over the broker margin engine.
pub struct MarginCalculator {
    broker: Arc<dyn BrokerApi>,
    account_id: String,
    exchange: String,
    haircut: f64,
    ttl: Duration,
    cache: HashMap<u64, CachedMargin>,
}

impl MarginCalculator {
    pub fn new(broker: Arc<dyn BrokerApi>, account_id: &str, haircut: f64, ttl_secs: u64) -> Self {
        Self {
            broker,
            account_id: account_id.to_string(),
            exchange: "NFO".to_string(),
            haircut,
            ttl: Duration::from_secs(ttl_secs),
            cache: HashMap::new(),
        }
    }

    /// Override the basket exchange segment.
    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    /// Margin for a two-leg credit spread.
    pub async fn spread_margin(
        &mut self,
        base_symbol: &str,
        spread: &CreditSpread,
        lots: u32,
        policy: ExpiryPolicy,
        hedge_steps: u32,
    ) -> Result<MarginFigures, MarginError> {
        let key = cache_key(base_symbol, policy, spread.atm.kind.as_str(), hedge_steps);
        if let Some(hit) = self.cache_hit(key) {
            return Ok(hit);
        }
        let qty = (lots * spread.lot_size()) as i64;
        let legs = vec![
            margin_leg(&self.exchange, &spread.hedge, qty), // bought
            margin_leg(&self.exchange, &spread.atm, -qty),  // sold
        ];
        let figures = self.fetch(&legs).await?;
        self.cache_store(key, &figures);
        Ok(figures)
    }

    /// Margin for a single future leg.
    pub async fn future_margin(
        &mut self,
        base_symbol: &str,
        contract: &Contract,
        side: TransactionSide,
        lots: u32,
        policy: ExpiryPolicy,
    ) -> Result<MarginFigures, MarginError> {
        let key = cache_key(base_symbol, policy, contract.kind.as_str(), 0);
        if let Some(hit) = self.cache_hit(key) {
            return Ok(hit);
        }
        let qty = (lots * contract.lot_size) as i64;
        let signed = match side {
            TransactionSide::Buy => qty,
            TransactionSide::Sell => -qty,
        };
        let legs = vec![margin_leg(&self.exchange, contract, signed)];
        let figures = self.fetch(&legs).await?;
        self.cache_store(key, &figures);
        Ok(figures)
    }

    async fn fetch(&self, legs: &[MarginLeg]) -> Result<MarginFigures, MarginError> {
        let response = self
            .broker
            .span_margin(&self.account_id, legs)
            .await
            .map_err(|e| MarginError::Api(e.to_string()))?;
        if !response.success {
            return Err(MarginError::Api("margin engine rejected basket".into()));
        }
        let total = response.span + response.exposure;
        if total == 0.0 {
            return Err(MarginError::SpanZero);
        }
        let pledged_required = total / (1.0 - self.haircut);
        info!(
            span = response.span,
            exposure = response.exposure,
            total = total,
            pledged = pledged_required,
            "[MARGIN] basket margin computed"
        );
        Ok(MarginFigures {
            span: response.span,
            exposure: response.exposure,
            total,
            pledged_required,
            extras: response.extras,
            from_cache: false,
        })
    }

    fn cache_hit(&self, key: u64) -> Option<MarginFigures> {
        let cached = self.cache.get(&key)?;
        if cached.cached_at.elapsed() >= self.ttl {
            return None;
        }
        debug!(key = key, total = cached.figures.total, "[MARGIN] cache hit");
        let mut figures = cached.figures.clone();
        figures.from_cache = true;
        Some(figures)
    }

    fn cache_store(&mut self, key: u64, figures: &MarginFigures) {
        self.cache.insert(
            key,
            CachedMargin {
                figures: figures.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries.
    pub fn prune_cache(&mut self) {
        let ttl = self.ttl;
        self.cache.retain(|_, v| v.cached_at.elapsed() < ttl);
    }

    /// Drop everything (token refresh, reconnect).
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

fn margin_leg(exchange: &str, contract: &Contract, signed_qty: i64) -> MarginLeg {
    MarginLeg {
        exchange: exchange.to_string(),
        tradingsymbol: contract.tradingsymbol.clone(),
        kind: contract.kind,
        expiry: contract.expiry.format("%Y-%m-%d").to_string(),
        strike: contract.strike,
        right: contract.right,
        quantity: signed_qty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use varaha_broker::{MockBroker, SpanMarginResponse};
    use varaha_models::{InstrumentKind, OptionRight};

    fn spread() -> CreditSpread {
        let expiry = NaiveDate::from_ymd_opt(2026, 2, 26).unwrap();
        let leg = |strike: f64, token: &str| Contract {
            tradingsymbol: format!("NIFTY26FEB{}PE", strike as i64),
            token: token.to_string(),
            lot_size: 75,
            expiry,
            strike,
            kind: InstrumentKind::OptIdx,
            right: Some(OptionRight::Put),
        };
        CreditSpread {
            atm: leg(25000.0, "1001"),
            hedge: leg(24800.0, "1002"),
        }
    }

    fn margin_response(span: f64, exposure: f64) -> SpanMarginResponse {
        let mut extras = serde_json::Map::new();
        extras.insert("incremental_span".to_string(), serde_json::json!(1234.5));
        SpanMarginResponse {
            success: true,
            span,
            exposure,
            extras,
        }
    }

    #[tokio::test]
    async fn test_spread_margin_and_pledge() {
        let broker = Arc::new(MockBroker::new());
        broker.set_margin(margin_response(90_000.0, 10_000.0));
        let mut calc = MarginCalculator::new(broker.clone(), "Z12345", 0.10, 300);

        let figures = calc
            .spread_margin("NIFTY", &spread(), 1, ExpiryPolicy::Monthly, 2)
            .await
            .unwrap();
        assert_eq!(figures.total, 100_000.0);
        assert!((figures.pledged_required - 111_111.11).abs() < 0.01);
        // Extras pass through verbatim.
        assert_eq!(
            figures.extras.get("incremental_span"),
            Some(&serde_json::json!(1234.5))
        );
        assert!(!figures.from_cache);
    }

    #[tokio::test]
    async fn test_cache_prevents_redundant_calls() {
        let broker = Arc::new(MockBroker::new());
        broker.set_margin(margin_response(50_000.0, 5_000.0));
        let mut calc = MarginCalculator::new(broker.clone(), "Z12345", 0.10, 300);

        let first = calc
            .spread_margin("NIFTY", &spread(), 1, ExpiryPolicy::Monthly, 2)
            .await
            .unwrap();
        let second = calc
            .spread_margin("NIFTY", &spread(), 1, ExpiryPolicy::Monthly, 2)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(broker.margin_call_count(), 1);

        // Different hedge offset is a different key.
        calc.spread_margin("NIFTY", &spread(), 1, ExpiryPolicy::Monthly, 4)
            .await
            .unwrap();
        assert_eq!(broker.margin_call_count(), 2);
    }

    #[tokio::test]
    async fn test_zero_total_is_span_zero_failure() {
        let broker = Arc::new(MockBroker::new());
        broker.set_margin(SpanMarginResponse {
            success: true,
            span: 0.0,
            exposure: 0.0,
            extras: serde_json::Map::new(),
        });
        let mut calc = MarginCalculator::new(broker, "Z12345", 0.10, 300);
        let err = calc
            .spread_margin("NIFTY", &spread(), 1, ExpiryPolicy::Monthly, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, MarginError::SpanZero));
    }

    #[tokio::test]
    async fn test_signed_quantities_in_basket() {
        let broker = Arc::new(MockBroker::new());
        broker.set_margin(margin_response(50_000.0, 5_000.0));
        let mut calc = MarginCalculator::new(broker, "Z12345", 0.10, 300);
        let s = spread();
        let qty = s.lot_size() as i64;
        let legs = vec![
            margin_leg("NFO", &s.hedge, qty),
            margin_leg("NFO", &s.atm, -qty),
        ];
        assert_eq!(legs[0].quantity, 75);
        assert_eq!(legs[1].quantity, -75);
        assert_eq!(legs[0].expiry, "2026-02-26");
        // And the calculator accepts the basket.
        assert!(calc
            .spread_margin("NIFTY", &s, 1, ExpiryPolicy::Monthly, 2)
            .await
            .is_ok());
    }
}
