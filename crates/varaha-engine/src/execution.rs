//! Order executor: turns resolved contracts into broker orders.
//!
//! ## Price policy
//!
//! A per-symbol override table decides market vs. limit; limit prices
//! take the live quote and bias it by the slippage buffer in the
//! protective direction (buys above the quote, sells below) so fills are
//! favored over price.
//!
//! ## Spread protocol
//!
//! Two sequential calls: hedge leg (buy) first, primary leg (sell) only
//! after the hedge succeeds. If the primary leg then fails, the result
//! carries the surviving hedge order id for operator follow-up; the
//! executor does NOT unwind the hedge. Orphaned-hedge risk is surfaced,
//! not hidden, and retries belong to the caller.
//!
//! Dry-run mode short-circuits every placement to a synthetic success
//! with no network call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use varaha_broker::{BrokerApi, OrderParams, PriceType};
use varaha_models::{Contract, CreditSpread, TransactionSide};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("quote_unavailable: {symbol}: {detail}")]
    QuoteUnavailable { symbol: String, detail: String },
    #[error("order_rejected: {symbol}: {message}")]
    OrderRejected { symbol: String, message: String },
    /// The hedge filled but the primary leg did not. The hedge order id
    /// rides along so an operator can intervene.
    #[error("primary_leg_rejected: {symbol}: {message} (hedge order {hedge_order_id} live)")]
    PrimaryLegRejected {
        symbol: String,
        message: String,
        hedge_order_id: String,
    },
}

/// Executor configuration, sliced out of the engine config.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub exchange: String,
    pub product_type: String,
    pub dry_run: bool,
    /// Percent applied to the quote for limit prices.
    pub slippage_pct: f64,
    pub default_price_type: PriceType,
    pub price_type_overrides: HashMap<String, PriceType>,
}

/// One placed leg.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub order_id: String,
    pub price_type: PriceType,
    pub limit_price: Option<f64>,
}

/// Both legs of a placed spread.
#[derive(Debug, Clone)]
pub struct SpreadPlacement {
    pub hedge: LegFill,
    pub primary: LegFill,
}

pub struct OrderExecutor {
    broker: Arc<dyn BrokerApi>,
    cfg: ExecutorConfig,
    dry_seq: AtomicU64,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn BrokerApi>, cfg: ExecutorConfig) -> Self {
        Self {
            broker,
            cfg,
            dry_seq: AtomicU64::new(0),
        }
    }

    /// Price type for a symbol: override table first, configured default
    /// otherwise.
    pub fn price_type_for(&self, symbol: &str) -> PriceType {
        self.cfg
            .price_type_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.cfg.default_price_type)
    }

    /// Limit price biased in the protective direction, on the exchange
    /// tick grid.
    fn buffered_price(&self, side: TransactionSide, ltp: f64) -> f64 {
        let factor = match side {
            TransactionSide::Buy => 1.0 + self.cfg.slippage_pct / 100.0,
            TransactionSide::Sell => 1.0 - self.cfg.slippage_pct / 100.0,
        };
        // NSE F&O ticks in 0.05.
        (ltp * factor * 20.0).round() / 20.0
    }

    async fn place_leg(
        &self,
        contract: &Contract,
        side: TransactionSide,
        lots: u32,
    ) -> Result<LegFill, ExecutionError> {
        self.place_simple(
            &contract.tradingsymbol,
            &contract.token,
            side,
            lots * contract.lot_size,
        )
        .await
    }

    /// Place one order by symbol/token: resolve price policy, fetch the
    /// quote if a limit is needed, submit. Square-offs use this directly
    /// since a live position carries symbols, not resolved contracts.
    pub async fn place_simple(
        &self,
        tradingsymbol: &str,
        token: &str,
        side: TransactionSide,
        quantity: u32,
    ) -> Result<LegFill, ExecutionError> {
        let price_type = self.price_type_for(tradingsymbol);

        if self.cfg.dry_run {
            let n = self.dry_seq.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                symbol = %tradingsymbol,
                side = side.as_str(),
                "[EXEC] dry run, synthetic fill"
            );
            return Ok(LegFill {
                order_id: format!("dry-{n}"),
                price_type,
                limit_price: None,
            });
        }

        let limit_price = match price_type {
            PriceType::Market => None,
            PriceType::Limit => {
                let quote = self
                    .broker
                    .quote(&self.cfg.exchange, token)
                    .await
                    .map_err(|e| ExecutionError::QuoteUnavailable {
                        symbol: tradingsymbol.to_string(),
                        detail: e.to_string(),
                    })?;
                Some(self.buffered_price(side, quote.last_price))
            }
        };

        let params = OrderParams {
            side,
            product_type: self.cfg.product_type.clone(),
            exchange: self.cfg.exchange.clone(),
            tradingsymbol: tradingsymbol.to_string(),
            quantity,
            price_type,
            price: limit_price,
        };
        let ack = self
            .broker
            .place_order(&params)
            .await
            .map_err(|e| ExecutionError::OrderRejected {
                symbol: tradingsymbol.to_string(),
                message: e.to_string(),
            })?;
        if !ack.success {
            return Err(ExecutionError::OrderRejected {
                symbol: tradingsymbol.to_string(),
                message: ack.message.unwrap_or_else(|| "rejected".to_string()),
            });
        }
        let order_id = ack.order_id.unwrap_or_default();
        info!(
            symbol = %tradingsymbol,
            side = side.as_str(),
            order_id = %order_id,
            price = ?limit_price,
            "[EXEC] order placed"
        );
        Ok(LegFill {
            order_id,
            price_type,
            limit_price,
        })
    }

    /// Single-leg future order.
    pub async fn place_future_order(
        &self,
        contract: &Contract,
        side: TransactionSide,
        lots: u32,
    ) -> Result<LegFill, ExecutionError> {
        self.place_leg(contract, side, lots).await
    }

    /// Two-leg credit spread: hedge bought first, primary sold only if
    /// the hedge succeeded.
    pub async fn place_spread(
        &self,
        spread: &CreditSpread,
        lots: u32,
    ) -> Result<SpreadPlacement, ExecutionError> {
        let hedge = self
            .place_leg(&spread.hedge, TransactionSide::Buy, lots)
            .await?;

        match self.place_leg(&spread.atm, TransactionSide::Sell, lots).await {
            Ok(primary) => Ok(SpreadPlacement { hedge, primary }),
            Err(e) => {
                warn!(
                    hedge_order = %hedge.order_id,
                    error = %e,
                    "[EXEC] primary leg failed after hedge fill, hedge left live"
                );
                Err(ExecutionError::PrimaryLegRejected {
                    symbol: spread.atm.tradingsymbol.clone(),
                    message: e.to_string(),
                    hedge_order_id: hedge.order_id,
                })
            }
        }
    }

    /// Close one leg of an existing position (opposite side order).
    pub async fn square_off_leg(
        &self,
        contract: &Contract,
        entry_side: TransactionSide,
        lots: u32,
    ) -> Result<LegFill, ExecutionError> {
        self.place_leg(contract, entry_side.opposite(), lots).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use varaha_broker::{MockBroker, OrderAck};
    use varaha_models::{InstrumentKind, OptionRight};

    fn contract(symbol: &str, token: &str, strike: f64) -> Contract {
        Contract {
            tradingsymbol: symbol.to_string(),
            token: token.to_string(),
            lot_size: 75,
            expiry: NaiveDate::from_ymd_opt(2026, 2, 26).unwrap(),
            strike,
            kind: InstrumentKind::OptIdx,
            right: Some(OptionRight::Put),
        }
    }

    fn spread() -> CreditSpread {
        CreditSpread {
            atm: contract("NIFTY26FEB25000PE", "1001", 25000.0),
            hedge: contract("NIFTY26FEB24800PE", "1002", 24800.0),
        }
    }

    fn config(dry_run: bool, default_price_type: PriceType) -> ExecutorConfig {
        ExecutorConfig {
            exchange: "NFO".to_string(),
            product_type: "NRML".to_string(),
            dry_run,
            slippage_pct: 1.0,
            default_price_type,
            price_type_overrides: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_spread_places_hedge_then_primary() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("NFO", "1001", 120.0);
        broker.set_quote("NFO", "1002", 45.0);
        let executor = OrderExecutor::new(broker.clone(), config(false, PriceType::Limit));

        let placement = executor.place_spread(&spread(), 1).await.unwrap();
        assert!(!placement.hedge.order_id.is_empty());
        assert!(!placement.primary.order_id.is_empty());

        let orders = broker.placed_orders();
        assert_eq!(orders.len(), 2);
        // Hedge (buy) strictly first.
        assert_eq!(orders[0].tradingsymbol, "NIFTY26FEB24800PE");
        assert_eq!(orders[0].side, TransactionSide::Buy);
        assert_eq!(orders[1].tradingsymbol, "NIFTY26FEB25000PE");
        assert_eq!(orders[1].side, TransactionSide::Sell);
        assert_eq!(orders[0].quantity, 75);
    }

    #[tokio::test]
    async fn test_hedge_failure_stops_primary() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("NFO", "1001", 120.0);
        broker.set_quote("NFO", "1002", 45.0);
        broker.push_order_ack(OrderAck::rejected("RMS: margin shortfall"));
        let executor = OrderExecutor::new(broker.clone(), config(false, PriceType::Limit));

        let err = executor.place_spread(&spread(), 1).await.unwrap_err();
        assert!(matches!(err, ExecutionError::OrderRejected { .. }));
        // The primary (sell) leg must never have been submitted.
        assert_eq!(broker.order_call_count(), 1);
    }

    #[tokio::test]
    async fn test_primary_failure_reports_live_hedge() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("NFO", "1001", 120.0);
        broker.set_quote("NFO", "1002", 45.0);
        broker.push_order_ack(OrderAck::accepted("H-77"));
        broker.push_order_ack(OrderAck::rejected("RMS: ban period"));
        let executor = OrderExecutor::new(broker.clone(), config(false, PriceType::Limit));

        let err = executor.place_spread(&spread(), 1).await.unwrap_err();
        match err {
            ExecutionError::PrimaryLegRejected { hedge_order_id, .. } => {
                assert_eq!(hedge_order_id, "H-77");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Both calls attempted, no unwind order for the hedge.
        assert_eq!(broker.order_call_count(), 2);
    }

    #[tokio::test]
    async fn test_limit_price_protective_direction() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("NFO", "1001", 100.0);
        let executor = OrderExecutor::new(broker.clone(), config(false, PriceType::Limit));
        let c = contract("NIFTY26FEB25000PE", "1001", 25000.0);

        executor
            .place_future_order(&c, TransactionSide::Buy, 1)
            .await
            .unwrap();
        executor
            .place_future_order(&c, TransactionSide::Sell, 1)
            .await
            .unwrap();
        let orders = broker.placed_orders();
        // 1% buffer: buy above the quote, sell below.
        assert_eq!(orders[0].price, Some(101.0));
        assert_eq!(orders[1].price, Some(99.0));
    }

    #[tokio::test]
    async fn test_limit_price_rounds_to_tick() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("NFO", "1001", 123.45);
        let executor = OrderExecutor::new(broker.clone(), config(false, PriceType::Limit));
        let c = contract("NIFTY26FEB25000PE", "1001", 25000.0);
        executor
            .place_future_order(&c, TransactionSide::Buy, 1)
            .await
            .unwrap();
        let price = broker.placed_orders()[0].price.unwrap();
        // 123.45 * 1.01 = 124.6845 -> 124.70 on the 0.05 grid.
        assert!((price - 124.70).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_dry_run_skips_network() {
        let broker = Arc::new(MockBroker::new());
        let executor = OrderExecutor::new(broker.clone(), config(true, PriceType::Limit));

        let placement = executor.place_spread(&spread(), 1).await.unwrap();
        assert!(placement.hedge.order_id.starts_with("dry-"));
        assert!(placement.primary.order_id.starts_with("dry-"));
        assert_eq!(broker.order_call_count(), 0);
    }

    #[tokio::test]
    async fn test_price_type_override_table() {
        let broker = Arc::new(MockBroker::new());
        let mut cfg = config(false, PriceType::Limit);
        cfg.price_type_overrides
            .insert("NIFTY26FEB25000PE".to_string(), PriceType::Market);
        let executor = OrderExecutor::new(broker.clone(), cfg);
        let c = contract("NIFTY26FEB25000PE", "1001", 25000.0);

        // Market override: no quote needed, no price on the order.
        executor
            .place_future_order(&c, TransactionSide::Buy, 1)
            .await
            .unwrap();
        assert_eq!(broker.placed_orders()[0].price, None);
        assert_eq!(
            broker.placed_orders()[0].price_type,
            PriceType::Market
        );
    }

    #[tokio::test]
    async fn test_quote_failure_is_structured() {
        let broker = Arc::new(MockBroker::new());
        let executor = OrderExecutor::new(broker.clone(), config(false, PriceType::Limit));
        let c = contract("NIFTY26FEB25000PE", "1001", 25000.0);
        let err = executor
            .place_future_order(&c, TransactionSide::Buy, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::QuoteUnavailable { .. }));
        assert_eq!(broker.order_call_count(), 0);
    }
}
