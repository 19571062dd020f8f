//! The tick loop: orchestrates facts, rules, and execution.
//!
//! One tick walks every instrument in the universe in sequence: candles
//! in, facts out, rules evaluated, the triggered action batch executed in
//! sequence order. Engine-global rules run once per tick after the
//! universe pass, and the session ledger is persisted at the end, so a
//! crash between ticks loses at most one tick of mutation.
//!
//! Per-instrument failures (no data, resolution misses, rejected orders)
//! are logged with structured reasons and never abort the tick.

use crate::config::EngineConfig;
use crate::contracts::ContractResolver;
use crate::execution::{ExecutorConfig, OrderExecutor};
use crate::facts::FactCalculator;
use crate::indicators::{analyze, TechConfig};
use crate::margin::MarginCalculator;
use crate::rules::{
    lookup_instrument_facts, merge_facts, ActionDef, CompiledStrategy, RuleManager,
    StrategyDefinition, TriggeredAction,
};
use crate::series::{convert_candles, CandleFieldMap};
use crate::state::SessionStore;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use varaha_broker::BrokerApi;
use varaha_models::{
    EventSink, ExitRecord, ExpiryPolicy, FactMap, FactValue, Instrument, InstrumentKind,
    OptionRight, Position, PositionStatus, PriceSeries, ScanRecord, SessionState, SignalRecord,
    TransactionSide,
};

/// What one tick did.
#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub instruments_scanned: usize,
    pub actions_executed: usize,
    pub actions_failed: usize,
    pub open_positions: usize,
}

/// The orchestrator.
pub struct Engine {
    cfg: EngineConfig,
    broker: Arc<dyn BrokerApi>,
    strategy: CompiledStrategy,
    facts: FactCalculator,
    field_map: CandleFieldMap,
    tech_cfg: TechConfig,
    resolver: ContractResolver,
    margin: MarginCalculator,
    executor: OrderExecutor,
    store: SessionStore,
    sink: Arc<dyn EventSink>,
}

impl Engine {
    /// Build the engine. Strategy compilation errors are fatal here:
    /// running with a broken rule set is worse than not running.
    pub fn new(
        cfg: EngineConfig,
        broker: Arc<dyn BrokerApi>,
        definition: &StrategyDefinition,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let strategy =
            RuleManager::compile(definition).context("strategy compilation failed")?;
        info!(
            strategy = %strategy.strategy_id(),
            instruments = strategy.universe.len(),
            "[ENGINE] strategy compiled"
        );
        let store = SessionStore::open(&cfg.session_file, cfg.freshness_minutes, Utc::now());
        let executor = OrderExecutor::new(
            broker.clone(),
            ExecutorConfig {
                exchange: cfg.derivative_exchange.clone(),
                product_type: cfg.product_type.clone(),
                dry_run: cfg.dry_run,
                slippage_pct: cfg.slippage_pct,
                default_price_type: cfg.default_price_type,
                price_type_overrides: cfg.price_type_overrides.clone(),
            },
        );
        let resolver = ContractResolver::new(broker.clone(), cfg.contract_refresh_cooldown_secs)
            .with_lot_sizes(cfg.lot_sizes.clone());
        let margin = MarginCalculator::new(
            broker.clone(),
            &cfg.account_id,
            cfg.haircut,
            cfg.margin_cache_ttl_secs,
        )
        .with_exchange(&cfg.derivative_exchange);

        Ok(Self {
            cfg,
            broker,
            strategy,
            facts: FactCalculator::with_defaults(),
            field_map: CandleFieldMap::default(),
            tech_cfg: TechConfig::default(),
            resolver,
            margin,
            executor,
            store,
            sink,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.store.state
    }

    pub fn resolver_mut(&mut self) -> &mut ContractResolver {
        &mut self.resolver
    }

    /// Fold broker-reported live positions into the ledger. Run once at
    /// startup, after load.
    pub async fn startup_reconcile(&mut self, now: DateTime<Utc>) -> Result<()> {
        let positions = self
            .broker
            .positions()
            .await
            .context("fetch broker positions")?;
        self.store.reconcile_with_broker(
            &positions,
            &self.cfg.ghost_rules,
            &self.cfg.ghost_template,
            now,
        );
        Ok(())
    }

    /// Run one evaluation tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let session_facts = session_facts(now);
        let params_facts: FactMap = self
            .strategy
            .params
            .iter()
            .map(|(k, v)| (k.clone(), FactValue::Num(*v)))
            .collect();

        let universe = self.strategy.universe.clone();

        // Gather pass: compute this tick's live facts per instrument.
        // Instruments with no usable candles simply stay absent from the
        // cache and fall back to neutral placeholders at lookup.
        let mut live_facts: HashMap<String, FactMap> = HashMap::new();
        let mut ltps: HashMap<String, Option<f64>> = HashMap::new();
        for instrument in &universe {
            let series = self.fetch_series(instrument, now).await;
            ltps.insert(instrument.token.clone(), series.last_close());
            if !series.is_empty() {
                let tech = analyze(&series, &self.tech_cfg);
                live_facts.insert(
                    instrument.feed_key(),
                    self.facts
                        .compute(&series, &tech, &self.strategy.fact_overrides),
                );
            }
        }

        // Evaluate pass: prefixed-key lookup with bare-token fallback.
        for instrument in &universe {
            let ltp = ltps.get(&instrument.token).copied().flatten();

            self.mark_position(instrument, ltp).await;

            let inst_facts = lookup_instrument_facts(&live_facts, instrument);
            let portfolio_facts = self.portfolio_facts(Some(&instrument.token));
            let merged = merge_facts(&[
                &session_facts,
                &params_facts,
                &portfolio_facts,
                &inst_facts,
            ]);

            let score = self.strategy.evaluate_score(&merged);
            let actions = self.strategy.evaluate(&merged);

            let mut margin_seen: Option<f64> = None;
            for triggered in actions {
                match self
                    .execute_action(instrument, &triggered, ltp, score, now, &mut margin_seen)
                    .await
                {
                    Ok(true) => summary.actions_executed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        summary.actions_failed += 1;
                        warn!(
                            token = %instrument.token,
                            rule = %triggered.rule,
                            action = %triggered.action.kind,
                            reason = %e,
                            "[ENGINE] action abandoned"
                        );
                    }
                }
            }

            self.sink.on_scan(&ScanRecord {
                ts: now,
                token: instrument.token.clone(),
                symbol: instrument.symbol.clone().unwrap_or_default(),
                ltp,
                score,
                filter_scores: self.filter_scores(&inst_facts),
                margin_required: margin_seen,
                position_open: self.store.state.active_positions.contains_key(&instrument.token),
            });
            summary.instruments_scanned += 1;
        }

        // Engine-global rules: once per tick, no instrument facts.
        let portfolio_facts = self.portfolio_facts(None);
        let merged = merge_facts(&[&session_facts, &params_facts, &portfolio_facts]);
        for triggered in self.strategy.evaluate_engine(&merged) {
            match self.execute_global_action(&triggered, now).await {
                Ok(true) => summary.actions_executed += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.actions_failed += 1;
                    warn!(
                        rule = %triggered.rule,
                        action = %triggered.action.kind,
                        reason = %e,
                        "[ENGINE] global action abandoned"
                    );
                }
            }
        }

        // Portfolio max-PnL ratchet feeds the trailing-stop facts.
        let open_pnl = self.store.state.open_pnl();
        if open_pnl > self.store.state.max_portfolio_pnl {
            self.store.state.max_portfolio_pnl = open_pnl;
        }

        if let Err(e) = self.store.save(now) {
            warn!(error = %e, "[ENGINE] session save failed, in-memory state stays authoritative");
        }
        summary.open_positions = self.store.state.active_positions.len();
        Ok(summary)
    }

    async fn fetch_series(&self, instrument: &Instrument, now: DateTime<Utc>) -> PriceSeries {
        let start = now - chrono::Duration::minutes(self.cfg.history_minutes);
        match self
            .broker
            .time_series(
                &instrument.exchange,
                &instrument.token,
                start,
                now,
                self.cfg.candle_interval_minutes,
            )
            .await
        {
            Ok(rows) => convert_candles(&rows, &self.field_map),
            Err(e) => {
                warn!(token = %instrument.token, error = %e, "[ENGINE] candle fetch failed");
                PriceSeries::default()
            }
        }
    }

    /// Re-mark the open position on this token, if any. Quote failures
    /// keep the previous mark.
    async fn mark_position(&mut self, instrument: &Instrument, ltp: Option<f64>) {
        let Some(pos) = self.store.state.active_positions.get(&instrument.token).cloned() else {
            return;
        };
        let qty = (pos.lots * pos.lot_size) as f64;

        let pnl = if pos.is_spread() {
            let (Some(atm_token), Some(hedge_token)) = (&pos.atm_token, &pos.hedge_token) else {
                return;
            };
            let exchange = self.cfg.derivative_exchange.clone();
            let atm_quote = self.broker.quote(&exchange, atm_token).await;
            let hedge_quote = self.broker.quote(&exchange, hedge_token).await;
            match (atm_quote, hedge_quote) {
                (Ok(atm), Ok(hedge)) => {
                    let entry_net =
                        pos.atm_premium.unwrap_or(0.0) - pos.hedge_premium.unwrap_or(0.0);
                    let current_net = atm.last_price - hedge.last_price;
                    // Credit collected minus cost to close.
                    Some((entry_net - current_net) * qty)
                }
                _ => {
                    debug!(token = %instrument.token, "[ENGINE] leg quote missing, mark unchanged");
                    None
                }
            }
        } else {
            ltp.map(|price| {
                let sign = match pos.side {
                    TransactionSide::Buy => 1.0,
                    TransactionSide::Sell => -1.0,
                };
                (price - pos.entry_price) * sign * qty
            })
        };

        if let Some(pnl) = pnl {
            if let Some(live) = self.store.state.active_positions.get_mut(&instrument.token) {
                live.mark_pnl(pnl);
            }
        }
    }

    fn filter_scores(&self, inst_facts: &FactMap) -> BTreeMap<String, f64> {
        self.facts
            .filter_fact_names()
            .into_iter()
            .filter_map(|name| {
                inst_facts
                    .get(&name)
                    .and_then(|v| v.as_f64())
                    .map(|v| (name, v))
            })
            .collect()
    }

    /// Facts describing the portfolio and, when `token` is given, the
    /// position on that token.
    fn portfolio_facts(&self, token: Option<&str>) -> FactMap {
        let state = &self.store.state;
        let mut facts = FactMap::from([
            (
                "open_positions".to_string(),
                FactValue::Num(state.active_positions.len() as f64),
            ),
            ("realized_pnl".to_string(), FactValue::Num(state.realized_pnl)),
            ("open_pnl".to_string(), FactValue::Num(state.open_pnl())),
            (
                "max_portfolio_pnl".to_string(),
                FactValue::Num(state.max_portfolio_pnl),
            ),
            (
                "trade_count".to_string(),
                FactValue::Num(state.trade_count as f64),
            ),
            (
                "trailing_stop_active".to_string(),
                FactValue::Flag(state.global_trailing_stop_active),
            ),
        ]);
        if let Some(token) = token {
            let position = state.active_positions.get(token);
            facts.insert(
                "position_open".to_string(),
                FactValue::Num(if position.is_some() { 1.0 } else { 0.0 }),
            );
            facts.insert(
                "position_pnl".to_string(),
                FactValue::Num(position.map(|p| p.current_pnl).unwrap_or(0.0)),
            );
            facts.insert(
                "position_max_pnl".to_string(),
                FactValue::Num(position.map(|p| p.max_pnl).unwrap_or(0.0)),
            );
            facts.insert(
                "opening_score".to_string(),
                FactValue::Num(state.opening_scores.get(token).copied().unwrap_or(0.0)),
            );
        }
        facts
    }

    /// Execute one instrument-scoped action. Ok(true) = did something.
    async fn execute_action(
        &mut self,
        instrument: &Instrument,
        triggered: &TriggeredAction,
        ltp: Option<f64>,
        score: f64,
        now: DateTime<Utc>,
        margin_seen: &mut Option<f64>,
    ) -> Result<bool> {
        let action = &triggered.action;
        match action.kind.as_str() {
            "enter_credit_spread" => {
                self.enter_credit_spread(instrument, triggered, ltp, score, now, margin_seen)
                    .await
            }
            "enter_future" => {
                self.enter_future(instrument, triggered, ltp, score, now, margin_seen)
                    .await
            }
            "square_off" => {
                let reason = param_str(action, "reason")
                    .unwrap_or_else(|| "square_off_rule".to_string());
                self.square_off_position(&instrument.token, &reason, now).await
            }
            "alert" => {
                self.sink.on_signal(&SignalRecord {
                    ts: now,
                    token: instrument.token.clone(),
                    symbol: instrument.symbol.clone().unwrap_or_default(),
                    strategy: self.strategy.name.clone(),
                    side: TransactionSide::Buy,
                    score,
                    detail: param_str(action, "message")
                        .unwrap_or_else(|| triggered.rule.clone()),
                });
                Ok(true)
            }
            other => {
                warn!(action = %other, rule = %triggered.rule, "[ENGINE] unknown action type");
                Ok(false)
            }
        }
    }

    /// Execute one engine-global action.
    async fn execute_global_action(
        &mut self,
        triggered: &TriggeredAction,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let action = &triggered.action;
        match action.kind.as_str() {
            "square_off_all" => {
                let reason = param_str(action, "reason")
                    .unwrap_or_else(|| "square_off_all_rule".to_string());
                let tokens: Vec<String> =
                    self.store.state.active_positions.keys().cloned().collect();
                let mut any = false;
                for token in tokens {
                    match self.square_off_position(&token, &reason, now).await {
                        Ok(done) => any |= done,
                        Err(e) => {
                            warn!(token = %token, reason = %e, "[ENGINE] square-off-all leg failed")
                        }
                    }
                }
                Ok(any)
            }
            "arm_trailing_stop" => {
                if !self.store.state.global_trailing_stop_active {
                    info!("[ENGINE] global trailing stop armed");
                    self.store.state.global_trailing_stop_active = true;
                    return Ok(true);
                }
                Ok(false)
            }
            "disarm_trailing_stop" => {
                self.store.state.global_trailing_stop_active = false;
                Ok(false)
            }
            "alert" => {
                self.sink.on_signal(&SignalRecord {
                    ts: now,
                    token: String::new(),
                    symbol: String::new(),
                    strategy: self.strategy.name.clone(),
                    side: TransactionSide::Buy,
                    score: 0.0,
                    detail: param_str(action, "message")
                        .unwrap_or_else(|| triggered.rule.clone()),
                });
                Ok(true)
            }
            other => {
                warn!(action = %other, rule = %triggered.rule, "[ENGINE] unknown global action");
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn enter_credit_spread(
        &mut self,
        instrument: &Instrument,
        triggered: &TriggeredAction,
        ltp: Option<f64>,
        score: f64,
        now: DateTime<Utc>,
        margin_seen: &mut Option<f64>,
    ) -> Result<bool> {
        if self.store.state.active_positions.contains_key(&instrument.token) {
            debug!(token = %instrument.token, "[ENGINE] position already open, entry skipped");
            return Ok(false);
        }
        let action = &triggered.action;
        let symbol = instrument
            .symbol
            .clone()
            .or_else(|| param_str(action, "symbol"))
            .ok_or_else(|| anyhow!("symbol_missing: {}", instrument.token))?;
        let ltp = ltp.ok_or_else(|| anyhow!("no_price_data: {}", instrument.token))?;

        let right = match param_str(action, "right").as_deref() {
            Some("CE") => OptionRight::Call,
            _ => OptionRight::Put,
        };
        let hedge_steps = param_u32(action, "hedge_steps").unwrap_or(self.cfg.hedge_steps);
        let lots = param_u32(action, "lots").unwrap_or(1);
        let policy = parse_policy(param_str(action, "expiry").as_deref());
        let exchange = self.cfg.derivative_exchange.clone();

        let spread = self
            .resolver
            .resolve_credit_spread(
                &exchange,
                &symbol,
                ltp,
                right,
                hedge_steps,
                policy,
                InstrumentKind::OptIdx,
                now.date_naive(),
            )
            .await?;

        let figures = self
            .margin
            .spread_margin(&symbol, &spread, lots, policy, hedge_steps)
            .await?;
        *margin_seen = Some(figures.total);

        let placement = self.executor.place_spread(&spread, lots).await?;

        // Best-effort premiums for the ledger; the mark loop keeps them
        // fresh afterwards.
        let atm_premium = self
            .broker
            .quote(&exchange, &spread.atm.token)
            .await
            .map(|q| q.last_price)
            .ok();
        let hedge_premium = self
            .broker
            .quote(&exchange, &spread.hedge.token)
            .await
            .map(|q| q.last_price)
            .ok();

        let position = Position {
            token: instrument.token.clone(),
            strategy: self.strategy.name.clone(),
            position_type: "credit_spread".to_string(),
            side: TransactionSide::Sell,
            entry_time: now,
            entry_price: atm_premium.unwrap_or(0.0),
            lots,
            lot_size: spread.lot_size(),
            atm_symbol: Some(spread.atm.tradingsymbol.clone()),
            atm_token: Some(spread.atm.token.clone()),
            hedge_symbol: Some(spread.hedge.tradingsymbol.clone()),
            hedge_token: Some(spread.hedge.token.clone()),
            atm_premium,
            hedge_premium,
            max_pnl: 0.0,
            status: PositionStatus::Open,
            current_pnl: 0.0,
        };
        self.store.open_position(position)?;
        self.store
            .state
            .opening_scores
            .insert(instrument.token.clone(), score);

        self.sink.on_signal(&SignalRecord {
            ts: now,
            token: instrument.token.clone(),
            symbol,
            strategy: self.strategy.name.clone(),
            side: TransactionSide::Sell,
            score,
            detail: format!(
                "sold {} / bought {} margin {:.0} orders {}/{}",
                spread.atm.tradingsymbol,
                spread.hedge.tradingsymbol,
                figures.total,
                placement.primary.order_id,
                placement.hedge.order_id,
            ),
        });
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn enter_future(
        &mut self,
        instrument: &Instrument,
        triggered: &TriggeredAction,
        ltp: Option<f64>,
        score: f64,
        now: DateTime<Utc>,
        margin_seen: &mut Option<f64>,
    ) -> Result<bool> {
        if self.store.state.active_positions.contains_key(&instrument.token) {
            debug!(token = %instrument.token, "[ENGINE] position already open, entry skipped");
            return Ok(false);
        }
        let action = &triggered.action;
        let symbol = instrument
            .symbol
            .clone()
            .or_else(|| param_str(action, "symbol"))
            .ok_or_else(|| anyhow!("symbol_missing: {}", instrument.token))?;
        let side = match param_str(action, "side").as_deref() {
            Some("SELL") => TransactionSide::Sell,
            _ => TransactionSide::Buy,
        };
        let lots = param_u32(action, "lots").unwrap_or(1);
        let policy = parse_policy(param_str(action, "expiry").as_deref());
        let exchange = self.cfg.derivative_exchange.clone();

        let contract = self
            .resolver
            .resolve_future(
                &exchange,
                &symbol,
                policy,
                InstrumentKind::FutIdx,
                now.date_naive(),
            )
            .await?;

        let figures = self
            .margin
            .future_margin(&symbol, &contract, side, lots, policy)
            .await?;
        *margin_seen = Some(figures.total);

        let fill = self
            .executor
            .place_future_order(&contract, side, lots)
            .await?;
        let entry_price = fill.limit_price.or(ltp).unwrap_or(0.0);

        let position = Position {
            token: instrument.token.clone(),
            strategy: self.strategy.name.clone(),
            position_type: "future".to_string(),
            side,
            entry_time: now,
            entry_price,
            lots,
            lot_size: contract.lot_size,
            atm_symbol: Some(contract.tradingsymbol.clone()),
            atm_token: Some(contract.token.clone()),
            hedge_symbol: None,
            hedge_token: None,
            atm_premium: None,
            hedge_premium: None,
            max_pnl: 0.0,
            status: PositionStatus::Open,
            current_pnl: 0.0,
        };
        self.store.open_position(position)?;
        self.store
            .state
            .opening_scores
            .insert(instrument.token.clone(), score);

        self.sink.on_signal(&SignalRecord {
            ts: now,
            token: instrument.token.clone(),
            symbol,
            strategy: self.strategy.name.clone(),
            side,
            score,
            detail: format!(
                "{} {} @ {:.2} margin {:.0} order {}",
                side.as_str(),
                contract.tradingsymbol,
                entry_price,
                figures.total,
                fill.order_id,
            ),
        });
        Ok(true)
    }

    /// Close the position on a token: risk-reducing leg first for
    /// spreads (buy back the sold ATM, then sell the hedge).
    async fn square_off_position(
        &mut self,
        token: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(pos) = self.store.state.active_positions.get(token).cloned() else {
            debug!(token = %token, "[ENGINE] square-off with no open position");
            return Ok(false);
        };
        let qty = pos.lots * pos.lot_size;
        let (primary_symbol, primary_token) = match (&pos.atm_symbol, &pos.atm_token) {
            (Some(s), Some(t)) => (s.clone(), t.clone()),
            _ => return Err(anyhow!("square_off_leg_unknown: {}", token)),
        };

        let exit_fill = if pos.is_spread() {
            // Buy back the sold leg first; only then lift the hedge.
            let fill = self
                .executor
                .place_simple(&primary_symbol, &primary_token, TransactionSide::Buy, qty)
                .await?;
            if let (Some(hs), Some(ht)) = (&pos.hedge_symbol, &pos.hedge_token) {
                self.executor
                    .place_simple(hs, ht, TransactionSide::Sell, qty)
                    .await?;
            }
            fill
        } else {
            self.executor
                .place_simple(&primary_symbol, &primary_token, pos.side.opposite(), qty)
                .await?
        };

        let exit = ExitRecord {
            ts: now,
            token: token.to_string(),
            strategy: pos.strategy.clone(),
            entry_price: pos.entry_price,
            exit_price: exit_fill.limit_price.unwrap_or(pos.entry_price),
            pnl: pos.current_pnl,
            reason: reason.to_string(),
        };
        self.sink.on_exit(&exit);
        self.store.close_position(token, exit);
        Ok(true)
    }
}

/// Session/time facts.
fn session_facts(now: DateTime<Utc>) -> FactMap {
    FactMap::from([
        (
            "minute_of_day".to_string(),
            FactValue::Num((now.hour() * 60 + now.minute()) as f64),
        ),
        (
            "day_of_week".to_string(),
            FactValue::Num(now.weekday().num_days_from_monday() as f64),
        ),
    ])
}

fn parse_policy(s: Option<&str>) -> ExpiryPolicy {
    match s {
        Some("monthly") => ExpiryPolicy::Monthly,
        _ => ExpiryPolicy::Nearest,
    }
}

fn param_str(action: &ActionDef, key: &str) -> Option<String> {
    action
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn param_u32(action: &ActionDef, key: &str) -> Option<u32> {
    action.params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_facts_shape() {
        let now = Utc::now();
        let facts = session_facts(now);
        assert!(facts.contains_key("minute_of_day"));
        let dow = facts["day_of_week"].as_f64().unwrap();
        assert!((0.0..=6.0).contains(&dow));
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(parse_policy(Some("monthly")), ExpiryPolicy::Monthly);
        assert_eq!(parse_policy(Some("nearest")), ExpiryPolicy::Nearest);
        assert_eq!(parse_policy(None), ExpiryPolicy::Nearest);
    }
}
