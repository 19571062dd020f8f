//! Contract resolver: picks the derivative contract(s) a trade needs.
//!
//! Works off an in-memory contract universe keyed by exchange. An empty
//! universe triggers exactly one refresh attempt through the broker's
//! contract search, rate-limited to once per cooldown window so a
//! resolution failure cannot become a download storm.
//!
//! Resolution failures are structured reason values, never panics: an
//! abandoned action for one instrument must not take down the tick loop.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use varaha_broker::{BrokerApi, ContractRecord};
use varaha_models::{Contract, CreditSpread, ExpiryPolicy, InstrumentKind, OptionRight};

/// Matched strikes may deviate from the requested strike by at most this
/// fraction before the universe is considered stale/sparse.
const STRIKE_TOLERANCE: f64 = 0.05;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("contract_universe_empty: {exchange}")]
    UniverseEmpty { exchange: String },
    #[error("no_expiry_found: {symbol} ({policy})")]
    NoExpiry { symbol: String, policy: String },
    #[error("option_symbol_not_found: {symbol} strike {strike}")]
    OptionSymbolNotFound { symbol: String, strike: f64 },
    #[error("future_symbol_not_found: {symbol}")]
    FutureNotFound { symbol: String },
    #[error("lot_size_unknown: {symbol}")]
    LotSizeUnknown { symbol: String },
}

/// Resolves base symbols into concrete contracts or spreads.
pub struct ContractResolver {
    broker: Arc<dyn BrokerApi>,
    cooldown: Duration,
    universe: HashMap<String, Vec<ContractRecord>>,
    last_refresh: HashMap<String, Instant>,
    /// Per-base-symbol lot sizes used when the contract master lacks one.
    lot_size_fallback: HashMap<String, u32>,
}

impl ContractResolver {
    pub fn new(broker: Arc<dyn BrokerApi>, cooldown_secs: u64) -> Self {
        Self {
            broker,
            cooldown: Duration::from_secs(cooldown_secs),
            universe: HashMap::new(),
            last_refresh: HashMap::new(),
            lot_size_fallback: HashMap::new(),
        }
    }

    pub fn with_lot_sizes(mut self, lot_sizes: HashMap<String, u32>) -> Self {
        self.lot_size_fallback = lot_sizes;
        self
    }

    /// Seed the universe without a broker round trip (startup priming).
    pub fn prime(&mut self, exchange: &str, contracts: Vec<ContractRecord>) {
        self.universe.insert(exchange.to_string(), contracts);
    }

    /// Make sure the exchange has a universe, refreshing at most once per
    /// cooldown window.
    async fn ensure_universe(&mut self, exchange: &str, symbol: &str) -> Result<(), ResolveError> {
        let populated = self
            .universe
            .get(exchange)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if populated {
            return Ok(());
        }

        let allowed = self
            .last_refresh
            .get(exchange)
            .map(|t| t.elapsed() >= self.cooldown)
            .unwrap_or(true);
        if allowed {
            self.last_refresh.insert(exchange.to_string(), Instant::now());
            match self.broker.search_contracts(exchange, symbol).await {
                Ok(contracts) if !contracts.is_empty() => {
                    debug!(
                        exchange = %exchange,
                        count = contracts.len(),
                        "[CONTRACTS] universe refreshed"
                    );
                    self.universe.insert(exchange.to_string(), contracts);
                }
                Ok(_) => warn!(exchange = %exchange, "[CONTRACTS] refresh returned nothing"),
                Err(e) => warn!(exchange = %exchange, error = %e, "[CONTRACTS] refresh failed"),
            }
        } else {
            debug!(exchange = %exchange, "[CONTRACTS] refresh rate-limited, skipping");
        }

        let populated = self
            .universe
            .get(exchange)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if populated {
            Ok(())
        } else {
            Err(ResolveError::UniverseEmpty {
                exchange: exchange.to_string(),
            })
        }
    }

    fn records(
        &self,
        exchange: &str,
        symbol: &str,
        kind: InstrumentKind,
    ) -> Vec<&ContractRecord> {
        self.universe
            .get(exchange)
            .map(|v| {
                v.iter()
                    .filter(|c| c.base_symbol == symbol && c.kind == kind)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Earliest expiry on or after `today` under the given policy, from
    /// the cached universe.
    pub fn select_expiry(
        &self,
        exchange: &str,
        symbol: &str,
        policy: ExpiryPolicy,
        kind: InstrumentKind,
        today: NaiveDate,
    ) -> Result<NaiveDate, ResolveError> {
        let mut expiries: Vec<NaiveDate> = self
            .records(exchange, symbol, kind)
            .iter()
            .map(|c| c.expiry)
            .collect();
        expiries.sort();
        expiries.dedup();
        pick_expiry(&expiries, policy, today).ok_or_else(|| ResolveError::NoExpiry {
            symbol: symbol.to_string(),
            policy: policy.as_str().to_string(),
        })
    }

    /// Resolve the nearest future contract for a base symbol.
    pub async fn resolve_future(
        &mut self,
        exchange: &str,
        symbol: &str,
        policy: ExpiryPolicy,
        kind: InstrumentKind,
        today: NaiveDate,
    ) -> Result<Contract, ResolveError> {
        self.ensure_universe(exchange, symbol).await?;
        let expiry = self.select_expiry(exchange, symbol, policy, kind, today)?;
        let record = self
            .records(exchange, symbol, kind)
            .into_iter()
            .find(|c| c.expiry == expiry)
            .ok_or_else(|| ResolveError::FutureNotFound {
                symbol: symbol.to_string(),
            })?;
        to_contract(record, self.lot_size_fallback.get(symbol).copied())
    }

    /// Resolve a credit spread: ATM leg at the strike closest to `ltp`,
    /// hedge leg `hedge_steps` strike-steps further out on the protective
    /// side (below ATM for puts, above for calls).
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve_credit_spread(
        &mut self,
        exchange: &str,
        symbol: &str,
        ltp: f64,
        right: OptionRight,
        hedge_steps: u32,
        policy: ExpiryPolicy,
        kind: InstrumentKind,
        today: NaiveDate,
    ) -> Result<CreditSpread, ResolveError> {
        self.ensure_universe(exchange, symbol).await?;
        let expiry = self.select_expiry(exchange, symbol, policy, kind, today)?;

        let mut strikes: Vec<f64> = self
            .records(exchange, symbol, kind)
            .iter()
            .filter(|c| c.right == Some(right) && c.expiry == expiry && c.strike > 0.0)
            .map(|c| c.strike)
            .collect();
        strikes.sort_by(|a, b| a.total_cmp(b));
        strikes.dedup();
        if strikes.len() < 2 {
            return Err(ResolveError::OptionSymbolNotFound {
                symbol: symbol.to_string(),
                strike: ltp,
            });
        }

        let atm = nearest(&strikes, ltp);
        if (atm - ltp).abs() > STRIKE_TOLERANCE * ltp.abs() {
            return Err(ResolveError::OptionSymbolNotFound {
                symbol: symbol.to_string(),
                strike: ltp,
            });
        }

        // Strike step: smallest positive gap between consecutive strikes.
        let step = strikes
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| *d > 0.0)
            .fold(f64::MAX, f64::min);

        let hedge_target = match right {
            OptionRight::Put => atm - hedge_steps as f64 * step,
            OptionRight::Call => atm + hedge_steps as f64 * step,
        };
        let hedge = nearest(&strikes, hedge_target);
        if (hedge - hedge_target).abs() > STRIKE_TOLERANCE * hedge_target.abs() || hedge == atm {
            return Err(ResolveError::OptionSymbolNotFound {
                symbol: symbol.to_string(),
                strike: hedge_target,
            });
        }

        let atm_leg = self.option_contract(exchange, symbol, kind, right, expiry, atm)?;
        let hedge_leg = self.option_contract(exchange, symbol, kind, right, expiry, hedge)?;
        Ok(CreditSpread {
            atm: atm_leg,
            hedge: hedge_leg,
        })
    }

    fn option_contract(
        &self,
        exchange: &str,
        symbol: &str,
        kind: InstrumentKind,
        right: OptionRight,
        expiry: NaiveDate,
        strike: f64,
    ) -> Result<Contract, ResolveError> {
        let record = self
            .records(exchange, symbol, kind)
            .into_iter()
            .find(|c| c.right == Some(right) && c.expiry == expiry && c.strike == strike)
            .ok_or(ResolveError::OptionSymbolNotFound {
                symbol: symbol.to_string(),
                strike,
            })?;
        to_contract(record, self.lot_size_fallback.get(symbol).copied())
    }
}

fn to_contract(record: &ContractRecord, fallback: Option<u32>) -> Result<Contract, ResolveError> {
    let lot_size = if record.lot_size > 0 {
        record.lot_size
    } else {
        fallback
            .filter(|l| *l > 0)
            .ok_or_else(|| ResolveError::LotSizeUnknown {
                symbol: record.tradingsymbol.clone(),
            })?
    };
    Ok(Contract {
        tradingsymbol: record.tradingsymbol.clone(),
        token: record.token.clone(),
        lot_size,
        expiry: record.expiry,
        strike: record.strike,
        kind: record.kind,
        right: record.right,
    })
}

/// Strike closest to the target. `strikes` must be non-empty.
fn nearest(strikes: &[f64], target: f64) -> f64 {
    strikes
        .iter()
        .copied()
        .min_by(|a, b| (a - target).abs().total_cmp(&(b - target).abs()))
        .unwrap_or(target)
}

/// Earliest expiry >= today under the policy. Monthly filters to last
/// Thursdays, with a fallback to the nearest available expiry when the
/// known set contains none.
pub fn pick_expiry(
    expiries: &[NaiveDate],
    policy: ExpiryPolicy,
    today: NaiveDate,
) -> Option<NaiveDate> {
    let mut upcoming: Vec<NaiveDate> = expiries.iter().copied().filter(|d| *d >= today).collect();
    upcoming.sort();
    match policy {
        ExpiryPolicy::Nearest => upcoming.first().copied(),
        ExpiryPolicy::Monthly => upcoming
            .iter()
            .copied()
            .find(|d| is_last_weekday_of_month(*d, Weekday::Thu))
            .or_else(|| upcoming.first().copied()),
    }
}

/// Whether `date` is the last occurrence of `weekday` in its month.
fn is_last_weekday_of_month(date: NaiveDate, weekday: Weekday) -> bool {
    date.weekday() == weekday && (date + ChronoDuration::days(7)).month() != date.month()
}

#[cfg(test)]
mod tests {
    use super::*;
    use varaha_broker::MockBroker;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn option_record(strike: f64, right: OptionRight, expiry: NaiveDate) -> ContractRecord {
        ContractRecord {
            kind: InstrumentKind::OptIdx,
            tradingsymbol: format!("NIFTY{}{}", strike as i64, right.to_exchange()),
            token: format!("{}", 90000 + strike as i64),
            expiry,
            strike,
            lot_size: 75,
            right: Some(right),
            base_symbol: "NIFTY".to_string(),
        }
    }

    fn resolver_with(contracts: Vec<ContractRecord>) -> ContractResolver {
        let broker = Arc::new(MockBroker::new());
        let mut resolver = ContractResolver::new(broker, 300);
        resolver.prime("NFO", contracts);
        resolver
    }

    #[test]
    fn test_monthly_expiry_picks_last_thursday() {
        // 2026-02-19 and 2026-02-26 are both Thursdays; only the 26th is
        // the last Thursday of February.
        let expiries = vec![date(2026, 2, 19), date(2026, 2, 26)];
        let picked = pick_expiry(&expiries, ExpiryPolicy::Monthly, date(2026, 2, 1));
        assert_eq!(picked, Some(date(2026, 2, 26)));
    }

    #[test]
    fn test_nearest_expiry_skips_past_dates() {
        let expiries = vec![date(2026, 2, 19), date(2026, 2, 26), date(2026, 3, 5)];
        let picked = pick_expiry(&expiries, ExpiryPolicy::Nearest, date(2026, 2, 20));
        assert_eq!(picked, Some(date(2026, 2, 26)));
    }

    #[test]
    fn test_monthly_falls_back_to_nearest_available() {
        // No last-Thursday expiry in the known set.
        let expiries = vec![date(2026, 2, 19), date(2026, 3, 5)];
        let picked = pick_expiry(&expiries, ExpiryPolicy::Monthly, date(2026, 2, 1));
        assert_eq!(picked, Some(date(2026, 2, 19)));
    }

    #[test]
    fn test_no_upcoming_expiry() {
        let expiries = vec![date(2026, 2, 19)];
        assert_eq!(
            pick_expiry(&expiries, ExpiryPolicy::Nearest, date(2026, 3, 1)),
            None
        );
    }

    #[tokio::test]
    async fn test_put_spread_resolution_ladder() {
        let expiry = date(2026, 2, 26);
        let contracts = vec![
            option_record(24800.0, OptionRight::Put, expiry),
            option_record(25000.0, OptionRight::Put, expiry),
            option_record(25100.0, OptionRight::Put, expiry),
        ];
        let mut resolver = resolver_with(contracts);
        let spread = resolver
            .resolve_credit_spread(
                "NFO",
                "NIFTY",
                25010.0,
                OptionRight::Put,
                2,
                ExpiryPolicy::Monthly,
                InstrumentKind::OptIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap();
        // Step is the smallest gap (100); ATM closest to 25010 is 25000;
        // hedge = 25000 - 2*100 = 24800.
        assert_eq!(spread.atm.strike, 25000.0);
        assert_eq!(spread.hedge.strike, 24800.0);
        assert_eq!(spread.lot_size(), 75);
    }

    #[tokio::test]
    async fn test_call_spread_hedges_above() {
        let expiry = date(2026, 2, 26);
        let contracts = vec![
            option_record(24900.0, OptionRight::Call, expiry),
            option_record(25000.0, OptionRight::Call, expiry),
            option_record(25100.0, OptionRight::Call, expiry),
        ];
        let mut resolver = resolver_with(contracts);
        let spread = resolver
            .resolve_credit_spread(
                "NFO",
                "NIFTY",
                24990.0,
                OptionRight::Call,
                1,
                ExpiryPolicy::Nearest,
                InstrumentKind::OptIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap();
        assert_eq!(spread.atm.strike, 25000.0);
        assert_eq!(spread.hedge.strike, 25100.0);
    }

    #[tokio::test]
    async fn test_sparse_ladder_fails_within_tolerance() {
        let expiry = date(2026, 2, 26);
        let contracts = vec![
            option_record(24800.0, OptionRight::Put, expiry),
            option_record(25000.0, OptionRight::Put, expiry),
            option_record(25100.0, OptionRight::Put, expiry),
        ];
        let mut resolver = resolver_with(contracts);
        // Hedge target 25000 - 20*100 = 23000; closest strike 24800
        // deviates far beyond 5%.
        let err = resolver
            .resolve_credit_spread(
                "NFO",
                "NIFTY",
                25010.0,
                OptionRight::Put,
                20,
                ExpiryPolicy::Nearest,
                InstrumentKind::OptIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::OptionSymbolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_atm_far_from_ltp_fails() {
        let expiry = date(2026, 2, 26);
        let contracts = vec![
            option_record(24800.0, OptionRight::Put, expiry),
            option_record(25000.0, OptionRight::Put, expiry),
        ];
        let mut resolver = resolver_with(contracts);
        let err = resolver
            .resolve_credit_spread(
                "NFO",
                "NIFTY",
                30000.0,
                OptionRight::Put,
                1,
                ExpiryPolicy::Nearest,
                InstrumentKind::OptIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::OptionSymbolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_universe_refresh_is_rate_limited() {
        let broker = Arc::new(MockBroker::new());
        let mut resolver = ContractResolver::new(broker.clone(), 300);

        let first = resolver
            .resolve_future(
                "NFO",
                "NIFTY",
                ExpiryPolicy::Nearest,
                InstrumentKind::FutIdx,
                date(2026, 2, 1),
            )
            .await;
        assert!(matches!(first, Err(ResolveError::UniverseEmpty { .. })));
        assert_eq!(broker.search_call_count(), 1);

        // Second failure inside the cooldown must not hit the broker
        // again.
        let second = resolver
            .resolve_future(
                "NFO",
                "NIFTY",
                ExpiryPolicy::Nearest,
                InstrumentKind::FutIdx,
                date(2026, 2, 1),
            )
            .await;
        assert!(matches!(second, Err(ResolveError::UniverseEmpty { .. })));
        assert_eq!(broker.search_call_count(), 1);
    }

    #[tokio::test]
    async fn test_lot_size_fallback_table() {
        let record = ContractRecord {
            kind: InstrumentKind::FutIdx,
            tradingsymbol: "NIFTY26FEBFUT".to_string(),
            token: "53001".to_string(),
            expiry: date(2026, 2, 26),
            strike: 0.0,
            lot_size: 0, // contract master gap
            right: None,
            base_symbol: "NIFTY".to_string(),
        };

        let broker = Arc::new(MockBroker::new());
        let mut bare = ContractResolver::new(broker.clone(), 300);
        bare.prime("NFO", vec![record.clone()]);
        let err = bare
            .resolve_future(
                "NFO",
                "NIFTY",
                ExpiryPolicy::Nearest,
                InstrumentKind::FutIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::LotSizeUnknown { .. }));

        let mut with_table = ContractResolver::new(broker, 300)
            .with_lot_sizes(std::collections::HashMap::from([(
                "NIFTY".to_string(),
                75,
            )]));
        with_table.prime("NFO", vec![record]);
        let contract = with_table
            .resolve_future(
                "NFO",
                "NIFTY",
                ExpiryPolicy::Nearest,
                InstrumentKind::FutIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap();
        assert_eq!(contract.lot_size, 75);
    }

    #[tokio::test]
    async fn test_resolve_future_nearest() {
        let contracts = vec![
            ContractRecord {
                kind: InstrumentKind::FutIdx,
                tradingsymbol: "NIFTY26FEBFUT".to_string(),
                token: "53001".to_string(),
                expiry: date(2026, 2, 26),
                strike: 0.0,
                lot_size: 75,
                right: None,
                base_symbol: "NIFTY".to_string(),
            },
            ContractRecord {
                kind: InstrumentKind::FutIdx,
                tradingsymbol: "NIFTY26MARFUT".to_string(),
                token: "53002".to_string(),
                expiry: date(2026, 3, 26),
                strike: 0.0,
                lot_size: 75,
                right: None,
                base_symbol: "NIFTY".to_string(),
            },
        ];
        let mut resolver = resolver_with(contracts);
        let contract = resolver
            .resolve_future(
                "NFO",
                "NIFTY",
                ExpiryPolicy::Nearest,
                InstrumentKind::FutIdx,
                date(2026, 2, 1),
            )
            .await
            .unwrap();
        assert_eq!(contract.tradingsymbol, "NIFTY26FEBFUT");
        assert_eq!(contract.lot_size, 75);
    }
}
