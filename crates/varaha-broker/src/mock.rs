//! In-memory broker fake for engine and protocol tests.
//!
//! Scripted answers, call counters for protocol assertions (e.g., the
//! hedge-failure test requires exactly one placement call), no network.

use crate::{
    BrokerApi, BrokerPosition, ContractRecord, MarginLeg, OrderAck, OrderParams, QuoteData,
    SpanMarginResponse,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    quotes: HashMap<String, f64>,
    order_acks: VecDeque<OrderAck>,
    placed_orders: Vec<OrderParams>,
    positions: Vec<BrokerPosition>,
    margin: Option<SpanMarginResponse>,
    margin_calls: u32,
    contracts: Vec<ContractRecord>,
    search_calls: u32,
    candles: HashMap<String, Vec<serde_json::Value>>,
}

/// Scripted in-memory broker.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, exchange: &str, token: &str, last_price: f64) {
        let mut s = self.state.lock().unwrap();
        s.quotes.insert(format!("{exchange}:{token}"), last_price);
    }

    /// Queue the next order acknowledgements, consumed in order.
    pub fn push_order_ack(&self, ack: OrderAck) {
        self.state.lock().unwrap().order_acks.push_back(ack);
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        self.state.lock().unwrap().positions = positions;
    }

    pub fn set_margin(&self, response: SpanMarginResponse) {
        self.state.lock().unwrap().margin = Some(response);
    }

    pub fn set_contracts(&self, contracts: Vec<ContractRecord>) {
        self.state.lock().unwrap().contracts = contracts;
    }

    pub fn set_candles(&self, exchange: &str, token: &str, rows: Vec<serde_json::Value>) {
        let mut s = self.state.lock().unwrap();
        s.candles.insert(format!("{exchange}:{token}"), rows);
    }

    /// Number of orders submitted so far.
    pub fn order_call_count(&self) -> usize {
        self.state.lock().unwrap().placed_orders.len()
    }

    /// Copies of every submitted order, in submission order.
    pub fn placed_orders(&self) -> Vec<OrderParams> {
        self.state.lock().unwrap().placed_orders.clone()
    }

    pub fn margin_call_count(&self) -> u32 {
        self.state.lock().unwrap().margin_calls
    }

    pub fn search_call_count(&self) -> u32 {
        self.state.lock().unwrap().search_calls
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn quote(&self, exchange: &str, token: &str) -> Result<QuoteData> {
        let s = self.state.lock().unwrap();
        s.quotes
            .get(&format!("{exchange}:{token}"))
            .map(|&last_price| QuoteData { last_price })
            .ok_or_else(|| anyhow!("no scripted quote for {exchange}:{token}"))
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck> {
        let mut s = self.state.lock().unwrap();
        s.placed_orders.push(params.clone());
        let n = s.placed_orders.len();
        Ok(s
            .order_acks
            .pop_front()
            .unwrap_or_else(|| OrderAck::accepted(format!("mock-{n}"))))
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn span_margin(
        &self,
        _account_id: &str,
        _legs: &[MarginLeg],
    ) -> Result<SpanMarginResponse> {
        let mut s = self.state.lock().unwrap();
        s.margin_calls += 1;
        s.margin
            .clone()
            .ok_or_else(|| anyhow!("no scripted margin response"))
    }

    async fn search_contracts(&self, _exchange: &str, text: &str) -> Result<Vec<ContractRecord>> {
        let mut s = self.state.lock().unwrap();
        s.search_calls += 1;
        Ok(s
            .contracts
            .iter()
            .filter(|c| c.base_symbol == text || c.tradingsymbol.contains(text))
            .cloned()
            .collect())
    }

    async fn time_series(
        &self,
        exchange: &str,
        token: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _interval_minutes: u32,
    ) -> Result<Vec<serde_json::Value>> {
        let s = self.state.lock().unwrap();
        Ok(s.candles
            .get(&format!("{exchange}:{token}"))
            .cloned()
            .unwrap_or_default())
    }
}
