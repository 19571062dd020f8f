//! Broker capability surface for the Varaha decision core.
//!
//! The core never talks HTTP/websocket; it consumes this trait. The real
//! transport (session, auth, token refresh) lives with the host process.
//! Vendor payloads with many optional/varying fields travel as
//! `serde_json::Value` so upstream API drift does not break the core.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use varaha_models::{InstrumentKind, OptionRight, TransactionSide};

pub use mock::MockBroker;

/// Last-price quote for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteData {
    pub last_price: f64,
}

/// Price type requested on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceType {
    Market,
    Limit,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Market => "MARKET",
            PriceType::Limit => "LIMIT",
        }
    }
}

/// One order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderParams {
    pub side: TransactionSide,
    /// Broker product type ("NRML" for carry-forward F&O).
    pub product_type: String,
    pub exchange: String,
    pub tradingsymbol: String,
    pub quantity: u32,
    pub price_type: PriceType,
    /// Limit price; None for market orders.
    pub price: Option<f64>,
}

/// Broker's answer to an order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub success: bool,
    pub order_id: Option<String>,
    /// Broker's message, verbatim, for audit.
    pub message: Option<String>,
}

impl OrderAck {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            message: Some(message.into()),
        }
    }
}

/// One broker-reported live position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub exchange: String,
    pub token: String,
    pub tradingsymbol: String,
    /// Signed net quantity; 0 means flat.
    pub net_qty: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// One leg of a margin-basket request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginLeg {
    pub exchange: String,
    pub tradingsymbol: String,
    pub kind: InstrumentKind,
    /// Expiry formatted as the margin endpoint wants it (YYYY-MM-DD).
    pub expiry: String,
    pub strike: f64,
    pub right: Option<OptionRight>,
    /// Signed quantity: positive buys, negative sells.
    pub quantity: i64,
}

/// Margin engine response. `span`/`exposure` are the interpreted figures;
/// everything else the broker returned rides along verbatim in `extras`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanMarginResponse {
    pub success: bool,
    pub span: f64,
    pub exposure: f64,
    /// Incremental/addon components, passed through for audit only.
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// One row of the broker's contract master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRecord {
    pub kind: InstrumentKind,
    pub tradingsymbol: String,
    pub token: String,
    pub expiry: NaiveDate,
    /// Strike in index points; 0 for futures.
    pub strike: f64,
    pub lot_size: u32,
    pub right: Option<OptionRight>,
    /// Base symbol this contract derives from (e.g., "NIFTY").
    pub base_symbol: String,
}

/// Capabilities the decision core requires of a broker.
///
/// All calls are awaited sequentially by the single-threaded tick loop;
/// timeouts are the transport's responsibility.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Last-price quote for one token.
    async fn quote(&self, exchange: &str, token: &str) -> Result<QuoteData>;

    /// Submit one order.
    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck>;

    /// All live positions on the account.
    async fn positions(&self) -> Result<Vec<BrokerPosition>>;

    /// SPAN + exposure margin for a basket of legs.
    async fn span_margin(&self, account_id: &str, legs: &[MarginLeg])
        -> Result<SpanMarginResponse>;

    /// Contract-master search by free text.
    async fn search_contracts(&self, exchange: &str, text: &str) -> Result<Vec<ContractRecord>>;

    /// Historical candles as raw vendor rows.
    async fn time_series(
        &self,
        exchange: &str,
        token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_minutes: u32,
    ) -> Result<Vec<serde_json::Value>>;
}
