//! Fact converter: raw broker candle rows to aligned numeric series.
//!
//! Broker candle payloads vary by vendor, so rows arrive as
//! `serde_json::Value` and a field map names the keys. Rows whose status
//! field does not indicate success, or with any unparsable price field,
//! are dropped. No usable rows is a degraded outcome, not an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use varaha_models::PriceSeries;

/// Names of the candle fields in the vendor payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandleFieldMap {
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub status: String,
    /// Status value meaning "usable record".
    pub ok_value: String,
}

impl Default for CandleFieldMap {
    fn default() -> Self {
        Self {
            open: "open".to_string(),
            high: "high".to_string(),
            low: "low".to_string(),
            close: "close".to_string(),
            volume: "volume".to_string(),
            status: "status".to_string(),
            ok_value: "success".to_string(),
        }
    }
}

/// Numeric field that may arrive as a JSON number or a numeric string.
fn field_f64(row: &Value, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Whether the row's status marks it usable. Boolean `true` also counts.
fn status_ok(row: &Value, map: &CandleFieldMap) -> bool {
    match row.get(&map.status) {
        Some(Value::String(s)) => s == &map.ok_value,
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

/// Convert raw candle rows into five aligned numeric arrays.
pub fn convert_candles(rows: &[Value], map: &CandleFieldMap) -> PriceSeries {
    let mut series = PriceSeries::with_capacity(rows.len());
    for row in rows {
        if !status_ok(row, map) {
            continue;
        }
        let parsed = (
            field_f64(row, &map.open),
            field_f64(row, &map.high),
            field_f64(row, &map.low),
            field_f64(row, &map.close),
            field_f64(row, &map.volume),
        );
        if let (Some(o), Some(h), Some(l), Some(c), Some(v)) = parsed {
            series.push_bar(o, h, l, c, v);
        }
    }
    series
}
