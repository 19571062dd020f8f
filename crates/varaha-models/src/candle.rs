//! Aligned numeric price series produced by the fact converter.

use serde::{Deserialize, Serialize};

/// Five aligned OHLCV arrays for one instrument.
///
/// The sole input to technical computation. Arrays are always the same
/// length; malformed source rows are dropped before they get here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceSeries {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl PriceSeries {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// Latest close, if any bars exist.
    pub fn last_close(&self) -> Option<f64> {
        self.close.last().copied()
    }

    pub fn push_bar(&mut self, open: f64, high: f64, low: f64, close: f64, volume: f64) {
        self.open.push(open);
        self.high.push(high);
        self.low.push(low);
        self.close.push(close);
        self.volume.push(volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bar_keeps_alignment() {
        let mut s = PriceSeries::default();
        s.push_bar(100.0, 101.0, 99.0, 100.5, 1000.0);
        s.push_bar(100.5, 102.0, 100.0, 101.5, 1200.0);
        assert_eq!(s.len(), 2);
        assert_eq!(s.open.len(), s.volume.len());
        assert_eq!(s.last_close(), Some(101.5));
    }

    #[test]
    fn test_empty_series() {
        let s = PriceSeries::default();
        assert!(s.is_empty());
        assert_eq!(s.last_close(), None);
    }
}
