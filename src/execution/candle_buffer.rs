use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::models::Candle;

/// Rolling window of candles for the traded symbol, built from ticker polls
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    candles: VecDeque<Candle>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            candles: VecDeque::new(),
            max_candles,
        }
    }

    /// Append a price sample as a flat candle, evicting the oldest when full
    pub fn push_price(&mut self, price: f64, timestamp: DateTime<Utc>) {
        self.candles.push_back(Candle::from_price(price, timestamp));
        while self.candles.len() > self.max_candles {
            self.candles.pop_front();
        }
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_only_the_latest_window() {
        let mut buffer = CandleBuffer::new(5);
        for i in 0..10 {
            buffer.push_price(100.0 + i as f64, Utc::now());
        }

        let candles = buffer.candles();
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[4].close, 109.0);
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = CandleBuffer::new(5);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.candles().is_empty());
    }
}
