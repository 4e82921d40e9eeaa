//! Market data and order placement collaborators.
//!
//! Real exchange connectivity stays behind the `MarketData`/`OrderGateway`
//! seams; this module ships a Binance kline reader, a paper-fill gateway,
//! and a scripted feed for development and tests.

use async_trait::async_trait;
use quantos_tools::{Kline, MarketData, OrderGateway, OrderReceipt, OrderType, Side, ToolError};
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

const BINANCE_BASE_URL: &str = "https://api.binance.com";

/// Public Binance REST klines, no key required.
pub struct BinanceMarketData {
    http: reqwest::Client,
    base_url: String,
}

impl BinanceMarketData {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for BinanceMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketData for BinanceMarketData {
    async fn get_klines(
        &self,
        _exchange: &str,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> quantos_tools::Result<Vec<Kline>> {
        let pair = symbol.replace(['/', '-'], "").to_ascii_uppercase();
        let url = format!(
            "{}/api/v3/klines?symbol={pair}&interval={timeframe}&limit={limit}",
            self.base_url.trim_end_matches('/')
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ToolError::Io(format!("klines request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ToolError::Io(format!(
                "klines request returned {}",
                response.status()
            )));
        }
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| ToolError::Io(format!("klines payload malformed: {e}")))?;

        rows.iter().map(|row| parse_kline_row(row)).collect()
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> quantos_tools::Result<Kline> {
    if row.len() < 6 {
        return Err(ToolError::Io(format!(
            "kline row has {} fields, expected at least 6",
            row.len()
        )));
    }
    let number = |idx: usize| -> quantos_tools::Result<f64> {
        let value = &row[idx];
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| ToolError::Io(format!("kline field {idx} is not numeric: {value}")))
    };
    Ok(Kline {
        open_time: row[0].as_i64().unwrap_or_default(),
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
    })
}

/// Simulated order gateway: fills immediately at the supplied price.
#[derive(Default)]
pub struct PaperOrderGateway;

impl PaperOrderGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OrderGateway for PaperOrderGateway {
    async fn place_order(
        &self,
        _exchange: &str,
        symbol: &str,
        side: Side,
        _order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> quantos_tools::Result<OrderReceipt> {
        let price = price.ok_or_else(|| {
            ToolError::InvalidArguments("paper gateway needs a reference price".to_string())
        })?;
        let receipt = OrderReceipt {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
        };
        tracing::info!(
            order_id = %receipt.order_id,
            symbol = %receipt.symbol,
            side = side.as_str(),
            price,
            quantity,
            "paper order filled"
        );
        Ok(receipt)
    }
}

/// Scripted feed for development and tests: each `get_klines` call pops the
/// next kline series; the last series repeats once the script runs dry.
pub struct ScriptedMarketData {
    series: Mutex<VecDeque<Vec<Kline>>>,
    last: Mutex<Option<Vec<Kline>>>,
}

impl ScriptedMarketData {
    pub fn new(series: Vec<Vec<Kline>>) -> Self {
        Self {
            series: Mutex::new(series.into()),
            last: Mutex::new(None),
        }
    }

    /// Build a flat kline series from a close-price ramp.
    pub fn closes_to_klines(closes: &[f64]) -> Vec<Kline> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Kline {
                open_time: i as i64 * 60_000,
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1.0,
            })
            .collect()
    }
}

#[async_trait]
impl MarketData for ScriptedMarketData {
    async fn get_klines(
        &self,
        _exchange: &str,
        _symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> quantos_tools::Result<Vec<Kline>> {
        let next = {
            let mut series = self
                .series
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            series.pop_front()
        };
        let klines = match next {
            Some(klines) => {
                *self
                    .last
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(klines.clone());
                klines
            }
            None => self
                .last
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
                .ok_or_else(|| ToolError::Io("scripted market feed is empty".to_string()))?,
        };
        let start = klines.len().saturating_sub(limit);
        Ok(klines[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_row_parses_binance_string_numbers() {
        let row = vec![
            serde_json::json!(1700000000000_i64),
            serde_json::json!("42000.1"),
            serde_json::json!("42500.0"),
            serde_json::json!("41900.5"),
            serde_json::json!("42250.7"),
            serde_json::json!("123.45"),
        ];
        let kline = parse_kline_row(&row).unwrap();
        assert_eq!(kline.close, 42250.7);
        assert_eq!(kline.open_time, 1700000000000);
    }

    #[test]
    fn kline_row_rejects_short_rows() {
        let row = vec![serde_json::json!(1), serde_json::json!("2")];
        assert!(parse_kline_row(&row).is_err());
    }

    #[tokio::test]
    async fn paper_gateway_fills_at_reference_price() {
        let gateway = PaperOrderGateway::new();
        let receipt = gateway
            .place_order("Binance", "BTC/USDT", Side::Buy, OrderType::Market, 0.5, Some(42000.0))
            .await
            .unwrap();
        assert_eq!(receipt.price, 42000.0);
        assert_eq!(receipt.quantity, 0.5);
    }

    #[tokio::test]
    async fn scripted_feed_pops_then_repeats_last() {
        let feed = ScriptedMarketData::new(vec![
            ScriptedMarketData::closes_to_klines(&[1.0, 2.0]),
            ScriptedMarketData::closes_to_klines(&[3.0, 4.0]),
        ]);
        let first = feed.get_klines("b", "s", "1m", 10).await.unwrap();
        assert_eq!(first.last().unwrap().close, 2.0);
        let second = feed.get_klines("b", "s", "1m", 10).await.unwrap();
        assert_eq!(second.last().unwrap().close, 4.0);
        let third = feed.get_klines("b", "s", "1m", 10).await.unwrap();
        assert_eq!(third.last().unwrap().close, 4.0);
    }
}
