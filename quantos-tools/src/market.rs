use crate::error::{Result, ToolError};
use crate::indicators;
use crate::traits::{optional_f64, optional_u64, require_string, Tool, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const KLINES_LIMIT_MAX: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(ToolError::InvalidArguments(format!(
                "side must be buy or sell, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => Err(ToolError::InvalidArguments(format!(
                "order_type must be market or limit, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// Market data collaborator. Real exchanges and synthetic feeds plug in
/// behind this seam.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_klines(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>>;
}

/// Order placement collaborator; simulated in this repository.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        exchange: &str,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<OrderReceipt>;
}

pub struct GetKlinesTool {
    market: Arc<dyn MarketData>,
}

impl GetKlinesTool {
    pub fn new(market: Arc<dyn MarketData>) -> Self {
        Self { market }
    }

    async fn fetch(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let exchange = require_string(args, "exchange")?;
        let symbol = require_string(args, "symbol")?;
        let timeframe = require_string(args, "timeframe")?;
        let limit = optional_u64(args, "limit")?
            .unwrap_or(100)
            .clamp(1, KLINES_LIMIT_MAX) as usize;

        let klines = self
            .market
            .get_klines(&exchange, &symbol, &timeframe, limit)
            .await?;
        let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
        let last_close = closes.last().copied();

        Ok(ToolResult::ok_with_data(
            format!(
                "{symbol} {timeframe}: {} klines, last close {}",
                klines.len(),
                last_close.map_or("n/a".to_string(), |c| c.to_string())
            ),
            serde_json::json!({
                "symbol": symbol,
                "timeframe": timeframe,
                "klines": klines,
                "closes": closes,
                "last_close": last_close,
            }),
        ))
    }
}

#[async_trait]
impl Tool for GetKlinesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_klines".to_string(),
            description: "Fetch recent candlesticks for a symbol.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "exchange": { "type": "string" },
                    "symbol": { "type": "string" },
                    "timeframe": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["exchange", "symbol", "timeframe"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.fetch(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

/// Compute an indicator over an explicit close-price series.
pub struct CalculateIndicatorTool;

impl CalculateIndicatorTool {
    fn series(args: &serde_json::Value) -> Result<Vec<f64>> {
        let raw = args
            .get("series")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ToolError::InvalidArguments("series must be an array of numbers".to_string())
            })?;
        raw.iter()
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    ToolError::InvalidArguments("series entries must be numbers".to_string())
                })
            })
            .collect()
    }

    fn compute(args: &serde_json::Value) -> Result<ToolResult> {
        let kind = require_string(args, "kind")?.to_ascii_lowercase();
        let series = Self::series(args)?;
        let params = args.get("params").cloned().unwrap_or(serde_json::json!({}));
        let period = params
            .get("period")
            .and_then(|v| v.as_u64())
            .unwrap_or(14) as usize;

        let data = match kind.as_str() {
            "rsi" => {
                let value = indicators::rsi(&series, period).ok_or_else(|| {
                    ToolError::InvalidArguments(format!(
                        "rsi needs at least {} closes, got {}",
                        period + 1,
                        series.len()
                    ))
                })?;
                serde_json::json!({ "kind": "rsi", "period": period, "value": value })
            }
            "sma" => {
                let value = indicators::sma(&series, period).ok_or_else(|| {
                    ToolError::InvalidArguments(format!(
                        "sma needs at least {period} closes, got {}",
                        series.len()
                    ))
                })?;
                serde_json::json!({ "kind": "sma", "period": period, "value": value })
            }
            "ema" => {
                let value = indicators::ema(&series, period).ok_or_else(|| {
                    ToolError::InvalidArguments(format!(
                        "ema needs at least {period} closes, got {}",
                        series.len()
                    ))
                })?;
                serde_json::json!({ "kind": "ema", "period": period, "value": value })
            }
            "macd" => {
                let fast = params.get("fast").and_then(|v| v.as_u64()).unwrap_or(12) as usize;
                let slow = params.get("slow").and_then(|v| v.as_u64()).unwrap_or(26) as usize;
                let signal = params.get("signal").and_then(|v| v.as_u64()).unwrap_or(9) as usize;
                let out = indicators::macd(&series, fast, slow, signal).ok_or_else(|| {
                    ToolError::InvalidArguments(format!(
                        "macd({fast},{slow},{signal}) needs at least {} closes, got {}",
                        slow + signal,
                        series.len()
                    ))
                })?;
                serde_json::json!({
                    "kind": "macd",
                    "macd_line": out.macd_line,
                    "signal_line": out.signal_line,
                    "histogram": out.histogram,
                })
            }
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "unknown indicator kind: {other}"
                )));
            }
        };

        Ok(ToolResult::ok_with_data(data.to_string(), data))
    }
}

#[async_trait]
impl Tool for CalculateIndicatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calculate_indicator".to_string(),
            description: "Compute rsi, sma, ema or macd over a close-price series.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "kind": { "type": "string" },
                    "series": { "type": "array" },
                    "params": { "type": "object" }
                },
                "required": ["kind", "series"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match Self::compute(&arguments) {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

pub struct PlaceOrderTool {
    gateway: Arc<dyn OrderGateway>,
}

impl PlaceOrderTool {
    pub fn new(gateway: Arc<dyn OrderGateway>) -> Self {
        Self { gateway }
    }

    async fn place(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let exchange = require_string(args, "exchange")?;
        let symbol = require_string(args, "symbol")?;
        let side = Side::parse(&require_string(args, "side")?)?;
        let order_type = OrderType::parse(&require_string(args, "order_type")?)?;
        let quantity = optional_f64(args, "quantity")?.ok_or_else(|| {
            ToolError::InvalidArguments("quantity is required".to_string())
        })?;
        if quantity <= 0.0 {
            return Err(ToolError::InvalidArguments(
                "quantity must be positive".to_string(),
            ));
        }
        let price = optional_f64(args, "price")?;
        if order_type == OrderType::Limit && price.is_none() {
            return Err(ToolError::InvalidArguments(
                "limit orders require a price".to_string(),
            ));
        }

        let receipt = self
            .gateway
            .place_order(&exchange, &symbol, side, order_type, quantity, price)
            .await?;

        tracing::info!(
            order_id = %receipt.order_id,
            symbol = %receipt.symbol,
            side = receipt.side.as_str(),
            price = receipt.price,
            quantity = receipt.quantity,
            "order placed"
        );
        Ok(ToolResult::ok_with_data(
            format!(
                "{} {} {} @ {} (order {})",
                receipt.side.as_str(),
                receipt.quantity,
                receipt.symbol,
                receipt.price,
                receipt.order_id
            ),
            serde_json::json!({ "order": receipt }),
        ))
    }
}

#[async_trait]
impl Tool for PlaceOrderTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "place_order".to_string(),
            description: "Place a simulated order on the configured gateway.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "exchange": { "type": "string" },
                    "symbol": { "type": "string" },
                    "side": { "type": "string" },
                    "order_type": { "type": "string" },
                    "quantity": { "type": "number" },
                    "price": { "type": "number" }
                },
                "required": ["exchange", "symbol", "side", "order_type", "quantity"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.place(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMarket;

    #[async_trait]
    impl MarketData for FlatMarket {
        async fn get_klines(
            &self,
            _exchange: &str,
            _symbol: &str,
            _timeframe: &str,
            limit: usize,
        ) -> Result<Vec<Kline>> {
            Ok((0..limit)
                .map(|i| Kline {
                    open_time: i as i64,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0,
                    volume: 1.0,
                })
                .collect())
        }
    }

    struct EchoGateway;

    #[async_trait]
    impl OrderGateway for EchoGateway {
        async fn place_order(
            &self,
            _exchange: &str,
            symbol: &str,
            side: Side,
            _order_type: OrderType,
            quantity: f64,
            price: Option<f64>,
        ) -> Result<OrderReceipt> {
            Ok(OrderReceipt {
                order_id: "ord-1".to_string(),
                symbol: symbol.to_string(),
                side,
                price: price.unwrap_or(100.0),
                quantity,
            })
        }
    }

    #[tokio::test]
    async fn get_klines_returns_closes() {
        let tool = GetKlinesTool::new(Arc::new(FlatMarket));
        let out = tool
            .execute(serde_json::json!({
                "exchange": "binance",
                "symbol": "BTC/USDT",
                "timeframe": "1d",
                "limit": 5
            }))
            .await;
        assert!(out.success);
        let data = out.data.unwrap();
        assert_eq!(data["closes"].as_array().unwrap().len(), 5);
        assert_eq!(data["last_close"], 100.0);
    }

    #[tokio::test]
    async fn indicator_tool_computes_rsi() {
        let series: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let tool = CalculateIndicatorTool;
        let out = tool
            .execute(serde_json::json!({ "kind": "rsi", "series": series }))
            .await;
        assert!(out.success);
        let value = out.data.unwrap()["value"].as_f64().unwrap();
        assert!(value < 5.0);
    }

    #[tokio::test]
    async fn indicator_tool_rejects_short_series() {
        let tool = CalculateIndicatorTool;
        let out = tool
            .execute(serde_json::json!({ "kind": "rsi", "series": [1.0, 2.0] }))
            .await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("at least"));
    }

    #[tokio::test]
    async fn place_order_requires_price_for_limit() {
        let tool = PlaceOrderTool::new(Arc::new(EchoGateway));
        let out = tool
            .execute(serde_json::json!({
                "exchange": "binance",
                "symbol": "BTC/USDT",
                "side": "buy",
                "order_type": "limit",
                "quantity": 1.0
            }))
            .await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("price"));
    }

    #[tokio::test]
    async fn place_order_round_trips_receipt() {
        let tool = PlaceOrderTool::new(Arc::new(EchoGateway));
        let out = tool
            .execute(serde_json::json!({
                "exchange": "binance",
                "symbol": "BTC/USDT",
                "side": "sell",
                "order_type": "market",
                "quantity": 0.5
            }))
            .await;
        assert!(out.success);
        assert_eq!(out.data.unwrap()["order"]["order_id"], "ord-1");
    }
}
