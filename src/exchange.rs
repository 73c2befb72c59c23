//! Exchange API client and wire types
//!
//! The trading loop consumes a small, futures-style REST surface: tickers,
//! mark price, exchange metadata, open orders, order placement/cancellation
//! and position risk. Order-type strings and position modes are normalized
//! into enums once, at this boundary.

use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::quantize::PositionDir;

/// Errors surfaced by exchange operations. The guard matches on
/// [`ExchangeError::would_trigger_immediately`] to drive its retry path.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("exchange rejected request (code {code}): {msg}")]
    Api { code: i64, msg: String },
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// True when the exchange rejected a trigger price for being on the
    /// active side of the market (it would fire the moment it was booked).
    pub fn would_trigger_immediately(&self) -> bool {
        match self {
            ExchangeError::Api { code, msg } => {
                *code == -2021 || msg.to_lowercase().contains("would immediately trigger")
            }
            _ => false,
        }
    }
}

/// Normalized order type. Decoded once from the wire string; raw exchange
/// spellings vary in case and separator (`STOP_MARKET`, `stop-market`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
    Other(String),
}

impl OrderKind {
    /// Parse a wire order-type string, tolerant of formatting variants.
    pub fn parse(raw: &str) -> Self {
        let norm: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match norm.as_str() {
            "MARKET" => OrderKind::Market,
            "LIMIT" => OrderKind::Limit,
            "STOP" | "STOPMARKET" | "STOPLOSS" => OrderKind::StopMarket,
            "TAKEPROFIT" | "TAKEPROFITMARKET" => OrderKind::TakeProfitMarket,
            _ => OrderKind::Other(raw.to_string()),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, OrderKind::StopMarket)
    }

    pub fn is_take_profit(&self) -> bool {
        matches!(self, OrderKind::TakeProfitMarket)
    }

    /// Canonical wire spelling for order placement.
    pub fn wire_name(&self) -> &str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::StopMarket => "STOP_MARKET",
            OrderKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderKind::Other(raw) => raw,
        }
    }
}

/// Order side on the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn wire_name(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Side that closes a position in the given direction.
    pub fn closing(dir: PositionDir) -> Self {
        match dir {
            PositionDir::Long => OrderSide::Sell,
            PositionDir::Short => OrderSide::Buy,
        }
    }

    /// Side that opens a position in the given direction.
    pub fn opening(dir: PositionDir) -> Self {
        match dir {
            PositionDir::Long => OrderSide::Buy,
            PositionDir::Short => OrderSide::Sell,
        }
    }
}

/// Account position mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

/// Protective-order position tag for the account's mode. `None` when the
/// mode is unknown - the tag is then omitted from the request.
pub fn position_side_tag(mode: Option<PositionMode>, dir: PositionDir) -> Option<&'static str> {
    match mode? {
        PositionMode::OneWay => Some("BOTH"),
        PositionMode::Hedge => Some(match dir {
            PositionDir::Long => "LONG",
            PositionDir::Short => "SHORT",
        }),
    }
}

/// Price basis for trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingType {
    MarkPrice,
    ContractPrice,
}

impl WorkingType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            WorkingType::MarkPrice => "MARK_PRICE",
            WorkingType::ContractPrice => "CONTRACT_PRICE",
        }
    }
}

/// Best bid/ask for a market.
#[derive(Debug, Clone, Copy)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

impl BookTicker {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// An open order as reported by the exchange.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: u64,
    pub kind: OrderKind,
    pub stop_price: f64,
    pub close_position: bool,
}

/// One entry from the position-risk query.
#[derive(Debug, Clone)]
pub struct PositionRisk {
    pub symbol: String,
    /// Signed quantity; zero means flat.
    pub position_amt: f64,
    pub position_side: String,
}

/// Order placement request.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Explicit quantity; mutually exclusive with `close_position`.
    pub quantity: Option<f64>,
    /// Close the entire position when the trigger fires.
    pub close_position: bool,
    pub stop_price: Option<f64>,
    pub working_type: Option<WorkingType>,
    pub position_side: Option<String>,
    pub client_order_id: Option<String>,
}

impl NewOrder {
    /// Market entry order for the given direction and quantity.
    pub fn market_entry(symbol: &str, dir: PositionDir, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::opening(dir),
            kind: OrderKind::Market,
            quantity: Some(quantity),
            close_position: false,
            stop_price: None,
            working_type: None,
            position_side: None,
            client_order_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// The exchange operations the guard and runner consume.
pub trait Exchange {
    fn book_ticker(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<BookTicker, ExchangeError>> + Send;

    fn mark_price(&self, symbol: &str)
        -> impl Future<Output = Result<f64, ExchangeError>> + Send;

    /// Minimum price increment for a market.
    fn tick_size(&self, symbol: &str)
        -> impl Future<Output = Result<f64, ExchangeError>> + Send;

    fn open_orders(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Vec<OpenOrder>, ExchangeError>> + Send;

    fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> impl Future<Output = Result<(), ExchangeError>> + Send;

    fn place_order(
        &self,
        order: &NewOrder,
    ) -> impl Future<Output = Result<(), ExchangeError>> + Send;

    fn position_risk(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Vec<PositionRisk>, ExchangeError>> + Send;

    fn position_mode(&self) -> impl Future<Output = Result<PositionMode, ExchangeError>> + Send;
}

/// HTTP implementation against a futures-style REST API.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    recv_window_ms: u64,
}

impl HttpExchange {
    pub fn new(base_url: &str, api_key: Option<String>, recv_window_ms: u64) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            recv_window_ms,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, &url);
        if let Some(key) = &self.api_key {
            req = req.header("X-MBX-APIKEY", key);
        }
        req
    }

    /// Decode a response, mapping non-success statuses into typed API errors.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let text = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ApiErrorBody>(&text) {
                Ok(body) => Err(ExchangeError::Api {
                    code: body.code,
                    msg: body.msg,
                }),
                Err(_) => Err(ExchangeError::Api {
                    code: status.as_u16() as i64,
                    msg: text,
                }),
            }
        }
    }
}

impl Exchange for HttpExchange {
    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, ExchangeError> {
        let response = self
            .request(reqwest::Method::GET, "/fapi/v1/ticker/bookTicker")
            .query(&[("symbol", symbol)])
            .send()
            .await?;
        let body: BookTickerBody = Self::decode(response).await?;
        Ok(BookTicker {
            bid: parse_num(&body.bid_price, "bidPrice")?,
            ask: parse_num(&body.ask_price, "askPrice")?,
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let response = self
            .request(reqwest::Method::GET, "/fapi/v1/premiumIndex")
            .query(&[("symbol", symbol)])
            .send()
            .await?;
        let body: PremiumIndexBody = Self::decode(response).await?;
        parse_num(&body.mark_price, "markPrice")
    }

    async fn tick_size(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let response = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo")
            .query(&[("symbol", symbol)])
            .send()
            .await?;
        let body: ExchangeInfoBody = Self::decode(response).await?;

        for market in &body.symbols {
            if market.symbol != symbol {
                continue;
            }
            for filter in &market.filters {
                if filter.filter_type == "PRICE_FILTER" {
                    if let Some(tick) = &filter.tick_size {
                        return parse_num(tick, "tickSize");
                    }
                }
            }
        }
        Err(ExchangeError::Parse(format!(
            "no PRICE_FILTER for symbol {}",
            symbol
        )))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let response = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders")
            .query(&[
                ("symbol", symbol.to_string()),
                ("recvWindow", self.recv_window_ms.to_string()),
            ])
            .send()
            .await?;
        let body: Vec<OpenOrderBody> = Self::decode(response).await?;

        body.into_iter()
            .map(|o| {
                Ok(OpenOrder {
                    order_id: o.order_id,
                    kind: OrderKind::parse(&o.order_type),
                    stop_price: parse_num(&o.stop_price, "stopPrice")?,
                    close_position: o.close_position,
                })
            })
            .collect()
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let response = self
            .request(reqwest::Method::DELETE, "/fapi/v1/order")
            .query(&[
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
                ("recvWindow", self.recv_window_ms.to_string()),
            ])
            .send()
            .await?;
        let _: serde_json::Value = Self::decode(response).await?;
        debug!("Cancelled order {} on {}", order_id, symbol);
        Ok(())
    }

    async fn place_order(&self, order: &NewOrder) -> Result<(), ExchangeError> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.wire_name().to_string()),
            ("type", order.kind.wire_name().to_string()),
            ("recvWindow", self.recv_window_ms.to_string()),
        ];
        if let Some(qty) = order.quantity {
            params.push(("quantity", format!("{}", qty)));
        }
        if order.close_position {
            params.push(("closePosition", "true".to_string()));
        }
        if let Some(stop) = order.stop_price {
            params.push(("stopPrice", format!("{}", stop)));
        }
        if let Some(wt) = order.working_type {
            params.push(("workingType", wt.wire_name().to_string()));
        }
        if let Some(ps) = &order.position_side {
            params.push(("positionSide", ps.clone()));
        }
        if let Some(id) = &order.client_order_id {
            params.push(("newClientOrderId", id.clone()));
        }

        let response = self
            .request(reqwest::Method::POST, "/fapi/v1/order")
            .query(&params)
            .send()
            .await?;
        let _: serde_json::Value = Self::decode(response).await?;
        debug!(
            "Placed {} {} on {} (stop_price={:?})",
            order.side.wire_name(),
            order.kind.wire_name(),
            order.symbol,
            order.stop_price
        );
        Ok(())
    }

    async fn position_risk(&self, symbol: &str) -> Result<Vec<PositionRisk>, ExchangeError> {
        let response = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk")
            .query(&[
                ("symbol", symbol.to_string()),
                ("recvWindow", self.recv_window_ms.to_string()),
            ])
            .send()
            .await?;
        let body: Vec<PositionRiskBody> = Self::decode(response).await?;

        body.into_iter()
            .map(|p| {
                Ok(PositionRisk {
                    position_amt: parse_num(&p.position_amt, "positionAmt")?,
                    symbol: p.symbol,
                    position_side: p.position_side,
                })
            })
            .collect()
    }

    async fn position_mode(&self) -> Result<PositionMode, ExchangeError> {
        let response = self
            .request(reqwest::Method::GET, "/fapi/v1/positionSide/dual")
            .send()
            .await?;
        let body: PositionModeBody = Self::decode(response).await?;
        Ok(if body.dual_side_position {
            PositionMode::Hedge
        } else {
            PositionMode::OneWay
        })
    }
}

fn parse_num(raw: &str, field: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("bad {}: {:?}", field, raw)))
}

// Wire bodies (numeric fields arrive as strings)

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct BookTickerBody {
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
}

#[derive(Debug, Deserialize)]
struct PremiumIndexBody {
    #[serde(rename = "markPrice")]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoBody {
    symbols: Vec<MarketInfoBody>,
}

#[derive(Debug, Deserialize)]
struct MarketInfoBody {
    symbol: String,
    filters: Vec<FilterBody>,
}

#[derive(Debug, Deserialize)]
struct FilterBody {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenOrderBody {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "stopPrice", default = "zero_string")]
    stop_price: String,
    #[serde(rename = "closePosition", default)]
    close_position: bool,
}

fn zero_string() -> String {
    "0".to_string()
}

#[derive(Debug, Deserialize)]
struct PositionRiskBody {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "positionSide")]
    position_side: String,
}

#[derive(Debug, Deserialize)]
struct PositionModeBody {
    #[serde(rename = "dualSidePosition")]
    dual_side_position: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_kind_normalization() {
        assert_eq!(OrderKind::parse("STOP_MARKET"), OrderKind::StopMarket);
        assert_eq!(OrderKind::parse("stop-market"), OrderKind::StopMarket);
        assert_eq!(OrderKind::parse("Stop Market"), OrderKind::StopMarket);
        assert_eq!(
            OrderKind::parse("TAKE_PROFIT_MARKET"),
            OrderKind::TakeProfitMarket
        );
        assert_eq!(
            OrderKind::parse("take-profit"),
            OrderKind::TakeProfitMarket
        );
        assert_eq!(OrderKind::parse("MARKET"), OrderKind::Market);
        assert_eq!(
            OrderKind::parse("TRAILING_STOP_MARKET"),
            OrderKind::Other("TRAILING_STOP_MARKET".to_string())
        );
    }

    #[test]
    fn test_would_trigger_immediately() {
        let by_code = ExchangeError::Api {
            code: -2021,
            msg: "rejected".to_string(),
        };
        assert!(by_code.would_trigger_immediately());

        let by_msg = ExchangeError::Api {
            code: -4000,
            msg: "Order would immediately trigger.".to_string(),
        };
        assert!(by_msg.would_trigger_immediately());

        let other = ExchangeError::Api {
            code: -1021,
            msg: "timestamp outside recvWindow".to_string(),
        };
        assert!(!other.would_trigger_immediately());
    }

    #[test]
    fn test_position_side_tag() {
        assert_eq!(
            position_side_tag(Some(PositionMode::OneWay), PositionDir::Long),
            Some("BOTH")
        );
        assert_eq!(
            position_side_tag(Some(PositionMode::Hedge), PositionDir::Long),
            Some("LONG")
        );
        assert_eq!(
            position_side_tag(Some(PositionMode::Hedge), PositionDir::Short),
            Some("SHORT")
        );
        assert_eq!(position_side_tag(None, PositionDir::Long), None);
    }
}
