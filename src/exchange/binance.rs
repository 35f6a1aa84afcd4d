use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use super::{ExchangeApi, ExchangeError};
use crate::models::{
    Candle, MarginMode, OrderAck, OrderReport, OrderSide, OrderStatus, PositionInfo, SymbolInfo,
};

// USD-M futures REST API
// Docs: https://developers.binance.com/docs/derivatives/usds-margined-futures
const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

type HmacSha256 = Hmac<Sha256>;

/// Signed REST client for a Binance-style USD-M futures venue
#[derive(Clone)]
pub struct BinanceFutures {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    asset: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskEntry {
    position_amt: String,
    entry_price: String,
    mark_price: String,
    liquidation_price: String,
    leverage: String,
    un_realized_profit: String,
    #[serde(default)]
    isolated_margin: String,
    #[serde(default)]
    notional: String,
    margin_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderEntry {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatusResponse {
    order_id: i64,
    status: OrderStatus,
    avg_price: String,
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAckResponse {
    order_id: i64,
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoSymbol {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    margin_asset: String,
    price_precision: u32,
    quantity_precision: u32,
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::InvalidResponse(format!("bad {field}: {raw:?}")))
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

impl BinanceFutures {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self::with_base_url(api_key, api_secret, DEFAULT_BASE_URL.to_string())
    }

    /// Point the client at a different host (testnet, mock server).
    pub fn with_base_url(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            api_secret,
        }
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::InvalidResponse(format!("bad api secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));
        let signature = self.sign(&query)?;
        query.push_str(&format!("&signature={signature}"));
        Ok(query)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if let Ok(api_err) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(ExchangeError::from_api_code(api_err.code, api_err.msg));
            }
            return Err(ExchangeError::InvalidResponse(format!(
                "HTTP {status}: {body}"
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidResponse(format!("{e}: {body}")))
    }

    async fn get_public<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self.client.get(&url).send().await?;
        Self::decode(response).await
    }

    async fn get_signed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = self.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post_signed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = self.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    fn side_param(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Long => "BUY",
            OrderSide::Short => "SELL",
        }
    }

    async fn submit_conditional(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        order_type: &str,
    ) -> Result<OrderAck, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", Self::side_param(side).to_string()),
            ("type", order_type.to_string()),
            ("quantity", quantity.to_string()),
            ("stopPrice", stop_price.to_string()),
            ("closePosition", "true".to_string()),
            ("timeInForce", "GTE_GTC".to_string()),
            ("newClientOrderId", Uuid::new_v4().to_string()),
        ];
        let ack: OrderAckResponse = self.post_signed("/fapi/v1/order", &params).await?;
        Ok(OrderAck {
            order_id: ack.order_id,
            client_order_id: ack.client_order_id,
        })
    }
}

#[async_trait::async_trait]
impl ExchangeApi for BinanceFutures {
    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerResponse = self
            .get_public("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;
        parse_f64(&ticker.price, "price")
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        // Kline rows are positional arrays:
        // [openTime, open, high, low, close, volume, closeTime, ...]
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_public(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={timeframe}&limit={limit}"),
            )
            .await?;

        let field = |row: &[serde_json::Value], idx: usize| -> Result<f64, ExchangeError> {
            row.get(idx)
                .and_then(|v| v.as_str())
                .ok_or_else(|| ExchangeError::InvalidResponse(format!("kline field {idx} missing")))
                .and_then(|s| parse_f64(s, "kline"))
        };

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            let open_time = row
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ExchangeError::InvalidResponse("kline open time missing".into()))?;
            let close_time = row
                .get(6)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ExchangeError::InvalidResponse("kline close time missing".into()))?;
            candles.push(Candle {
                open_time: millis_to_utc(open_time),
                close_time: millis_to_utc(close_time),
                open: field(row, 1)?,
                high: field(row, 2)?,
                low: field(row, 3)?,
                close: field(row, 4)?,
                volume: field(row, 5)?,
            });
        }
        Ok(candles)
    }

    async fn account_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let balances: Vec<BalanceEntry> = self.get_signed("/fapi/v2/balance", &[]).await?;
        let entry = balances
            .iter()
            .find(|b| b.asset == asset)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("no balance for {asset}")))?;
        parse_f64(&entry.balance, "balance")
    }

    async fn position_info(&self, symbol: &str) -> Result<Option<PositionInfo>, ExchangeError> {
        let entries: Vec<PositionRiskEntry> = self
            .get_signed("/fapi/v2/positionRisk", &[("symbol", symbol.to_string())])
            .await?;
        let entry = match entries.first() {
            Some(e) => e,
            None => return Ok(None),
        };
        let entry_price = parse_f64(&entry.entry_price, "entryPrice")?;
        // a zero entry price means the exchange holds nothing for this symbol
        if entry_price <= 0.0 {
            return Ok(None);
        }
        Ok(Some(PositionInfo {
            amount: parse_f64(&entry.position_amt, "positionAmt")?,
            entry_price,
            mark_price: parse_f64(&entry.mark_price, "markPrice")?,
            liquidation_price: parse_f64(&entry.liquidation_price, "liquidationPrice")?,
            leverage: parse_f64(&entry.leverage, "leverage")?,
            unrealized_profit: parse_f64(&entry.un_realized_profit, "unRealizedProfit")?,
            isolated_margin: entry.isolated_margin.parse().unwrap_or(0.0),
            notional: entry.notional.parse().unwrap_or(0.0),
            margin_type: entry.margin_type.clone(),
        }))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<i64>, ExchangeError> {
        let orders: Vec<OpenOrderEntry> = self
            .get_signed("/fapi/v1/openOrders", &[("symbol", symbol.to_string())])
            .await?;
        Ok(orders.iter().map(|o| o.order_id).collect())
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderReport, ExchangeError> {
        let report: OrderStatusResponse = self
            .get_signed(
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(OrderReport {
            order_id: report.order_id,
            status: report.status,
            avg_price: parse_f64(&report.avg_price, "avgPrice")?,
            update_time: millis_to_utc(report.update_time),
        })
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", Self::side_param(side).to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newClientOrderId", Uuid::new_v4().to_string()),
        ];
        let ack: OrderAckResponse = self.post_signed("/fapi/v1/order", &params).await?;
        Ok(OrderAck {
            order_id: ack.order_id,
            client_order_id: ack.client_order_id,
        })
    }

    async fn submit_take_profit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.submit_conditional(symbol, side, quantity, stop_price, "TAKE_PROFIT_MARKET")
            .await
    }

    async fn submit_stop_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.submit_conditional(symbol, side, quantity, stop_price, "STOP_MARKET")
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .post_signed(
                "/fapi/v1/leverage",
                &[
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .post_signed(
                "/fapi/v1/marginType",
                &[
                    ("symbol", symbol.to_string()),
                    ("marginType", mode.as_str().to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        let info: ExchangeInfoResponse = self.get_public("/fapi/v1/exchangeInfo", "").await?;
        let entry = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::InvalidResponse(format!("unknown symbol {symbol}")))?;
        Ok(SymbolInfo {
            symbol: entry.symbol,
            base_asset: entry.base_asset,
            quote_asset: entry.quote_asset,
            margin_asset: entry.margin_asset,
            price_precision: entry.price_precision,
            quantity_precision: entry.quantity_precision,
        })
    }
}
