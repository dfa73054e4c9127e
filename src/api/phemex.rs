//! Signed REST client for Phemex perpetual futures.
//!
//! The exchange transports prices as integers scaled by 10^4 ("Ep"),
//! USD values by 10^8 ("Ev") and ratios by 10^8 ("Er"). Conversion happens
//! here, at the boundary; nothing above this module ever sees a scaled
//! integer.

use chrono::Utc;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use crate::api::auth::{
    sign_request, sorted_query, HEADER_ACCESS_TOKEN, HEADER_REQUEST_EXPIRY,
    HEADER_REQUEST_SIGNATURE, REQUEST_EXPIRY_WINDOW_SECS,
};
use crate::api::rate_limit::TokenBucket;
use crate::api::ExchangeClient;
use crate::error::{BotError, Result, ValidationKind};
use crate::models::{Account, Candle, InstrumentMeta, OrderSide, PosSide, Position, Ticker};
use crate::models::OpenPosition;

const MAINNET_BASE_URL: &str = "https://api.phemex.com";
const TESTNET_BASE_URL: &str = "https://testnet-api.phemex.com";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const REQUESTS_PER_SECOND: u32 = 10;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_JITTER: f64 = 0.25;

/// Price scale ("Ep" fields).
const PRICE_SCALE: f64 = 10_000.0;
/// USD value scale ("Ev" fields).
const VALUE_SCALE: f64 = 100_000_000.0;
/// Ratio scale ("Er" fields).
const RATIO_SCALE: f64 = 100_000_000.0;

fn price_from_ep(ep: i64) -> f64 {
    ep as f64 / PRICE_SCALE
}

fn price_to_ep(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

fn value_from_ev(ev: i64) -> f64 {
    ev as f64 / VALUE_SCALE
}

fn ratio_to_er(ratio: f64) -> i64 {
    (ratio * RATIO_SCALE).round() as i64
}

/// Every response is wrapped in `{code, msg, data}`; a non-zero code is a
/// business-level rejection.
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccountPositions {
    account: RawAccount,
    #[serde(default)]
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccount {
    account_balance_ev: i64,
    total_used_balance_ev: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    /// "Buy" for long, "Sell" for short, "None" when flat.
    side: String,
    #[serde(default)]
    size: f64,
    #[serde(default)]
    avg_entry_price_ep: i64,
    #[serde(default)]
    leverage_er: i64,
    #[serde(default)]
    unrealised_pnl_ev: i64,
    #[serde(default)]
    position_margin_ev: i64,
    #[serde(default)]
    maint_margin_req_ev: i64,
    #[serde(default)]
    liquidation_price_ep: i64,
}

impl RawPosition {
    fn pos_side(&self) -> Option<PosSide> {
        match self.side.as_str() {
            "Buy" => Some(PosSide::Long),
            "Sell" => Some(PosSide::Short),
            _ => None,
        }
    }

    fn into_open_position(self) -> Option<OpenPosition> {
        let side = self.pos_side()?;
        if self.size <= 0.0 {
            return None;
        }
        Some(OpenPosition {
            side,
            size_contracts: self.size,
            entry_price: price_from_ep(self.avg_entry_price_ep),
            leverage: self.leverage_er as f64 / RATIO_SCALE,
            unrealized_pnl: value_from_ev(self.unrealised_pnl_ev),
            position_margin_usd: value_from_ev(self.position_margin_ev),
            maintenance_margin_usd: value_from_ev(self.maint_margin_req_ev),
            liquidation_price: (self.liquidation_price_ep > 0)
                .then(|| price_from_ep(self.liquidation_price_ep)),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    bid_ep: i64,
    ask_ep: i64,
    last_ep: i64,
}

#[derive(Debug, Deserialize)]
struct RawKlines {
    #[serde(default)]
    rows: Vec<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProducts {
    #[serde(default)]
    products: Vec<RawProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProduct {
    symbol: String,
    min_order_qty: f64,
    max_order_qty: f64,
    qty_step_size: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    #[serde(rename = "orderID")]
    order_id: String,
}

/// Business codes the strategy cares about; anything else unknown is a
/// generic rejection.
fn map_exchange_error(code: i64, msg: &str) -> BotError {
    let kind = match code {
        10002 | 30000 => ValidationKind::UnknownSymbol,
        11010 | 11082 => ValidationKind::InvalidQty,
        11011 => ValidationKind::InvalidPrice,
        11012 | 11064 => ValidationKind::PriceOutOfBand,
        11043 => ValidationKind::InvalidLeverage,
        10500 | 10501 => return BotError::Auth(format!("code {code}: {msg}")),
        _ => ValidationKind::Rejected,
    };
    BotError::Validation {
        kind,
        message: format!("code {code}: {msg}"),
    }
}

pub struct PhemexClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    limiter: TokenBucket,
}

impl PhemexClient {
    pub fn new(api_key: &str, api_secret: &str, testnet: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BotError::Config(format!("failed to build HTTP client: {e}")))?;

        let base_url = if testnet {
            TESTNET_BASE_URL
        } else {
            MAINNET_BASE_URL
        };

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            limiter: TokenBucket::new(REQUESTS_PER_SECOND, REQUESTS_PER_SECOND as f64),
        })
    }

    /// Send one signed request, retrying transient failures with
    /// exponential backoff and jitter. The signature is recomputed per
    /// attempt so the expiry stays fresh across backoff sleeps.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let query = sorted_query(params);
        let body_text = match body {
            Some(value) => serde_json::to_string(value)
                .map_err(|e| BotError::Config(format!("unserializable request body: {e}")))?,
            None => String::new(),
        };

        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;

            match self.send_once(method.clone(), path, &query, &body_text).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient exchange error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body_text: &str,
    ) -> Result<Value> {
        let expiry = Utc::now().timestamp() + REQUEST_EXPIRY_WINDOW_SECS;
        let signature = sign_request(&self.api_key, &self.api_secret, expiry, query, body_text);

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut request = self
            .http
            .request(method, &url)
            .header(HEADER_ACCESS_TOKEN, &self.api_key)
            .header(HEADER_REQUEST_EXPIRY, expiry.to_string())
            .header(HEADER_REQUEST_SIGNATURE, signature);

        if !body_text.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_text.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BotError::Transient(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BotError::Auth(format!("{path} rejected with {status}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(BotError::Transient(format!("{path} returned {status}")));
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| BotError::Transient(format!("malformed response from {path}: {e}")))?;

        if envelope.code != 0 {
            return Err(map_exchange_error(envelope.code, &envelope.msg));
        }
        Ok(envelope.data)
    }

    fn parse_data<T: serde::de::DeserializeOwned>(&self, path: &str, data: Value) -> Result<T> {
        serde_json::from_value(data)
            .map_err(|e| BotError::Transient(format!("unexpected payload from {path}: {e}")))
    }

    async fn fetch_account_positions(&self) -> Result<RawAccountPositions> {
        let params = vec![("currency".to_string(), "USDT".to_string())];
        let data = self
            .request(Method::GET, "/accounts/accountPositions", &params, None)
            .await?;
        self.parse_data("/accounts/accountPositions", data)
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
    let factor = rand::thread_rng().gen_range(1.0 - RETRY_JITTER..=1.0 + RETRY_JITTER);
    Duration::from_millis((base as f64 * factor) as u64)
}

#[async_trait]
impl ExchangeClient for PhemexClient {
    async fn get_position(&self, symbol: &str, side: PosSide) -> Result<Position> {
        let payload = self.fetch_account_positions().await?;
        let open = payload
            .positions
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .filter(|p| p.pos_side() == Some(side))
            .find_map(RawPosition::into_open_position);

        Ok(match open {
            Some(position) => Position::Open(position),
            None => Position::Absent,
        })
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let data = self
            .request(Method::GET, "/md/ticker/24hr", &params, None)
            .await?;
        let raw: RawTicker = self.parse_data("/md/ticker/24hr", data)?;
        Ok(Ticker {
            best_bid: price_from_ep(raw.bid_ep),
            best_ask: price_from_ep(raw.ask_ep),
            last_price: price_from_ep(raw.last_ep),
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval_minutes: u32,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            (
                "resolution".to_string(),
                (interval_minutes as u64 * 60).to_string(),
            ),
            ("limit".to_string(), limit.to_string()),
        ];
        let data = self
            .request(Method::GET, "/exchange/public/md/v2/kline", &params, None)
            .await?;
        let raw: RawKlines = self.parse_data("/exchange/public/md/v2/kline", data)?;

        // Row layout: [timestamp, interval, last_close, open, high, low,
        // close, volume, turnover]; price columns are Ep-scaled.
        let mut candles: Vec<Candle> = raw
            .rows
            .iter()
            .filter(|row| row.len() >= 9)
            .filter_map(|row| {
                let timestamp = chrono::DateTime::from_timestamp(row[0], 0)?;
                Some(Candle {
                    timestamp,
                    open: price_from_ep(row[3]),
                    high: price_from_ep(row[4]),
                    low: price_from_ep(row[5]),
                    close: price_from_ep(row[6]),
                    volume: row[7] as f64,
                })
            })
            .collect();

        candles.sort_by_key(|c| c.timestamp);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn get_equity(&self) -> Result<Account> {
        let payload = self.fetch_account_positions().await?;
        let total = value_from_ev(payload.account.account_balance_ev);
        let used = value_from_ev(payload.account.total_used_balance_ev);
        Ok(Account {
            total_equity_usd: total,
            available_equity_usd: total - used,
        })
    }

    async fn get_instrument_meta(&self, symbol: &str) -> Result<InstrumentMeta> {
        let data = self
            .request(Method::GET, "/public/products", &[], None)
            .await?;
        let raw: RawProducts = self.parse_data("/public/products", data)?;
        let product = raw
            .products
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| BotError::Validation {
                kind: ValidationKind::UnknownSymbol,
                message: format!("{symbol} not listed"),
            })?;
        Ok(InstrumentMeta {
            min_qty: product.min_order_qty,
            max_qty: product.max_order_qty,
            qty_step: product.qty_step_size,
        })
    }

    async fn set_leverage(&self, symbol: &str, side: PosSide, leverage: u32) -> Result<()> {
        if leverage == 0 {
            return Err(BotError::Validation {
                kind: ValidationKind::InvalidLeverage,
                message: "leverage must be positive".into(),
            });
        }
        // Hedged-mode accounts carry independent leverage per direction.
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("posSide".to_string(), side.as_str().to_string()),
            (
                "leverageEr".to_string(),
                ratio_to_er(leverage as f64).to_string(),
            ),
        ];
        self.request(Method::PUT, "/positions/leverage", &params, None)
            .await?;
        Ok(())
    }

    async fn cancel_all_open(&self, symbol: &str) -> Result<u32> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let data = self
            .request(Method::DELETE, "/orders/all", &params, None)
            .await?;
        Ok(data.as_u64().unwrap_or(0) as u32)
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        limit_price: f64,
        reduce_only: bool,
    ) -> Result<String> {
        if qty <= 0.0 {
            return Err(BotError::Validation {
                kind: ValidationKind::InvalidQty,
                message: format!("quantity {qty} is not positive"),
            });
        }
        if limit_price <= 0.0 {
            return Err(BotError::Validation {
                kind: ValidationKind::InvalidPrice,
                message: format!("limit price {limit_price} is not positive"),
            });
        }

        let body = json!({
            "clOrdID": Uuid::new_v4().to_string(),
            "symbol": symbol,
            "side": side.as_str(),
            "ordType": "Limit",
            "timeInForce": "GoodTillCancel",
            "priceEp": price_to_ep(limit_price),
            "orderQty": qty,
            "reduceOnly": reduce_only,
        });
        let data = self
            .request(Method::POST, "/orders", &[], Some(&body))
            .await?;
        let order: RawOrder = self.parse_data("/orders", data)?;
        Ok(order.order_id)
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        let payload = self.fetch_account_positions().await?;
        let open = payload
            .positions
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .find_map(RawPosition::into_open_position);

        let Some(position) = open else {
            tracing::info!(symbol, "no open position to close");
            return Ok(());
        };

        let body = json!({
            "clOrdID": Uuid::new_v4().to_string(),
            "symbol": symbol,
            "side": position.side.exit_order_side().as_str(),
            "ordType": "Market",
            "orderQty": position.size_contracts,
            "reduceOnly": true,
        });
        self.request(Method::POST, "/orders", &[], Some(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_scaling_round_trips() {
        assert_eq!(price_to_ep(49_999.5), 499_995_000);
        assert_eq!(price_from_ep(499_995_000), 49_999.5);
        assert_eq!(value_from_ev(250_000_000), 2.5);
    }

    #[test]
    fn raw_position_maps_sides() {
        let raw = RawPosition {
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            size: 0.01,
            avg_entry_price_ep: 500_000_000,
            leverage_er: 1_000_000_000,
            unrealised_pnl_ev: -2_000_000_000,
            position_margin_ev: 5_000_000_000,
            maint_margin_req_ev: 250_000_000,
            liquidation_price_ep: 455_000_000,
        };
        let pos = raw.into_open_position().unwrap();
        assert_eq!(pos.side, PosSide::Long);
        assert_eq!(pos.entry_price, 50_000.0);
        assert_eq!(pos.leverage, 10.0);
        assert_eq!(pos.unrealized_pnl, -20.0);
        assert_eq!(pos.position_margin_usd, 50.0);
        assert_eq!(pos.liquidation_price, Some(45_500.0));
    }

    #[test]
    fn flat_raw_position_maps_to_none() {
        let raw = RawPosition {
            symbol: "BTCUSDT".into(),
            side: "None".into(),
            size: 0.0,
            avg_entry_price_ep: 0,
            leverage_er: 0,
            unrealised_pnl_ev: 0,
            position_margin_ev: 0,
            maint_margin_req_ev: 0,
            liquidation_price_ep: 0,
        };
        assert!(raw.into_open_position().is_none());
    }

    #[test]
    fn exchange_error_codes_map_to_kinds() {
        assert!(matches!(
            map_exchange_error(11043, "bad leverage"),
            BotError::Validation {
                kind: ValidationKind::InvalidLeverage,
                ..
            }
        ));
        assert!(matches!(
            map_exchange_error(10500, "auth expired"),
            BotError::Auth(_)
        ));
        assert!(matches!(
            map_exchange_error(99999, "whatever"),
            BotError::Validation {
                kind: ValidationKind::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn retry_delay_stays_within_jitter_band() {
        for attempt in 0..3 {
            let base = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
            for _ in 0..20 {
                let delay = retry_delay(attempt).as_millis() as f64;
                assert!(delay >= base as f64 * 0.75 - 1.0);
                assert!(delay <= base as f64 * 1.25 + 1.0);
            }
        }
    }
}
