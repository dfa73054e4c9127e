pub mod auth;
pub mod phemex;
pub mod rate_limit;

pub use phemex::PhemexClient;
pub use rate_limit::TokenBucket;

use async_trait::async_trait;

use crate::error::{BotError, Result};
use crate::indicators::calculate_ema;
use crate::models::{Account, Candle, InstrumentMeta, OrderSide, PosSide, Position, Ticker};

/// The seam between the decision core and a concrete exchange.
///
/// The live client signs REST requests against the exchange; tests and the
/// backtester substitute a fake. Every method reconstructs state fresh:
/// nothing is cached across calls except the client's own rate-limit
/// tokens.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Current position for the symbol, `Position::Absent` when flat.
    async fn get_position(&self, symbol: &str, side: PosSide) -> Result<Position>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// Candles ordered oldest to newest.
    async fn get_candles(
        &self,
        symbol: &str,
        interval_minutes: u32,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn get_equity(&self) -> Result<Account>;

    /// Lot-size bounds used to round order quantities.
    async fn get_instrument_meta(&self, symbol: &str) -> Result<InstrumentMeta>;

    async fn set_leverage(&self, symbol: &str, side: PosSide, leverage: u32) -> Result<()>;

    /// Cancel every open order on the symbol; returns how many were cancelled.
    async fn cancel_all_open(&self, symbol: &str) -> Result<u32>;

    /// Place a limit order; returns the exchange order id.
    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        limit_price: f64,
        reduce_only: bool,
    ) -> Result<String>;

    /// Fully close the current position with a reduce-only market order.
    async fn close_position(&self, symbol: &str) -> Result<()>;

    /// Latest EMA of close price. Fetches three windows of candles so the
    /// recurrence has room to converge.
    async fn get_ema(&self, symbol: &str, period: usize, interval_minutes: u32) -> Result<f64> {
        let candles = self.get_candles(symbol, interval_minutes, period * 3).await?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        calculate_ema(&closes, period).ok_or(BotError::InsufficientData {
            needed: period,
            got: closes.len(),
        })
    }
}
