/// Volatility classification for the safety gate.
///
/// Three independent measures feed one boolean: ATR relative to its own
/// recent mean, Bollinger band width, and historical (log-return)
/// volatility. Any one of them breaching its threshold marks the market
/// as high-volatility.
use crate::error::{BotError, Result};
use crate::indicators::atr::{calculate_atr, calculate_atr_series};
use crate::indicators::moving_average::calculate_sma;
use crate::models::Candle;

pub const ATR_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_K: f64 = 2.0;
pub const HIST_VOL_PERIOD: usize = 20;

/// Breach thresholds. The defaults are part of the contract.
#[derive(Debug, Clone, Copy)]
pub struct VolatilityThresholds {
    pub atr_ratio: f64,
    pub bb_width_pct: f64,
    pub historical_vol_pct: f64,
}

impl Default for VolatilityThresholds {
    fn default() -> Self {
        Self {
            atr_ratio: 1.5,
            bb_width_pct: 8.0,
            historical_vol_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VolatilityReport {
    pub atr: f64,
    /// Current ATR divided by the mean of its own rolling series.
    pub atr_ratio: f64,
    pub bb_width_pct: f64,
    pub historical_vol_pct: f64,
    pub is_high: bool,
}

impl VolatilityReport {
    /// Which measure tripped, for alert and skip messages.
    pub fn trigger(&self, thresholds: &VolatilityThresholds) -> Option<&'static str> {
        if self.atr_ratio > thresholds.atr_ratio {
            Some("atr ratio")
        } else if self.bb_width_pct > thresholds.bb_width_pct {
            Some("bollinger width")
        } else if self.historical_vol_pct > thresholds.historical_vol_pct {
            Some("historical volatility")
        } else {
            None
        }
    }
}

/// Sample standard deviation (n - 1 denominator).
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Bollinger band width as a percentage of the middle band:
/// `(upper - lower) / middle * 100` over the last `period` closes.
pub fn bollinger_width_pct(closes: &[f64], period: usize, k: f64) -> Option<f64> {
    if closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let middle = calculate_sma(window, period)?;
    if middle == 0.0 {
        return None;
    }
    let sigma = std_dev(window)?;
    Some(2.0 * k * sigma / middle * 100.0)
}

/// Standard deviation of log returns over the last `period` returns,
/// scaled by sqrt(bars per day) to a daily-equivalent percentage.
pub fn historical_volatility_pct(closes: &[f64], period: usize, bars_per_day: f64) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];
    let mut returns = Vec::with_capacity(period);
    for pair in window.windows(2) {
        if pair[0] <= 0.0 || pair[1] <= 0.0 {
            return None;
        }
        returns.push((pair[1] / pair[0]).ln());
    }
    let sigma = std_dev(&returns)?;
    Some(sigma * bars_per_day.sqrt() * 100.0)
}

/// Build the full volatility report for one symbol's recent candles.
pub fn volatility_report(
    candles: &[Candle],
    interval_minutes: u32,
    thresholds: &VolatilityThresholds,
) -> Result<VolatilityReport> {
    let needed = HIST_VOL_PERIOD + 1;
    if candles.len() < needed {
        return Err(BotError::InsufficientData {
            needed,
            got: candles.len(),
        });
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let atr = calculate_atr(candles, ATR_PERIOD).ok_or(BotError::InsufficientData {
        needed: ATR_PERIOD + 1,
        got: candles.len(),
    })?;
    let atr_series = calculate_atr_series(candles, ATR_PERIOD);
    let atr_mean = atr_series.iter().sum::<f64>() / atr_series.len() as f64;
    let atr_ratio = if atr_mean > 0.0 { atr / atr_mean } else { 0.0 };

    let bb_width_pct = bollinger_width_pct(&closes, BOLLINGER_PERIOD, BOLLINGER_K).ok_or(
        BotError::InsufficientData {
            needed: BOLLINGER_PERIOD,
            got: closes.len(),
        },
    )?;

    let bars_per_day = 1440.0 / interval_minutes.max(1) as f64;
    let historical_vol_pct = historical_volatility_pct(&closes, HIST_VOL_PERIOD, bars_per_day)
        .ok_or(BotError::InsufficientData {
            needed: HIST_VOL_PERIOD + 1,
            got: closes.len(),
        })?;

    let is_high = atr_ratio > thresholds.atr_ratio
        || bb_width_pct > thresholds.bb_width_pct
        || historical_vol_pct > thresholds.historical_vol_pct;

    Ok(VolatilityReport {
        atr,
        atr_ratio,
        bb_width_pct,
        historical_vol_pct,
        is_high,
    })
}
