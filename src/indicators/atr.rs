/// Average True Range (ATR)
///
/// True range at bar t is the greatest of:
/// - high - low
/// - |high - previous close|
/// - |low - previous close|
///
/// The ATR here is the plain mean of the true ranges over the last
/// `period` bars.
use crate::models::Candle;

fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut ranges = Vec::with_capacity(candles.len().saturating_sub(1));
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        ranges.push(tr);
    }
    ranges
}

/// Mean true range over the last `period` bars, or None if there are not
/// enough candles (`period + 1` needed for the first previous close).
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(candles);
    let sum: f64 = ranges.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Rolling ATR values, one per bar starting at index `period`.
/// Used to compare the current ATR against its own recent history.
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let ranges = true_ranges(candles);
    let mut series = Vec::with_capacity(ranges.len() - period + 1);
    for end in period..=ranges.len() {
        let window = &ranges[end - period..end];
        series.push(window.iter().sum::<f64>() / period as f64);
    }
    series
}
