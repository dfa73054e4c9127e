// Technical indicators: pure functions over candle slices.
// Nothing in here performs I/O or blocks.

pub mod atr;
pub mod decline;
pub mod moving_average;
pub mod volatility;

pub use atr::{calculate_atr, calculate_atr_series};
pub use decline::{decline_report, DeclineKind, DeclineReport};
pub use moving_average::{calculate_ema, calculate_sma};
pub use volatility::{volatility_report, VolatilityReport, VolatilityThresholds};
