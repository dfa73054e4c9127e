use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators::{DeclineReport, VolatilityReport};

/// Direction of the configured exposure for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    /// The order side that increases exposure in this direction.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PosSide::Long => OrderSide::Buy,
            PosSide::Short => OrderSide::Sell,
        }
    }

    /// The order side that reduces exposure in this direction.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            PosSide::Long => OrderSide::Sell,
            PosSide::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PosSide::Long => "Long",
            PosSide::Short => "Short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// OHLCV candlestick, oldest-first in every slice the bot handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Best bid/ask and last traded price for a symbol.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    pub best_bid: f64,
    pub best_ask: f64,
    pub last_price: f64,
}

/// A live position as reported by the exchange. Absent when size is zero.
#[derive(Debug, Clone, PartialEq)]
pub enum Position {
    Absent,
    Open(OpenPosition),
}

impl Position {
    /// The open position, if any. A snapshot with non-zero contracts but
    /// zero notional value is stale exchange data and counts as absent.
    pub fn as_open(&self) -> Option<&OpenPosition> {
        match self {
            Position::Open(p) if p.value_usd() > 0.0 => Some(p),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.as_open().is_none()
    }
}

/// Sentinel margin level when the exchange reports no maintenance margin.
/// Effectively "no liquidation risk".
pub const MARGIN_LEVEL_SAFE: f64 = 999.0;

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub side: PosSide,
    pub size_contracts: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub position_margin_usd: f64,
    pub maintenance_margin_usd: f64,
    pub liquidation_price: Option<f64>,
}

impl OpenPosition {
    /// Notional value of the position at its average entry price.
    pub fn value_usd(&self) -> f64 {
        self.size_contracts * self.entry_price
    }

    /// Headroom-to-liquidation proxy: (margin + uPnL) / maintenance margin.
    /// Higher is safer; the exchange liquidates near 1.0.
    pub fn margin_level(&self) -> f64 {
        if self.maintenance_margin_usd <= 0.0 {
            return MARGIN_LEVEL_SAFE;
        }
        (self.position_margin_usd + self.unrealized_pnl) / self.maintenance_margin_usd
    }

    /// Fractional loss of notional value. Zero when in profit.
    pub fn loss_fraction(&self) -> f64 {
        if self.unrealized_pnl >= 0.0 {
            return 0.0;
        }
        let value = self.value_usd();
        if value <= 0.0 {
            return 0.0;
        }
        self.unrealized_pnl.abs() / value
    }
}

/// Everything the engine needs to know about the market for one symbol,
/// rebuilt from fresh exchange data on every tick.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub last_price: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub volatility: VolatilityReport,
    pub decline: DeclineReport,
}

/// Account equity snapshot in settlement currency.
#[derive(Debug, Clone, Copy)]
pub struct Account {
    pub total_equity_usd: f64,
    pub available_equity_usd: f64,
}

impl Account {
    /// Fraction of equity locked as margin for the given position.
    pub fn margin_usage(&self, position_margin_usd: f64) -> f64 {
        if self.total_equity_usd <= 0.0 {
            return 0.0;
        }
        position_margin_usd / self.total_equity_usd
    }
}

/// Lot-size constraints for a symbol, used to round order quantities.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentMeta {
    pub min_qty: f64,
    pub max_qty: f64,
    pub qty_step: f64,
}

/// The engine's verdict for one instrument on one tick. Execution is the
/// workflow's job; the engine only ever returns one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPlan {
    NoOp {
        reason: String,
    },
    Open {
        side: OrderSide,
        qty: f64,
        limit_price: f64,
    },
    Add {
        side: OrderSide,
        qty: f64,
        limit_price: f64,
        rationale: String,
    },
    Reduce {
        fraction: f64,
        rationale: String,
    },
    Close {
        rationale: String,
    },
}

impl ActionPlan {
    pub fn noop(reason: impl Into<String>) -> Self {
        ActionPlan::NoOp {
            reason: reason.into(),
        }
    }

    /// Short tag for log records.
    pub fn label(&self) -> &'static str {
        match self {
            ActionPlan::NoOp { .. } => "none",
            ActionPlan::Open { .. } => "open",
            ActionPlan::Add { .. } => "add",
            ActionPlan::Reduce { .. } => "reduce",
            ActionPlan::Close { .. } => "close",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ActionPlan::NoOp { reason } => reason,
            ActionPlan::Add { rationale, .. }
            | ActionPlan::Reduce { rationale, .. }
            | ActionPlan::Close { rationale } => rationale,
            ActionPlan::Open { .. } => "entry conditions met",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> OpenPosition {
        OpenPosition {
            side: PosSide::Long,
            size_contracts: 0.01,
            entry_price: 50_000.0,
            leverage: 10.0,
            unrealized_pnl: -50.0,
            position_margin_usd: 50.0,
            maintenance_margin_usd: 5.0,
            liquidation_price: Some(45_500.0),
        }
    }

    #[test]
    fn margin_level_uses_maintenance_margin() {
        let pos = long_position();
        // (50 - 50) / 5 = 0.0
        assert_eq!(pos.margin_level(), 0.0);

        let healthy = OpenPosition {
            unrealized_pnl: 10.0,
            ..long_position()
        };
        assert_eq!(healthy.margin_level(), 12.0);
    }

    #[test]
    fn margin_level_without_maintenance_is_safe() {
        let pos = OpenPosition {
            maintenance_margin_usd: 0.0,
            ..long_position()
        };
        assert_eq!(pos.margin_level(), MARGIN_LEVEL_SAFE);
    }

    #[test]
    fn stale_position_counts_as_absent() {
        let stale = Position::Open(OpenPosition {
            entry_price: 0.0,
            ..long_position()
        });
        assert!(stale.is_absent());
        assert!(stale.as_open().is_none());
    }

    #[test]
    fn loss_fraction_is_zero_in_profit() {
        let pos = OpenPosition {
            unrealized_pnl: 25.0,
            ..long_position()
        };
        assert_eq!(pos.loss_fraction(), 0.0);

        let losing = long_position();
        // 50 / (0.01 * 50_000) = 0.10
        assert!((losing.loss_fraction() - 0.10).abs() < 1e-12);
    }

    #[test]
    fn order_sides_follow_position_side() {
        assert_eq!(PosSide::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(PosSide::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(PosSide::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(PosSide::Short.exit_order_side(), OrderSide::Buy);
    }
}
