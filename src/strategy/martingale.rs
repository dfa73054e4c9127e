//! Martingale averaging engine.
//!
//! `decide` maps one instrument's snapshot to a single action plan. It is
//! deterministic in its inputs and performs no I/O; branch order is fixed
//! and the first matching branch wins:
//!
//! 1. margin-critical override (protect against liquidation, no questions)
//! 2. profitable-position management (reduce ladder, full close)
//! 3. averaging into a losing position (gated by trend, drop, safety)
//! 4. opening from flat in automatic mode
//! 5. fallthrough no-op

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::config::InstrumentConfig;
use crate::models::{
    Account, ActionPlan, InstrumentMeta, MarketSnapshot, OpenPosition, OrderSide, PosSide,
    Position,
};

/// Margin level below which the bot averages down unconditionally.
pub const MARGIN_CRITICAL_LEVEL: f64 = 2.0;
/// Margin level below which a warning alert goes out.
pub const MARGIN_WARNING_LEVEL: f64 = 1.5;

/// Position fraction of equity above which half the position is closed.
const REDUCE_HALF_FRACTION: f64 = 0.10;
/// Position fraction of equity above which a third is closed.
const REDUCE_THIRD_FRACTION: f64 = 0.075;

/// Ceiling multiplier granted when the decline is slow and orderly.
const SAFE_DECLINE_CEILING_RELAXATION: f64 = 1.5;

pub fn decide(
    cfg: &InstrumentConfig,
    position: &Position,
    market: &MarketSnapshot,
    account: &Account,
) -> ActionPlan {
    if account.total_equity_usd <= 0.0 {
        return ActionPlan::noop("account has no equity");
    }

    match position.as_open() {
        Some(pos) => manage_open_position(cfg, pos, market, account),
        None => open_from_flat(cfg, market, account),
    }
}

fn manage_open_position(
    cfg: &InstrumentConfig,
    pos: &OpenPosition,
    market: &MarketSnapshot,
    account: &Account,
) -> ActionPlan {
    // Liquidation protection outranks every other consideration,
    // including the volatility and decline gates.
    if pos.margin_level() < MARGIN_CRITICAL_LEVEL {
        let qty = add_quantity(cfg, pos, market.last_price);
        return ActionPlan::Add {
            side: pos.side.entry_order_side(),
            qty,
            limit_price: maker_price(market, pos.side.entry_order_side()),
            rationale: "liquidation protection".into(),
        };
    }

    if pos.unrealized_pnl > 0.0 {
        return manage_profitable_position(cfg, pos, account);
    }

    consider_averaging_add(cfg, pos, market, account)
}

/// Reduce ladder first, then the full-close profit target.
fn manage_profitable_position(
    cfg: &InstrumentConfig,
    pos: &OpenPosition,
    account: &Account,
) -> ActionPlan {
    if pos.position_margin_usd <= 0.0 {
        return ActionPlan::noop("position reports no margin");
    }

    let position_fraction = account.margin_usage(pos.position_margin_usd);
    let pnl_of_margin = pos.unrealized_pnl / pos.position_margin_usd;
    let pnl_target_met = pnl_of_margin >= cfg.profit_pnl_target;
    let balance_threshold_met =
        pos.unrealized_pnl >= cfg.profit_balance_threshold * account.total_equity_usd;

    if position_fraction > REDUCE_HALF_FRACTION && pnl_target_met && balance_threshold_met {
        return ActionPlan::Reduce {
            fraction: 0.5,
            rationale: format!(
                "taking half off; position is {:.1}% of equity",
                position_fraction * 100.0
            ),
        };
    }
    if position_fraction > REDUCE_THIRD_FRACTION {
        return ActionPlan::Reduce {
            fraction: 0.33,
            rationale: format!(
                "trimming a third; position is {:.1}% of equity",
                position_fraction * 100.0
            ),
        };
    }
    if pnl_target_met && balance_threshold_met {
        return ActionPlan::Close {
            rationale: "target profit reached".into(),
        };
    }
    if pnl_target_met {
        return ActionPlan::noop("profit below balance threshold");
    }
    ActionPlan::noop("profitable, below reduce/close thresholds")
}

fn consider_averaging_add(
    cfg: &InstrumentConfig,
    pos: &OpenPosition,
    market: &MarketSnapshot,
    account: &Account,
) -> ActionPlan {
    // Average only when price has moved against the position relative to
    // its fast EMA.
    let trend_against = match pos.side {
        PosSide::Long => market.last_price < market.ema_fast,
        PosSide::Short => market.last_price > market.ema_fast,
    };
    if !trend_against {
        return ActionPlan::noop("price on favourable side of fast EMA; not averaging");
    }

    let adverse_move = match pos.side {
        PosSide::Long => (pos.entry_price - market.last_price) / pos.entry_price,
        PosSide::Short => (market.last_price - pos.entry_price) / pos.entry_price,
    };
    if adverse_move < cfg.add_trigger_drop_pct {
        return ActionPlan::noop("drawdown below add trigger");
    }

    if market.volatility.is_high {
        return ActionPlan::noop("high volatility; not adding");
    }
    if market.decline.is_dangerous() {
        return ActionPlan::NoOp {
            reason: format!(
                "dangerous decline ({}, score {:.0}); not adding",
                market.decline.kind.as_str(),
                market.decline.velocity_score
            ),
        };
    }

    let mut qty = add_quantity(cfg, pos, market.last_price);
    let usage = account.margin_usage(pos.position_margin_usd);

    if let Some(cap) = cfg.max_margin_pct {
        // Quadratic taper toward the cap: full size at zero usage,
        // nothing at the cap.
        let factor = taper_factor(cap, usage);
        if factor <= 0.0 {
            return ActionPlan::noop("margin cap reached");
        }
        qty *= factor;
    } else {
        let add_margin = qty * market.last_price / cfg.leverage as f64;
        let projected = account.margin_usage(pos.position_margin_usd + add_margin);
        let ceiling = if market.decline.is_safe() {
            cfg.position_ceiling_pct * SAFE_DECLINE_CEILING_RELAXATION
        } else {
            cfg.position_ceiling_pct
        };
        if projected > ceiling {
            return ActionPlan::noop("position ceiling reached");
        }
    }

    ActionPlan::Add {
        side: pos.side.entry_order_side(),
        qty,
        limit_price: maker_price(market, pos.side.entry_order_side()),
        rationale: format!("averaging into {:.1}% drawdown", adverse_move * 100.0),
    }
}

fn open_from_flat(
    cfg: &InstrumentConfig,
    market: &MarketSnapshot,
    account: &Account,
) -> ActionPlan {
    if !cfg.automatic_mode {
        return ActionPlan::noop("no applicable rule");
    }

    let trend_ok = match cfg.side {
        PosSide::Long => market.last_price > market.ema_slow,
        PosSide::Short => market.last_price < market.ema_slow,
    };
    if !trend_ok {
        return ActionPlan::noop(match cfg.side {
            PosSide::Long => "price below slow EMA; waiting for long trend",
            PosSide::Short => "price above slow EMA; waiting for short trend",
        });
    }

    if market.volatility.is_high {
        return ActionPlan::noop("high volatility; holding off entry");
    }
    if market.decline.is_dangerous() {
        return ActionPlan::NoOp {
            reason: format!(
                "dangerous decline ({}); holding off entry",
                market.decline.kind.as_str()
            ),
        };
    }

    let side = cfg.side.entry_order_side();
    let qty =
        cfg.initial_entry_pct * account.total_equity_usd * cfg.leverage as f64 / market.last_price;

    ActionPlan::Open {
        side,
        qty,
        limit_price: maker_price(market, side),
    }
}

/// Martingale sizing: the deeper the fractional loss, the larger the add.
/// `qty = value * leverage * max(loss, trigger) / price`.
fn add_quantity(cfg: &InstrumentConfig, pos: &OpenPosition, last_price: f64) -> f64 {
    let loss = pos.loss_fraction().max(cfg.add_trigger_drop_pct);
    pos.value_usd() * cfg.leverage as f64 * loss / last_price
}

/// `((cap - usage) / cap)^2`, clamped to zero at or beyond the cap.
fn taper_factor(cap: f64, usage: f64) -> f64 {
    if cap <= 0.0 || usage >= cap {
        return 0.0;
    }
    let headroom = (cap - usage) / cap;
    headroom * headroom
}

/// Passive maker side: buys rest on the bid, sells on the ask.
fn maker_price(market: &MarketSnapshot, side: OrderSide) -> f64 {
    match side {
        OrderSide::Buy => market.best_bid,
        OrderSide::Sell => market.best_ask,
    }
}

/// Floor-round a quantity to the instrument's step and clamp it to the
/// allowed bounds. Decimal arithmetic so step multiples come out exact.
pub fn round_to_lot(qty: f64, meta: &InstrumentMeta) -> f64 {
    let qty = Decimal::from_f64(qty).unwrap_or(Decimal::ZERO);
    let step = Decimal::from_f64(meta.qty_step).unwrap_or(Decimal::ZERO);
    let min_qty = Decimal::from_f64(meta.min_qty).unwrap_or(Decimal::ZERO);
    let max_qty = Decimal::from_f64(meta.max_qty).unwrap_or(Decimal::MAX);

    let stepped = if step > Decimal::ZERO {
        (qty / step).floor() * step
    } else {
        qty
    };

    stepped
        .clamp(min_qty, max_qty)
        .to_f64()
        .unwrap_or(meta.min_qty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{DeclineKind, DeclineReport, VolatilityReport};

    fn calm_volatility() -> VolatilityReport {
        VolatilityReport {
            atr: 10.0,
            atr_ratio: 1.0,
            bb_width_pct: 2.0,
            historical_vol_pct: 1.0,
            is_high: false,
        }
    }

    fn high_volatility() -> VolatilityReport {
        VolatilityReport {
            atr: 80.0,
            atr_ratio: 2.4,
            bb_width_pct: 11.0,
            historical_vol_pct: 7.5,
            is_high: true,
        }
    }

    fn decline(kind: DeclineKind, score: f64) -> DeclineReport {
        DeclineReport {
            roc_short: -0.01,
            roc_medium: -0.02,
            roc_long: -0.03,
            smoothness: 0.5,
            volume_ratio: 1.0,
            velocity_score: score,
            kind,
        }
    }

    fn market(last: f64, ema_fast: f64, ema_slow: f64) -> MarketSnapshot {
        MarketSnapshot {
            best_bid: last - 0.5,
            best_ask: last + 0.5,
            last_price: last,
            ema_fast,
            ema_slow,
            volatility: calm_volatility(),
            decline: decline(DeclineKind::Slow, 5.0),
        }
    }

    fn account(equity: f64) -> Account {
        Account {
            total_equity_usd: equity,
            available_equity_usd: equity,
        }
    }

    fn long_cfg() -> InstrumentConfig {
        InstrumentConfig::new("BTCUSDT", PosSide::Long, true)
    }

    fn losing_long(value: f64, pnl: f64, margin: f64, entry: f64) -> OpenPosition {
        OpenPosition {
            side: PosSide::Long,
            size_contracts: value / entry,
            entry_price: entry,
            leverage: 10.0,
            unrealized_pnl: pnl,
            position_margin_usd: margin,
            maintenance_margin_usd: margin / 10.0,
            liquidation_price: None,
        }
    }

    #[test]
    fn decide_is_deterministic() {
        let cfg = long_cfg();
        let pos = Position::Open(losing_long(200.0, -20.0, 20.0, 50_000.0));
        let market = market(47_500.0, 48_000.0, 49_000.0);
        let acct = account(1000.0);

        let first = decide(&cfg, &pos, &market, &acct);
        for _ in 0..10 {
            assert_eq!(first, decide(&cfg, &pos, &market, &acct));
        }
    }

    #[test]
    fn no_equity_means_no_orders() {
        let cfg = long_cfg();
        let pos = Position::Open(losing_long(200.0, -20.0, 20.0, 50_000.0));
        let market = market(47_500.0, 48_000.0, 49_000.0);

        let plan = decide(&cfg, &pos, &market, &account(0.0));
        assert_eq!(plan, ActionPlan::noop("account has no equity"));
    }

    #[test]
    fn margin_override_beats_safety_gates() {
        let cfg = long_cfg();
        // Margin level 1.8: (18 + 0) / 10.
        let pos = OpenPosition {
            unrealized_pnl: 0.0,
            position_margin_usd: 18.0,
            maintenance_margin_usd: 10.0,
            ..losing_long(200.0, 0.0, 18.0, 50_000.0)
        };
        let mut market = market(47_500.0, 48_000.0, 49_000.0);
        market.volatility = high_volatility();
        market.decline = decline(DeclineKind::Crash, 90.0);

        let plan = decide(&cfg, &Position::Open(pos), &market, &account(1000.0));
        match plan {
            ActionPlan::Add { rationale, qty, .. } => {
                assert_eq!(rationale, "liquidation protection");
                assert!(qty > 0.0);
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn profit_ladder_prefers_third_between_thresholds() {
        let cfg = long_cfg();
        // fraction 0.08, pnl below target: Reduce(0.33) regardless.
        let pos = losing_long(800.0, 2.0, 80.0, 50_000.0);
        let plan = decide(
            &cfg,
            &Position::Open(pos),
            &market(50_500.0, 50_000.0, 49_000.0),
            &account(1000.0),
        );
        assert!(matches!(plan, ActionPlan::Reduce { fraction, .. } if fraction == 0.33));
    }

    #[test]
    fn profit_close_requires_balance_threshold() {
        let cfg = long_cfg();
        // pnl/margin = 2/15 = 0.133 >= 0.10, but 2 < 0.003 * 1000 = 3.
        let pos = losing_long(150.0, 2.0, 15.0, 50_000.0);
        let plan = decide(
            &cfg,
            &Position::Open(pos),
            &market(50_500.0, 50_000.0, 49_000.0),
            &account(1000.0),
        );
        assert_eq!(plan, ActionPlan::noop("profit below balance threshold"));
    }

    #[test]
    fn profit_close_when_both_thresholds_met() {
        let cfg = long_cfg();
        // pnl/margin = 5/15 and pnl 5 >= 3; fraction 0.015 below ladder.
        let pos = losing_long(150.0, 5.0, 15.0, 50_000.0);
        let plan = decide(
            &cfg,
            &Position::Open(pos),
            &market(50_500.0, 50_000.0, 49_000.0),
            &account(1000.0),
        );
        assert!(matches!(plan, ActionPlan::Close { .. }));
    }

    #[test]
    fn martingale_add_scales_with_loss() {
        let cfg = long_cfg();
        let acct = account(10_000.0);
        let market = market(45_000.0, 48_000.0, 49_000.0);

        let mut last_qty = 0.0;
        for loss in [-10.0, -20.0, -40.0, -80.0] {
            // Margin stays comfortable so the sizing always comes from the
            // averaging branch, not the liquidation override.
            let pos = losing_long(200.0, loss, 200.0, 50_000.0);
            let plan = decide(&cfg, &Position::Open(pos), &market, &acct);
            match plan {
                ActionPlan::Add { qty, .. } => {
                    assert!(qty >= last_qty, "qty shrank as loss grew");
                    last_qty = qty;
                }
                other => panic!("expected Add, got {other:?}"),
            }
        }
    }

    #[test]
    fn add_requires_price_below_fast_ema_for_long() {
        let cfg = long_cfg();
        let pos = losing_long(200.0, -20.0, 50.0, 50_000.0);
        // Price above fast EMA: favourable side, no averaging.
        let plan = decide(
            &cfg,
            &Position::Open(pos),
            &market(47_500.0, 47_000.0, 49_000.0),
            &account(1000.0),
        );
        assert!(matches!(plan, ActionPlan::NoOp { ref reason } if reason.contains("fast EMA")));
    }

    #[test]
    fn add_requires_minimum_drawdown() {
        let cfg = long_cfg();
        // Only 1% against entry; trigger is 4%.
        let pos = losing_long(200.0, -2.0, 20.0, 50_000.0);
        let plan = decide(
            &cfg,
            &Position::Open(pos),
            &market(49_500.0, 49_800.0, 49_000.0),
            &account(1000.0),
        );
        assert!(matches!(plan, ActionPlan::NoOp { ref reason } if reason.contains("add trigger")));
    }

    #[test]
    fn add_blocked_by_high_volatility() {
        let cfg = long_cfg();
        let pos = losing_long(200.0, -10.0, 50.0, 50_000.0);
        let mut market = market(47_500.0, 48_000.0, 49_000.0);
        market.volatility = high_volatility();

        let plan = decide(&cfg, &Position::Open(pos), &market, &account(1000.0));
        assert!(matches!(plan, ActionPlan::NoOp { ref reason } if reason.contains("volatility")));
    }

    #[test]
    fn add_blocked_by_dangerous_decline() {
        let cfg = long_cfg();
        let pos = losing_long(200.0, -10.0, 50.0, 50_000.0);
        let mut market = market(47_500.0, 48_000.0, 49_000.0);
        market.decline = decline(DeclineKind::Fast, 55.0);

        let plan = decide(&cfg, &Position::Open(pos), &market, &account(1000.0));
        assert!(matches!(plan, ActionPlan::NoOp { ref reason } if reason.contains("decline")));
    }

    #[test]
    fn taper_reaches_zero_at_cap() {
        let mut cfg = long_cfg();
        cfg.max_margin_pct = Some(0.50);

        // Usage exactly at cap: margin 500 of 1000 equity.
        let pos = losing_long(5000.0, -100.0, 500.0, 50_000.0);
        let plan = decide(
            &cfg,
            &Position::Open(pos),
            &market(45_000.0, 48_000.0, 49_000.0),
            &account(1000.0),
        );
        assert_eq!(plan, ActionPlan::noop("margin cap reached"));
    }

    #[test]
    fn taper_quarters_add_at_half_cap() {
        let mut base_cfg = long_cfg();
        let mut capped_cfg = long_cfg();
        capped_cfg.max_margin_pct = Some(0.50);
        base_cfg.position_ceiling_pct = 1.0;

        // Usage 0.25: margin 250 of 1000 equity.
        let pos = losing_long(2500.0, -100.0, 250.0, 50_000.0);
        let market = market(45_000.0, 48_000.0, 49_000.0);
        let acct = account(1000.0);

        let base = decide(&base_cfg, &Position::Open(pos.clone()), &market, &acct);
        let tapered = decide(&capped_cfg, &Position::Open(pos), &market, &acct);
        match (base, tapered) {
            (ActionPlan::Add { qty: b, .. }, ActionPlan::Add { qty: t, .. }) => {
                // ((0.5 - 0.25) / 0.5)^2 = 0.25
                assert!((t - b * 0.25).abs() < 1e-9, "base {b}, tapered {t}");
            }
            other => panic!("expected two Adds, got {other:?}"),
        }
    }

    #[test]
    fn ceiling_relaxed_on_slow_decline() {
        let mut cfg = long_cfg();
        cfg.position_ceiling_pct = 0.05;

        // Projected usage 0.06 lands between the plain ceiling and 1.5x.
        let pos = losing_long(400.0, -20.0, 40.0, 50_000.0);
        let acct = account(1000.0);
        let mut snapshot = market(45_000.0, 48_000.0, 49_000.0);

        snapshot.decline = decline(DeclineKind::Slow, 5.0);
        let relaxed = decide(&cfg, &Position::Open(pos.clone()), &snapshot, &acct);
        assert!(matches!(relaxed, ActionPlan::Add { .. }), "got {relaxed:?}");

        snapshot.decline = decline(DeclineKind::Moderate, 25.0);
        let strict = decide(&cfg, &Position::Open(pos), &snapshot, &acct);
        assert_eq!(strict, ActionPlan::noop("position ceiling reached"));
    }

    #[test]
    fn open_from_flat_follows_slow_ema() {
        let cfg = long_cfg();
        let acct = account(1000.0);

        let plan = decide(
            &cfg,
            &Position::Absent,
            &market(50_000.0, 49_950.0, 49_900.0),
            &acct,
        );
        match plan {
            ActionPlan::Open {
                side,
                qty,
                limit_price,
            } => {
                assert_eq!(side, OrderSide::Buy);
                // 0.006 * 1000 * 10 / 50_000
                assert!((qty - 0.0012).abs() < 1e-12);
                assert_eq!(limit_price, 49_999.5);
            }
            other => panic!("expected Open, got {other:?}"),
        }

        let wrong_trend = decide(
            &cfg,
            &Position::Absent,
            &market(50_000.0, 49_950.0, 50_100.0),
            &acct,
        );
        assert_eq!(
            wrong_trend,
            ActionPlan::noop("price below slow EMA; waiting for long trend")
        );
    }

    #[test]
    fn open_blocked_by_volatility_names_it() {
        let cfg = long_cfg();
        let mut snapshot = market(50_000.0, 49_950.0, 49_900.0);
        snapshot.volatility = high_volatility();

        let plan = decide(&cfg, &Position::Absent, &snapshot, &account(1000.0));
        assert!(matches!(plan, ActionPlan::NoOp { ref reason } if reason.contains("volatility")));
    }

    #[test]
    fn manual_mode_never_opens() {
        let cfg = InstrumentConfig::new("BTCUSDT", PosSide::Long, false);
        let plan = decide(
            &cfg,
            &Position::Absent,
            &market(50_000.0, 49_950.0, 49_900.0),
            &account(1000.0),
        );
        assert_eq!(plan, ActionPlan::noop("no applicable rule"));
    }

    #[test]
    fn short_side_mirrors_predicates() {
        let cfg = InstrumentConfig::new("BTCUSDT", PosSide::Short, true);
        let acct = account(1000.0);

        // Short opens below the slow EMA and sells at the ask.
        let plan = decide(
            &cfg,
            &Position::Absent,
            &market(49_000.0, 49_100.0, 49_500.0),
            &acct,
        );
        match plan {
            ActionPlan::Open {
                side, limit_price, ..
            } => {
                assert_eq!(side, OrderSide::Sell);
                assert_eq!(limit_price, 49_000.5);
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn round_to_lot_floors_and_clamps() {
        let meta = InstrumentMeta {
            min_qty: 0.001,
            max_qty: 100.0,
            qty_step: 0.001,
        };
        assert_eq!(round_to_lot(0.0042105, &meta), 0.004);
        assert_eq!(round_to_lot(0.0009, &meta), 0.001);
        assert_eq!(round_to_lot(250.0, &meta), 100.0);
        // Floats that decimal floor-rounding must not mangle.
        assert_eq!(round_to_lot(0.3, &meta), 0.3);
    }
}
