//! Per-instrument tick orchestration.
//!
//! Strict sequence: prepare, gather, relevance gate, decide, execute,
//! alert. All blocking lives below in the adapter; the engine call in the
//! middle is pure. Failures are caught here at the instrument boundary and
//! turned into an alert plus an error outcome, so one instrument can never
//! take down the rest of the tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::ExchangeClient;
use crate::config::InstrumentConfig;
use crate::error::BotError;
use crate::indicators::{decline_report, volatility_report};
use crate::models::{
    Account, ActionPlan, InstrumentMeta, MarketSnapshot, OrderSide, PosSide, Position,
};
use crate::notifications::{AlertEvent, Notifier, PositionAction};
use crate::strategy::martingale::{MARGIN_CRITICAL_LEVEL, MARGIN_WARNING_LEVEL};
use crate::strategy::{decide, round_to_lot};

/// Longest indicator window (30 bars) times three.
pub const INDICATOR_CANDLE_BARS: usize = 90;

const EMA_FAST_PERIOD: usize = 50;
const EMA_SLOW_PERIOD: usize = 200;

/// One structured record per instrument per tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickOutcome {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    /// managed | skipped | error
    pub outcome: String,
    /// none | open | add | reduce | close
    pub action: String,
    pub reason: String,
    pub price: f64,
    pub position_size_contracts: f64,
    pub position_value_usd: f64,
    pub equity: f64,
    pub unrealized_pnl: f64,
    pub margin_level: Option<f64>,
    pub volatility_high: bool,
    pub decline_kind: Option<String>,
}

impl TickOutcome {
    fn bare(symbol: &str, outcome: &str, action: &str, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            outcome: outcome.to_string(),
            action: action.to_string(),
            reason: reason.into(),
            price: 0.0,
            position_size_contracts: 0.0,
            position_value_usd: 0.0,
            equity: 0.0,
            unrealized_pnl: 0.0,
            margin_level: None,
            volatility_high: false,
            decline_kind: None,
        }
    }

    /// Outcome for an instrument whose deadline elapsed mid-flight.
    pub fn cancelled(symbol: &str) -> Self {
        Self::bare(symbol, "skipped", "none", "cancelled before completion")
    }

    fn with_state(
        mut self,
        position: &Position,
        market: Option<&MarketSnapshot>,
        account: Option<&Account>,
    ) -> Self {
        if let Some(pos) = position.as_open() {
            self.position_size_contracts = pos.size_contracts;
            self.position_value_usd = pos.value_usd();
            self.unrealized_pnl = pos.unrealized_pnl;
            self.margin_level = Some(pos.margin_level());
        }
        if let Some(market) = market {
            self.price = market.last_price;
            self.volatility_high = market.volatility.is_high;
            self.decline_kind = Some(market.decline.kind.as_str().to_string());
        }
        if let Some(account) = account {
            self.equity = account.total_equity_usd;
        }
        self
    }
}

type StageError = (&'static str, BotError);

fn stage(name: &'static str) -> impl Fn(BotError) -> StageError {
    move |err| (name, err)
}

pub struct Workflow<C: ExchangeClient> {
    client: Arc<C>,
    notifier: Arc<Notifier>,
}

impl<C: ExchangeClient> Workflow<C> {
    pub fn new(client: Arc<C>, notifier: Arc<Notifier>) -> Self {
        Self { client, notifier }
    }

    /// Run one instrument to completion. Never propagates an error; the
    /// result is always a loggable outcome.
    pub async fn run(&self, cfg: &InstrumentConfig) -> TickOutcome {
        match self.run_instrument(cfg).await {
            Ok(outcome) => outcome,
            Err((stage, err)) => self.report_failure(cfg, stage, err).await,
        }
    }

    async fn run_instrument(
        &self,
        cfg: &InstrumentConfig,
    ) -> Result<TickOutcome, StageError> {
        let symbol = cfg.symbol.as_str();

        // Prepare: stale orders are gone and leverage is set before any
        // new order can possibly be placed.
        let cancelled = self
            .client
            .cancel_all_open(symbol)
            .await
            .map_err(stage("prepare"))?;
        if cancelled > 0 {
            tracing::info!(symbol, cancelled, "cancelled stale orders");
        }
        self.client
            .set_leverage(symbol, cfg.side, cfg.leverage)
            .await
            .map_err(stage("prepare"))?;

        // Gather: independent reads, issued concurrently under the shared
        // rate limiter.
        let (position, ticker, candles, account, meta) = tokio::try_join!(
            self.client.get_position(symbol, cfg.side),
            self.client.get_ticker(symbol),
            self.client
                .get_candles(symbol, cfg.ema_interval_minutes, INDICATOR_CANDLE_BARS),
            self.client.get_equity(),
            self.client.get_instrument_meta(symbol),
        )
        .map_err(stage("gather"))?;

        let ema_fast = match self
            .client
            .get_ema(symbol, EMA_FAST_PERIOD, cfg.ema_interval_minutes)
            .await
        {
            Ok(value) => value,
            Err(BotError::InsufficientData { needed, got }) => {
                return Ok(TickOutcome::bare(
                    symbol,
                    "skipped",
                    "none",
                    format!("not enough candles for fast EMA ({got}/{needed})"),
                )
                .with_state(&position, None, Some(&account)));
            }
            Err(err) => return Err(("gather", err)),
        };
        let ema_slow = match self
            .client
            .get_ema(symbol, EMA_SLOW_PERIOD, cfg.ema_interval_minutes)
            .await
        {
            Ok(value) => value,
            Err(BotError::InsufficientData { needed, got }) => {
                return Ok(TickOutcome::bare(
                    symbol,
                    "skipped",
                    "none",
                    format!("not enough candles for slow EMA ({got}/{needed})"),
                )
                .with_state(&position, None, Some(&account)));
            }
            Err(err) => return Err(("gather", err)),
        };

        let volatility =
            match volatility_report(&candles, cfg.ema_interval_minutes, &cfg.volatility_thresholds)
            {
                Ok(report) => report,
                Err(BotError::InsufficientData { needed, got }) => {
                    return Ok(TickOutcome::bare(
                        symbol,
                        "skipped",
                        "none",
                        format!("not enough candles for volatility ({got}/{needed})"),
                    )
                    .with_state(&position, None, Some(&account)));
                }
                Err(err) => return Err(("gather", err)),
            };
        let decline = match decline_report(&candles) {
            Ok(report) => report,
            Err(BotError::InsufficientData { needed, got }) => {
                return Ok(TickOutcome::bare(
                    symbol,
                    "skipped",
                    "none",
                    format!("not enough candles for decline velocity ({got}/{needed})"),
                )
                .with_state(&position, None, Some(&account)));
            }
            Err(err) => return Err(("gather", err)),
        };

        let market = MarketSnapshot {
            best_bid: ticker.best_bid,
            best_ask: ticker.best_ask,
            last_price: ticker.last_price,
            ema_fast,
            ema_slow,
            volatility,
            decline,
        };

        tracing::debug!(
            symbol,
            price = market.last_price,
            ema_fast,
            ema_slow,
            volatility_high = market.volatility.is_high,
            decline = market.decline.kind.as_str(),
            "gathered market state"
        );

        // Most ticks end here without running the engine at all.
        if let Some(reason) = relevance_gate(cfg, &position, &market) {
            return Ok(TickOutcome::bare(symbol, "skipped", "none", reason).with_state(
                &position,
                Some(&market),
                Some(&account),
            ));
        }

        let plan = decide(cfg, &position, &market, &account);
        tracing::info!(symbol, action = plan.label(), reason = plan.reason(), "engine decision");

        let executed = self
            .execute_plan(cfg, &plan, &position, &market, &meta)
            .await
            .map_err(stage("execute"))?;

        self.emit_alerts(cfg, &position, &market, &account, executed)
            .await;

        let outcome = if executed.is_some() { "managed" } else { "skipped" };
        Ok(
            TickOutcome::bare(symbol, outcome, plan.label(), plan.reason().to_string())
                .with_state(&position, Some(&market), Some(&account)),
        )
    }

    /// Dispatch the plan through the adapter. Returns what actually went
    /// out, for the post-action alert.
    async fn execute_plan(
        &self,
        cfg: &InstrumentConfig,
        plan: &ActionPlan,
        position: &Position,
        market: &MarketSnapshot,
        meta: &InstrumentMeta,
    ) -> Result<Option<(PositionAction, f64, f64)>, BotError> {
        let symbol = cfg.symbol.as_str();
        match plan {
            ActionPlan::NoOp { .. } => Ok(None),
            ActionPlan::Open {
                side,
                qty,
                limit_price,
            } => {
                let qty = round_to_lot(*qty, meta);
                let order_id = self
                    .client
                    .place_limit(symbol, *side, qty, *limit_price, false)
                    .await?;
                tracing::info!(symbol, %order_id, qty, price = limit_price, "opened position");
                Ok(Some((PositionAction::Opened, qty, *limit_price)))
            }
            ActionPlan::Add {
                side,
                qty,
                limit_price,
                rationale,
            } => {
                let qty = round_to_lot(*qty, meta);
                let order_id = self
                    .client
                    .place_limit(symbol, *side, qty, *limit_price, false)
                    .await?;
                tracing::info!(
                    symbol,
                    %order_id,
                    qty,
                    price = limit_price,
                    rationale = rationale.as_str(),
                    "added to position"
                );
                Ok(Some((PositionAction::Added, qty, *limit_price)))
            }
            ActionPlan::Reduce {
                fraction,
                rationale,
            } => {
                let Some(pos) = position.as_open() else {
                    return Ok(None);
                };
                let side = pos.side.exit_order_side();
                let price = match side {
                    OrderSide::Sell => market.best_ask,
                    OrderSide::Buy => market.best_bid,
                };
                let qty = round_to_lot(pos.size_contracts * fraction, meta);
                let order_id = self
                    .client
                    .place_limit(symbol, side, qty, price, true)
                    .await?;
                tracing::info!(
                    symbol,
                    %order_id,
                    qty,
                    price,
                    rationale = rationale.as_str(),
                    "reducing position"
                );
                Ok(Some((PositionAction::Reduced, qty, price)))
            }
            ActionPlan::Close { rationale } => {
                let size = position.as_open().map(|p| p.size_contracts).unwrap_or(0.0);
                self.client.close_position(symbol).await?;
                tracing::info!(symbol, size, rationale = rationale.as_str(), "closed position");
                Ok(Some((PositionAction::Closed, size, market.last_price)))
            }
        }
    }

    async fn emit_alerts(
        &self,
        cfg: &InstrumentConfig,
        position: &Position,
        market: &MarketSnapshot,
        account: &Account,
        executed: Option<(PositionAction, f64, f64)>,
    ) {
        let symbol = cfg.symbol.as_str();

        // The update carries the exchange's post-action snapshot, not the
        // order we sent.
        if let Some((action, qty, price)) = executed {
            match self.client.get_position(symbol, cfg.side).await {
                Ok(post) => {
                    let (size, value) = match post.as_open() {
                        Some(p) => (p.size_contracts, p.value_usd()),
                        None => (0.0, 0.0),
                    };
                    let pct = if account.total_equity_usd > 0.0 {
                        value / account.total_equity_usd
                    } else {
                        0.0
                    };
                    self.notifier
                        .send(&AlertEvent::PositionUpdate {
                            action,
                            symbol: symbol.to_string(),
                            side: cfg.side,
                            qty,
                            price,
                            post_size_contracts: size,
                            post_value_usd: value,
                            post_pct_of_equity: pct,
                            equity: account.total_equity_usd,
                        })
                        .await;

                    if let Some(p) = post.as_open() {
                        if p.margin_level() < MARGIN_WARNING_LEVEL {
                            self.notifier
                                .send(&AlertEvent::MarginWarning {
                                    symbol: symbol.to_string(),
                                    margin_level: p.margin_level(),
                                    equity: account.total_equity_usd,
                                    position_value_usd: p.value_usd(),
                                })
                                .await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(symbol, error = %e, "post-action position refresh failed");
                }
            }
        } else if let Some(pos) = position.as_open() {
            if pos.margin_level() < MARGIN_WARNING_LEVEL {
                self.notifier
                    .send(&AlertEvent::MarginWarning {
                        symbol: symbol.to_string(),
                        margin_level: pos.margin_level(),
                        equity: account.total_equity_usd,
                        position_value_usd: pos.value_usd(),
                    })
                    .await;
            }
        }

        if market.decline.is_dangerous() {
            self.notifier
                .send(&AlertEvent::DeclineVelocity {
                    symbol: symbol.to_string(),
                    kind: market.decline.kind,
                    score: market.decline.velocity_score,
                    roc_short: market.decline.roc_short,
                    roc_medium: market.decline.roc_medium,
                })
                .await;
        }

        if market.volatility.is_high {
            self.notifier
                .send(&AlertEvent::VolatilityHigh {
                    symbol: symbol.to_string(),
                    atr_ratio: market.volatility.atr_ratio,
                    bb_width_pct: market.volatility.bb_width_pct,
                    hist_vol_pct: market.volatility.historical_vol_pct,
                })
                .await;
        }
    }

    async fn report_failure(
        &self,
        cfg: &InstrumentConfig,
        stage: &'static str,
        err: BotError,
    ) -> TickOutcome {
        let symbol = cfg.symbol.as_str();

        if matches!(err, BotError::Cancelled) {
            tracing::warn!(symbol, stage, "instrument cancelled by deadline");
            return TickOutcome::cancelled(symbol);
        }

        tracing::error!(symbol, stage, error = %err, "instrument failed");

        let message = match &err {
            BotError::Transient(detail) => format!("retries exhausted: {detail}"),
            other => other.to_string(),
        };
        self.notifier
            .send(&AlertEvent::ExecutionError {
                symbol: symbol.to_string(),
                stage: stage.to_string(),
                error_kind: err.kind_label().to_string(),
                message: message.clone(),
            })
            .await;

        TickOutcome::bare(symbol, "error", "none", message)
    }
}

/// Cheap pre-check that spares the engine on the common do-nothing ticks.
fn relevance_gate(
    cfg: &InstrumentConfig,
    position: &Position,
    market: &MarketSnapshot,
) -> Option<String> {
    match position.as_open() {
        None => {
            let trend_ok = match cfg.side {
                PosSide::Long => market.last_price > market.ema_slow,
                PosSide::Short => market.last_price < market.ema_slow,
            };
            (!cfg.automatic_mode && !trend_ok).then(|| "waiting for trend".to_string())
        }
        Some(pos) => {
            let healthy = pos.margin_level() >= MARGIN_CRITICAL_LEVEL;
            let trend_aligned = match pos.side {
                PosSide::Long => market.last_price >= market.ema_fast,
                PosSide::Short => market.last_price <= market.ema_fast,
            };
            let no_profit_trigger = pos.unrealized_pnl <= 0.0;
            (healthy && trend_aligned && no_profit_trigger)
                .then(|| "holding; nothing to do".to_string())
        }
    }
}
