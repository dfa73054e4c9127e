//! Environment-style configuration.
//!
//! One process run covers one tick across a list of instruments. The
//! strategy parameters live on each instrument as an immutable value that
//! is threaded through the engine and workflow; there is no process-wide
//! parameter table.

use std::env;

use crate::error::{BotError, Result};
use crate::indicators::VolatilityThresholds;
use crate::models::PosSide;

/// Tokens accepted as "true" in SYMBOL triples and boolean env vars.
const TRUTHY: &[&str] = &["true", "1", "yes"];

/// Per-instrument strategy parameters, fixed for the duration of a tick.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub side: PosSide,
    /// Whether the bot may open a position from flat on its own.
    pub automatic_mode: bool,
    pub leverage: u32,
    pub ema_interval_minutes: u32,
    /// Close the position when uPnL / margin reaches this fraction...
    pub profit_pnl_target: f64,
    /// ...and uPnL is at least this fraction of total equity.
    pub profit_balance_threshold: f64,
    /// Margin-usage ceiling for averaging adds.
    pub position_ceiling_pct: f64,
    /// Entry size from flat, as a fraction of equity (before leverage).
    pub initial_entry_pct: f64,
    /// Minimum adverse move against entry before averaging in.
    pub add_trigger_drop_pct: f64,
    /// Optional hard margin cap; adds shrink quadratically toward it.
    pub max_margin_pct: Option<f64>,
    pub volatility_thresholds: VolatilityThresholds,
}

impl InstrumentConfig {
    pub fn new(symbol: impl Into<String>, side: PosSide, automatic_mode: bool) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            automatic_mode,
            leverage: 10,
            ema_interval_minutes: 1,
            profit_pnl_target: 0.10,
            profit_balance_threshold: 0.003,
            position_ceiling_pct: 0.10,
            initial_entry_pct: 0.006,
            add_trigger_drop_pct: 0.04,
            max_margin_pct: None,
            volatility_thresholds: VolatilityThresholds::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub api_secret: String,
    pub instruments: Vec<InstrumentConfig>,
    pub testnet: bool,
    /// Emit a Started alert at boot when set.
    pub startup_alert: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl AppConfig {
    /// Read configuration from the process environment. Any problem here
    /// is fatal at startup: the entrypoint exits non-zero.
    pub fn from_env() -> Result<Self> {
        let api_key = require_env("API_KEY")?;
        let api_secret = require_env("API_SECRET")?;
        let symbol_spec = require_env("SYMBOL")?;

        let ema_interval_minutes = match env::var("EMA_INTERVAL") {
            Ok(raw) => raw.trim().parse::<u32>().map_err(|_| {
                BotError::Config(format!("EMA_INTERVAL is not a number: {raw:?}"))
            })?,
            Err(_) => 1,
        };
        if ema_interval_minutes == 0 {
            return Err(BotError::Config("EMA_INTERVAL must be positive".into()));
        }

        let instruments = parse_symbol_list(&symbol_spec)?
            .into_iter()
            .map(|(symbol, side, auto)| {
                let mut cfg = InstrumentConfig::new(symbol, side, auto);
                cfg.ema_interval_minutes = ema_interval_minutes;
                cfg
            })
            .collect();

        Ok(Self {
            api_key,
            api_secret,
            instruments,
            testnet: env_flag("TESTNET"),
            startup_alert: env_flag("BOT_STARTUP"),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty()),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BotError::Config(format!("{key} must be set"))),
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(token: &str) -> bool {
    TRUTHY.contains(&token.trim().to_lowercase().as_str())
}

fn parse_side(token: &str) -> Result<PosSide> {
    match token.trim().to_lowercase().as_str() {
        "long" => Ok(PosSide::Long),
        "short" => Ok(PosSide::Short),
        other => Err(BotError::Config(format!(
            "side must be Long or Short, got {other:?}"
        ))),
    }
}

/// Parse the `SYMBOL` list: comma-separated `SYMBOL:SIDE:AUTO` triples.
pub fn parse_symbol_list(spec: &str) -> Result<Vec<(String, PosSide, bool)>> {
    let mut out = Vec::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(3, ':');
        let symbol = parts.next().unwrap_or_default().trim();
        let side = parts
            .next()
            .ok_or_else(|| BotError::Config(format!("missing side in {entry:?}")))?;
        let auto = parts
            .next()
            .ok_or_else(|| BotError::Config(format!("missing auto flag in {entry:?}")))?;

        if symbol.is_empty() {
            return Err(BotError::Config(format!("empty symbol in {entry:?}")));
        }
        out.push((symbol.to_string(), parse_side(side)?, is_truthy(auto)));
    }

    if out.is_empty() {
        return Err(BotError::Config("SYMBOL lists no instruments".into()));
    }
    Ok(out)
}
