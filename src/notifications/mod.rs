//! Outbound alerts over Telegram.
//!
//! The sink is best-effort by contract: a failed notification is logged at
//! warn level and never fails the tick. When the bot token or chat id are
//! missing the notifier constructs in disabled state and every send is a
//! no-op.

use serde_json::json;
use tokio::time::Duration;

use crate::indicators::DeclineKind;
use crate::models::PosSide;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Opened,
    Added,
    Reduced,
    Closed,
}

impl PositionAction {
    fn as_str(&self) -> &'static str {
        match self {
            PositionAction::Opened => "Opened",
            PositionAction::Added => "Added",
            PositionAction::Reduced => "Reduced",
            PositionAction::Closed => "Closed",
        }
    }
}

/// Everything the bot can tell a human about, one fixed shape per kind.
#[derive(Debug, Clone)]
pub enum AlertEvent {
    PositionUpdate {
        action: PositionAction,
        symbol: String,
        side: PosSide,
        qty: f64,
        price: f64,
        post_size_contracts: f64,
        post_value_usd: f64,
        post_pct_of_equity: f64,
        equity: f64,
    },
    VolatilityHigh {
        symbol: String,
        atr_ratio: f64,
        bb_width_pct: f64,
        hist_vol_pct: f64,
    },
    DeclineVelocity {
        symbol: String,
        kind: DeclineKind,
        score: f64,
        roc_short: f64,
        roc_medium: f64,
    },
    MarginWarning {
        symbol: String,
        margin_level: f64,
        equity: f64,
        position_value_usd: f64,
    },
    ExecutionError {
        symbol: String,
        stage: String,
        error_kind: String,
        message: String,
    },
    Started {
        instruments: Vec<String>,
        testnet: bool,
    },
}

pub struct Notifier {
    http: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl Notifier {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        let credentials = match (bot_token, chat_id) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
                tracing::info!("telegram notifications enabled");
                Some((token, chat))
            }
            _ => {
                tracing::warn!("telegram notifications disabled: bot token or chat id not set");
                None
            }
        };

        Self {
            http: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
            credentials,
        }
    }

    pub fn enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fire-and-forget delivery; failures are logged, never propagated.
    pub async fn send(&self, event: &AlertEvent) {
        let Some((token, chat_id)) = &self.credentials else {
            return;
        };

        let url = format!("{TELEGRAM_API_BASE}/bot{token}/sendMessage");
        let payload = json!({
            "chat_id": chat_id,
            "text": format_event(event),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        match self.http.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("telegram notification sent");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "telegram rejected notification");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send telegram notification");
            }
        }
    }
}

fn format_event(event: &AlertEvent) -> String {
    match event {
        AlertEvent::PositionUpdate {
            action,
            symbol,
            side,
            qty,
            price,
            post_size_contracts,
            post_value_usd,
            post_pct_of_equity,
            equity,
        } => format!(
            "\u{1F7E2} <b>Position {}</b>\n\n\
             Symbol: <code>{}</code>\n\
             Side: <b>{}</b>\n\
             Quantity: <code>{:.6}</code>\n\
             Price: <code>{:.4}</code>\n\
             Position: <code>{:.6}</code> contracts (${:.2})\n\
             Position Size: <code>{:.2}%</code> of balance\n\
             Total Balance: <code>${:.2}</code>",
            action.as_str(),
            symbol,
            side.as_str(),
            qty,
            price,
            post_size_contracts,
            post_value_usd,
            post_pct_of_equity * 100.0,
            equity,
        ),
        AlertEvent::VolatilityHigh {
            symbol,
            atr_ratio,
            bb_width_pct,
            hist_vol_pct,
        } => format!(
            "\u{26A0} <b>HIGH VOLATILITY</b>\n\n\
             Symbol: <code>{symbol}</code>\n\
             ATR ratio: <code>{atr_ratio:.2}</code>\n\
             BB width: <code>{bb_width_pct:.2}%</code>\n\
             Hist vol: <code>{hist_vol_pct:.2}%</code>"
        ),
        AlertEvent::DeclineVelocity {
            symbol,
            kind,
            score,
            roc_short,
            roc_medium,
        } => format!(
            "\u{1F4C9} <b>DECLINE VELOCITY: {}</b>\n\n\
             Symbol: <code>{}</code>\n\
             Score: <code>{:.0}</code>\n\
             ROC 5: <code>{:.2}%</code>\n\
             ROC 15: <code>{:.2}%</code>",
            kind.as_str(),
            symbol,
            score,
            roc_short * 100.0,
            roc_medium * 100.0,
        ),
        AlertEvent::MarginWarning {
            symbol,
            margin_level,
            equity,
            position_value_usd,
        } => format!(
            "\u{1F6A8} <b>MARGIN WARNING</b>\n\n\
             Symbol: <code>{symbol}</code>\n\
             Margin Level: <code>{margin_level:.2}</code>\n\
             Position Value: <code>${position_value_usd:.2}</code>\n\
             Total Balance: <code>${equity:.2}</code>\n\n\
             \u{26A0} Position at risk of liquidation!"
        ),
        AlertEvent::ExecutionError {
            symbol,
            stage,
            error_kind,
            message,
        } => format!(
            "\u{274C} <b>ERROR</b>\n\n\
             Symbol: <code>{symbol}</code>\n\
             Stage: {stage}\n\
             Kind: {error_kind}\n\
             Message: {message}"
        ),
        AlertEvent::Started {
            instruments,
            testnet,
        } => {
            let env = if *testnet { "TESTNET" } else { "MAINNET" };
            format!(
                "\u{1F680} <b>Bot Started</b>\n\n\
                 Environment: <b>{}</b>\n\
                 Instruments: <code>{}</code>",
                env,
                instruments.join(", "),
            )
        }
    }
}
