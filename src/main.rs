use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio::time::Duration;

use perpbot::api::PhemexClient;
use perpbot::config::AppConfig;
use perpbot::notifications::{AlertEvent, Notifier};
use perpbot::workflow::{TickOutcome, Workflow};

/// Hard ceiling for one instrument's workflow within a tick. A scheduler
/// invoking the bot every few minutes gets its slot back even if the
/// exchange hangs.
const INSTRUMENT_DEADLINE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .init();

    // Anything wrong with configuration is the only non-zero exit path.
    let config = AppConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        instruments = config.instruments.len(),
        testnet = config.testnet,
        "perpbot tick starting"
    );

    let client = Arc::new(
        PhemexClient::new(&config.api_key, &config.api_secret, config.testnet)
            .context("could not initialise exchange client")?,
    );
    let notifier = Arc::new(Notifier::new(
        config.telegram_bot_token.clone(),
        config.telegram_chat_id.clone(),
    ));

    if config.startup_alert {
        notifier
            .send(&AlertEvent::Started {
                instruments: config
                    .instruments
                    .iter()
                    .map(|i| format!("{} ({})", i.symbol, i.side.as_str()))
                    .collect(),
                testnet: config.testnet,
            })
            .await;
    }

    // One task per instrument; a failure or timeout in one never touches
    // the others. The adapter's rate limiter is the only shared state.
    let mut tasks = JoinSet::new();
    for instrument in config.instruments {
        let workflow = Workflow::new(client.clone(), notifier.clone());
        tasks.spawn(async move {
            let symbol = instrument.symbol.clone();
            match tokio::time::timeout(INSTRUMENT_DEADLINE, workflow.run(&instrument)).await {
                Ok(outcome) => outcome,
                Err(_) => TickOutcome::cancelled(&symbol),
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => emit_outcome(&outcome),
            Err(e) => tracing::error!(error = %e, "instrument task panicked"),
        }
    }

    tracing::info!("perpbot tick complete");
    Ok(())
}

/// One structured record per instrument, machine-parseable downstream.
fn emit_outcome(outcome: &TickOutcome) {
    match serde_json::to_string(outcome) {
        Ok(json) => tracing::info!(target: "perpbot::outcome", "{json}"),
        Err(e) => tracing::error!(error = %e, symbol = %outcome.symbol, "unserializable outcome"),
    }
}
