/// Decline-velocity classifier.
///
/// Martingale averaging only works when a drawdown is orderly. This module
/// scores how violently price is falling: a slow grind is safe to average
/// into, a crash is not. The score combines drop severity over a short
/// window, acceleration of the short window relative to the medium one,
/// and a volume surge component.
use crate::error::{BotError, Result};
use crate::models::Candle;

pub const ROC_SHORT_BARS: usize = 5;
pub const ROC_MEDIUM_BARS: usize = 15;
pub const ROC_LONG_BARS: usize = 30;
pub const VOLUME_BASELINE_BARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DeclineKind {
    Slow,
    Moderate,
    Fast,
    Crash,
}

impl DeclineKind {
    fn from_score(score: f64) -> Self {
        if score < 20.0 {
            DeclineKind::Slow
        } else if score < 40.0 {
            DeclineKind::Moderate
        } else if score < 70.0 {
            DeclineKind::Fast
        } else {
            DeclineKind::Crash
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineKind::Slow => "Slow",
            DeclineKind::Moderate => "Moderate",
            DeclineKind::Fast => "Fast",
            DeclineKind::Crash => "Crash",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeclineReport {
    /// Fractional rate of change over 5 bars.
    pub roc_short: f64,
    /// Fractional rate of change over 15 bars.
    pub roc_medium: f64,
    /// Fractional rate of change over 30 bars.
    pub roc_long: f64,
    /// roc_short / roc_medium when both are falling, else 1. Above 1 the
    /// decline is accelerating.
    pub smoothness: f64,
    /// Recent volume (5 bars) over baseline volume (30 bars).
    pub volume_ratio: f64,
    /// Composite score in [0, 100].
    pub velocity_score: f64,
    pub kind: DeclineKind,
}

impl DeclineReport {
    /// Fast declines and crashes block averaging and opening.
    pub fn is_dangerous(&self) -> bool {
        matches!(self.kind, DeclineKind::Fast | DeclineKind::Crash)
    }

    /// Only a slow decline relaxes the position ceiling.
    pub fn is_safe(&self) -> bool {
        self.kind == DeclineKind::Slow
    }
}

fn rate_of_change(closes: &[f64], bars: usize) -> Option<f64> {
    if closes.len() < bars + 1 {
        return None;
    }
    let current = closes[closes.len() - 1];
    let past = closes[closes.len() - 1 - bars];
    if past == 0.0 {
        return None;
    }
    Some((current - past) / past)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Build the decline report from recent candles (oldest first).
/// Needs `ROC_LONG_BARS + 1` candles.
pub fn decline_report(candles: &[Candle]) -> Result<DeclineReport> {
    let needed = ROC_LONG_BARS + 1;
    if candles.len() < needed {
        return Err(BotError::InsufficientData {
            needed,
            got: candles.len(),
        });
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let roc_short = rate_of_change(&closes, ROC_SHORT_BARS).unwrap_or(0.0);
    let roc_medium = rate_of_change(&closes, ROC_MEDIUM_BARS).unwrap_or(0.0);
    let roc_long = rate_of_change(&closes, ROC_LONG_BARS).unwrap_or(0.0);

    let smoothness = if roc_short < 0.0 && roc_medium < 0.0 {
        roc_short / roc_medium
    } else {
        1.0
    };

    let recent_volume = mean(&volumes[volumes.len() - ROC_SHORT_BARS..]);
    let baseline_volume = mean(&volumes[volumes.len() - VOLUME_BASELINE_BARS..]);
    let volume_ratio = if baseline_volume > 0.0 {
        recent_volume / baseline_volume
    } else {
        1.0
    };

    let severity = if roc_short < 0.0 {
        (roc_short.abs() * 2000.0).min(100.0)
    } else {
        0.0
    };

    let acceleration = if smoothness > 1.0 {
        (50.0 * smoothness.clamp(1.0, 4.0)).min(100.0)
    } else {
        0.0
    };

    let volume = if volume_ratio > 1.0 {
        ((volume_ratio - 1.0) * 30.0).min(30.0)
    } else {
        0.0
    };

    let velocity_score = (severity + acceleration + volume).min(100.0);

    Ok(DeclineReport {
        roc_short,
        roc_medium,
        roc_long,
        smoothness,
        volume_ratio,
        velocity_score,
        kind: DeclineKind::from_score(velocity_score),
    })
}
