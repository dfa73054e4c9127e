use thiserror::Error;

/// Reasons the exchange can reject an otherwise well-formed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    UnknownSymbol,
    InvalidQty,
    InvalidPrice,
    InvalidLeverage,
    PriceOutOfBand,
    /// Rejection with a code we have no specific handling for.
    Rejected,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::UnknownSymbol => "unknown symbol",
            ValidationKind::InvalidQty => "invalid quantity",
            ValidationKind::InvalidPrice => "invalid price",
            ValidationKind::InvalidLeverage => "invalid leverage",
            ValidationKind::PriceOutOfBand => "price out of band",
            ValidationKind::Rejected => "request rejected",
        }
    }
}

#[derive(Error, Debug)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("exchange rejected credentials: {0}")]
    Auth(String),

    /// Network timeouts, connection failures, 5xx and 429 responses.
    /// Retried inside the adapter; surfaced only once retries are exhausted.
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("{}: {message}", .kind.as_str())]
    Validation {
        kind: ValidationKind,
        message: String,
    },

    #[error("insufficient candle data: need {needed}, have {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("cancelled by deadline")]
    Cancelled,
}

impl BotError {
    /// Only transient transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::Transient(_))
    }

    /// Short tag used in alerts and outcome records.
    pub fn kind_label(&self) -> &'static str {
        match self {
            BotError::Config(_) => "config",
            BotError::Auth(_) => "auth",
            BotError::Transient(_) => "transient",
            BotError::Validation { .. } => "validation",
            BotError::InsufficientData { .. } => "insufficient_data",
            BotError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(BotError::Transient("timeout".into()).is_retryable());
        assert!(!BotError::Auth("bad key".into()).is_retryable());
        assert!(!BotError::Validation {
            kind: ValidationKind::InvalidQty,
            message: "qty too small".into()
        }
        .is_retryable());
        assert!(!BotError::Cancelled.is_retryable());
    }

    #[test]
    fn validation_message_includes_kind() {
        let err = BotError::Validation {
            kind: ValidationKind::PriceOutOfBand,
            message: "limit too far from mark".into(),
        };
        assert!(err.to_string().contains("price out of band"));
    }
}
