//! Error taxonomy surfaced by trade and trust operations
use super::trade::TradeStatus;

/// Stable, transport-independent discriminant for a [`TradeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unauthorized,
    InvalidTransition,
    Expired,
    NotFound,
    Validation,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::Expired => "EXPIRED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Conventional HTTP status used by the route layer.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 403,
            ErrorCode::InvalidTransition => 400,
            ErrorCode::Expired => 410,
            ErrorCode::NotFound => 404,
            ErrorCode::Validation => 422,
            ErrorCode::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TradeError {
    #[error("user {actor} is not permitted to act on trade {trade_id}")]
    Unauthorized { trade_id: String, actor: String },
    #[error("invalid transition from {from}: {reason}")]
    InvalidTransition { from: TradeStatus, reason: String },
    #[error("trade {trade_id} expired while {status}")]
    Expired { trade_id: String, status: TradeStatus },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("cards not found: {}", .0.join(", "))]
    MissingCards(Vec<String>),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encoding(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl TradeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TradeError::Unauthorized { .. } => ErrorCode::Unauthorized,
            TradeError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            TradeError::Expired { .. } => ErrorCode::Expired,
            TradeError::NotFound { .. } | TradeError::MissingCards(_) => ErrorCode::NotFound,
            TradeError::Validation(_) => ErrorCode::Validation,
            TradeError::Storage(_) | TradeError::Encoding(_) | TradeError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    pub(crate) fn invalid(from: TradeStatus, reason: impl Into<String>) -> Self {
        TradeError::InvalidTransition {
            from,
            reason: reason.into(),
        }
    }

    pub(crate) fn unauthorized(trade_id: &str, actor: &str) -> Self {
        TradeError::Unauthorized {
            trade_id: trade_id.to_string(),
            actor: actor.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        TradeError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for TradeError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        TradeError::Encoding(value.to_string())
    }
}

impl From<minicbor::decode::Error> for TradeError {
    fn from(value: minicbor::decode::Error) -> Self {
        TradeError::Encoding(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TradeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_distinct_statuses() {
        let unauthorized = TradeError::unauthorized("trade1", "user1");
        let invalid = TradeError::invalid(TradeStatus::Completed, "terminal");
        let expired = TradeError::Expired {
            trade_id: "trade1".into(),
            status: TradeStatus::Proposed,
        };

        assert_eq!(unauthorized.http_status(), 403);
        assert_eq!(invalid.http_status(), 400);
        assert_eq!(expired.http_status(), 410);
        assert_eq!(TradeError::not_found("trade", "x").http_status(), 404);
        assert_eq!(expired.code().as_str(), "EXPIRED");
    }

    #[test]
    fn missing_cards_lists_every_id() {
        let err = TradeError::MissingCards(vec!["card_a".into(), "card_b".into()]);
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.to_string(), "cards not found: card_a, card_b");
    }

    #[test]
    fn internal_failures_keep_their_own_message() {
        let err = TradeError::Internal("invalid hrp".into());
        assert_eq!(err.http_status(), 500);
        assert_eq!(err.to_string(), "internal failure: invalid hrp");
    }
}
