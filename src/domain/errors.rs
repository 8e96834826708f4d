use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Leaf components raise these; the HTTP layer maps them to a status code
/// exactly once (`api::response`). The risk evaluator never surfaces them to
/// clients — it logs and retries on the next tick.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("insufficient margin: required {required:.2} USDT, free {free:.2} USDT")]
    InsufficientMargin { required: f64, free: f64 },

    #[error("leverage {requested}x outside allowed range [1, {max}]")]
    InvalidLeverage { requested: u32, max: u32 },

    #[error("no usable price for {0}")]
    PriceUnavailable(String),

    #[error("challenge {0} is in a terminal state")]
    ChallengeTerminal(i64),

    #[error("invalid take-profit/stop-loss: {0}")]
    InvalidTpSl(String),

    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Validation failures from value-object constructors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("price must be non-negative and finite, got {0}")]
    InvalidPrice(f64),

    #[error("quantity must be positive and finite, got {0}")]
    InvalidQuantity(f64),
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}
