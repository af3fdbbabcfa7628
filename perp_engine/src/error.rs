/// error.rs — Engine error surface
///
/// Five failure kinds with different propagation policies (validation aborts
/// the run, strategy-API misuse only warns, `Bankruptcy` unwinds the main
/// loop into a terminal run status).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration or parameter outside its allowed domain.
    /// Pre-simulation this aborts the run; from the strategy API it is
    /// downgraded to a warning and `false`.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Bar or indicator access past the current cursor / end of data.
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    /// Required margin plus fee exceeds the available balance.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Inconsistent order state or a runaway after-chain; aborts the run.
    #[error("order failed: {0}")]
    OrderFailed(String),

    /// Wallet balance would go negative. Unwinds to the scheduler, which
    /// terminates the run keeping the trades filled so far.
    #[error("bankruptcy: {0}")]
    Bankruptcy(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }
}
