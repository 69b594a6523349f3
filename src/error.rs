use thiserror::Error;

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Everything the session layer can fail with.
///
/// None of these are fatal: after any of them the session is either
/// unchanged or back in `Disconnected`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("No wallet provider available")]
    ProviderUnavailable,

    #[error("Wallet connection failed: {cause}")]
    ConnectionFailed { cause: String },

    #[error("Wallet is not connected")]
    NotConnected,

    #[error("Transaction was rejected in the wallet")]
    TransactionRejected,

    #[error("Transaction reverted: {reason}")]
    TransactionReverted { reason: String },

    #[error("Timed out waiting for transaction confirmation")]
    TransactionTimeout,

    #[error("Transaction failed: {cause}")]
    TransactionFailed { cause: String },

    #[error("Contract query failed: {cause}")]
    QueryFailed { cause: String },

    /// The result belongs to a session that has since been torn down.
    #[error("Result belongs to a previous session")]
    StaleSession,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Preferences error: {0}")]
    Preferences(String),
}

impl SessionError {
    /// Whether the error should ever be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, SessionError::StaleSession)
    }
}
