pub mod alert;
pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod evm;
pub mod gateway;
pub mod preferences;
pub mod projector;
pub mod types;
pub mod wallet_session;
pub mod wallets;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use context::{
    ConnectOutcome,
    ContextOptions,
    SessionContext,
    SubmitOutcome,
};
pub use error::{
    Result,
    SessionError,
};
