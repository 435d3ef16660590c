pub mod config;
pub mod connection;
pub mod dispatch;
pub mod ipc;
pub mod queue;
pub mod rate_limit;
pub mod supervisor;
pub mod token_store;

pub use config::ConfigError;
pub use connection::ConnectionError;
pub use dispatch::{DispatchError, HandlerError};
pub use ipc::IpcError;
pub use queue::QueueError;
pub use rate_limit::RateLimitError;
pub use supervisor::SupervisorError;
pub use token_store::{TokenFormatFailure, TokenStoreError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),
}
