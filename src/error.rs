use thiserror::Error;

use crate::core::Chain;

pub type Result<T> = std::result::Result<T, WhaleError>;

/// All failure modes surfaced by whalecli.
///
/// Each variant maps to a stable `error_code` (used in JSON output and
/// `stream_error` events) and a CLI exit code grouped by category.
#[derive(Debug, Error)]
pub enum WhaleError {
    // API (exit 2)
    #[error("{service} API key is invalid or missing")]
    InvalidApiKey { service: &'static str },
    #[error("{service} rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimited {
        service: &'static str,
        retry_after_secs: u64,
    },
    #[error("{service} API error: {message}")]
    Api {
        service: &'static str,
        message: String,
    },

    // Network (exit 3)
    #[error("request timed out: {0}")]
    NetworkTimeout(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // Data (exit 4)
    #[error("invalid {chain} address: {address}")]
    InvalidAddress { chain: Chain, address: String },
    #[error("wallet {address} not found on {chain}")]
    WalletNotFound { chain: Chain, address: String },
    #[error("wallet {address} on {chain} is already tracked")]
    WalletExists { chain: Chain, address: String },
    #[error("no wallets tracked; add wallets with `whalecli wallet add`")]
    NoWallets,
    #[error("{0}")]
    InvalidInput(String),

    // Config (exit 5)
    #[error("config error: {0}")]
    Config(String),

    // Storage (exit 6)
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl WhaleError {
    pub fn error_code(&self) -> &'static str {
        match self {
            WhaleError::InvalidApiKey { .. } => "invalid_api_key",
            WhaleError::RateLimited { .. } => "rate_limited",
            WhaleError::Api { .. } => "api_error",
            WhaleError::NetworkTimeout(_) => "network_timeout",
            WhaleError::ConnectionFailed(_) => "connection_failed",
            WhaleError::InvalidAddress { .. } => "invalid_address",
            WhaleError::WalletNotFound { .. } => "wallet_not_found",
            WhaleError::WalletExists { .. } => "wallet_exists",
            WhaleError::NoWallets => "no_wallets",
            WhaleError::InvalidInput(_) => "data_error",
            WhaleError::Config(_) => "config_error",
            WhaleError::Storage(_) => "db_error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            WhaleError::InvalidApiKey { .. }
            | WhaleError::RateLimited { .. }
            | WhaleError::Api { .. } => 2,
            WhaleError::NetworkTimeout(_) | WhaleError::ConnectionFailed(_) => 3,
            WhaleError::InvalidAddress { .. }
            | WhaleError::WalletNotFound { .. }
            | WhaleError::WalletExists { .. }
            | WhaleError::NoWallets
            | WhaleError::InvalidInput(_) => 4,
            WhaleError::Config(_) => 5,
            WhaleError::Storage(_) => 6,
        }
    }

    /// Classify a transport error from an upstream HTTP call.
    pub fn from_http(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WhaleError::NetworkTimeout(format!("{service}: {err}"))
        } else if err.is_connect() {
            WhaleError::ConnectionFailed(format!("{service}: {err}"))
        } else {
            WhaleError::Api {
                service,
                message: err.to_string(),
            }
        }
    }
}
