// src/error.rs
use ethers::types::H256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("Batch length mismatch: {0}")]
    LengthMismatch(String),

    #[error("Failed to get nonce from EntryPoint: {0}")]
    Nonce(String),

    #[error("EntryPoint getUserOpHash failed: {0}")]
    RemoteHash(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Bundler(#[from] BundlerError),

    #[error("Ethereum provider error: {0}")]
    EthereumProviderError(String),
}

#[derive(Error, Debug)]
pub enum BundlerError {
    #[error("Bundler error: {message}")]
    Rpc { code: i64, message: String },

    #[error("Bundler transport error: {0}")]
    Transport(String),

    #[error("Failed to parse response: {0}")]
    Decode(String),

    #[error("Timeout waiting for UserOperation {0:?}")]
    Timeout(H256),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),
}

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Authorization not yet valid. Valid after: {0}")]
    NotYetValid(String),

    #[error("Authorization expired at: {expired_at}. Current time: {now}")]
    Expired { expired_at: String, now: String },

    #[error("Transfer authorization has expired. Please try again with a fresh authorization.")]
    AuthorizationExpired,

    #[error("{0}")]
    Reverted(String),

    #[error("Transaction execution failed: {0}")]
    Failed(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Ethereum provider error: {0}")]
    EthereumProviderError(String),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History store is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid amount in history: {0}")]
    Amount(String),
}

/// How a relay submission failed on chain, before classification.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("execution reverted: {}", reason.as_deref().unwrap_or(message))]
    Reverted {
        reason: Option<String>,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}
