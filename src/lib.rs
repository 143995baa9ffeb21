// src/lib.rs
pub mod builder;
pub mod bundler;
pub mod config;
pub mod contracts;
pub mod error;
pub mod history;
pub mod relayer;
pub mod rpc;
pub mod sdk;
pub mod types;
pub mod verifier;

pub use builder::{BatchRequest, CallRequest, GasOverrides, HashStrategy, UserOpBuilder};
pub use bundler::BundlerClient;
pub use config::{PollConfig, RelayerConfig, SdkConfig, TokenConfig};
pub use error::{BuilderError, BundlerError, HistoryError, RelayerError};
pub use history::HistoryStore;
pub use relayer::RelayerService;
pub use sdk::{AccountClient, OperationOutcome, OperationStatus, UserOpSigner};
pub use types::{TransferAuthorization, UserOperation, UserOperationReceipt};
pub use verifier::Eip3009Verifier;
