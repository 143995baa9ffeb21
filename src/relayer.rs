// src/relayer.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
use ethers::prelude::*;
use tracing::{error, info, warn};

use crate::config::RelayerConfig;
use crate::contracts::Eip3009Token;
use crate::error::{RelayerError, SubmitError};
use crate::types::TransferAuthorization;

pub const DEFAULT_DECIMALS: u8 = 18;

/// The token calls the relayer makes.
#[async_trait]
pub trait TokenClient: Send + Sync {
    async fn token_balance(&self, owner: Address) -> Result<U256, RelayerError>;

    async fn token_decimals(&self) -> Result<u8, RelayerError>;

    /// Sends `transferWithAuthorization` and waits for one confirmation.
    async fn submit_authorization(&self, auth: &TransferAuthorization) -> Result<H256, SubmitError>;
}

#[async_trait]
impl<M: Middleware + 'static> TokenClient for Eip3009Token<M> {
    async fn token_balance(&self, owner: Address) -> Result<U256, RelayerError> {
        self.balance_of(owner)
            .call()
            .await
            .map_err(|e| RelayerError::EthereumProviderError(e.to_string()))
    }

    async fn token_decimals(&self) -> Result<u8, RelayerError> {
        self.decimals()
            .call()
            .await
            .map_err(|e| RelayerError::EthereumProviderError(e.to_string()))
    }

    async fn submit_authorization(&self, auth: &TransferAuthorization) -> Result<H256, SubmitError> {
        let call = self.transfer_with_authorization(
            auth.from,
            auth.to,
            auth.value,
            auth.valid_after.into(),
            auth.valid_before.into(),
            auth.nonce.into(),
            auth.v,
            auth.r.into(),
            auth.s.into(),
        );

        // Sent through the middleware directly so the node's JSON-RPC error,
        // including a data-less revert message, reaches `submit_error`.
        let client = self.client();
        let pending = client
            .send_transaction(call.tx.clone(), None)
            .await
            .map_err(submit_error)?;
        let tx_hash = pending.tx_hash();
        info!("Relay transaction sent: {:?}", tx_hash);

        let receipt = pending
            .confirmations(1)
            .await
            .map_err(submit_error)?
            .ok_or_else(|| SubmitError::Other(format!("transaction {tx_hash:?} was dropped")))?;

        if receipt.status == Some(U64::zero()) {
            return Err(SubmitError::Reverted {
                reason: None,
                message: format!("transaction {tx_hash:?} reverted"),
            });
        }
        Ok(receipt.transaction_hash)
    }
}

/// Keeps the node's revert message next to any `Error(string)` reason decoded
/// from the revert data.
fn submit_error<E: MiddlewareError>(err: E) -> SubmitError {
    match err.as_error_response() {
        Some(rpc) if rpc.is_revert() => SubmitError::Reverted {
            reason: rpc.decode_revert_data::<String>(),
            message: rpc.message.clone(),
        },
        _ => SubmitError::Other(err.to_string()),
    }
}

/// Relays pre-signed EIP-3009 authorizations, paying gas from its own key.
pub struct RelayerService {
    token: Arc<dyn TokenClient>,
}

impl RelayerService {
    pub fn new(token: Arc<dyn TokenClient>) -> Self {
        Self { token }
    }

    /// Connects a signing relayer to `config.rpc_url`.
    pub async fn connect(config: &RelayerConfig, relayer_key: &str) -> Result<Self, RelayerError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| RelayerError::EthereumProviderError(e.to_string()))?;
        let wallet = relayer_key
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::InvalidParameters(format!("relayer key: {e}")))?
            .with_chain_id(config.chain_id);

        info!(
            "Relayer {:?} serving token {:?} on chain {}",
            wallet.address(),
            config.token.address,
            config.chain_id
        );

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        Ok(Self::new(Arc::new(Eip3009Token::new(config.token.address, client))))
    }

    /// Token balance of `address`. Read failures are logged and reported as zero.
    pub async fn check_balance(&self, address: Address) -> U256 {
        match self.token.token_balance(address).await {
            Ok(balance) => balance,
            Err(e) => {
                error!("Error checking balance of {:?}: {}", address, e);
                U256::zero()
            }
        }
    }

    /// Token decimals, or 18 when the call fails.
    pub async fn get_decimals(&self) -> u8 {
        match self.token.token_decimals().await {
            Ok(decimals) => decimals,
            Err(e) => {
                warn!("Error getting decimals, using {}: {}", DEFAULT_DECIMALS, e);
                DEFAULT_DECIMALS
            }
        }
    }

    pub async fn execute_gasless_transfer(&self, auth: &TransferAuthorization) -> Result<H256, RelayerError> {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        self.execute_gasless_transfer_at(auth, now).await
    }

    /// Relays `auth` as of unix time `now`. Nothing is sent when `now` falls
    /// outside the authorization's window.
    pub async fn execute_gasless_transfer_at(
        &self,
        auth: &TransferAuthorization,
        now: u64,
    ) -> Result<H256, RelayerError> {
        check_window(auth, now)?;

        info!(
            "Relaying transfer of {} from {:?} to {:?}",
            auth.value, auth.from, auth.to
        );

        match self.token.submit_authorization(auth).await {
            Ok(tx_hash) => {
                info!("Transfer confirmed in {:?}", tx_hash);
                Ok(tx_hash)
            }
            Err(e) => {
                error!("Relay failed: {}", e);
                Err(classify(e))
            }
        }
    }
}

/// Fails unless `valid_after <= now <= valid_before`.
pub fn check_window(auth: &TransferAuthorization, now: u64) -> Result<(), RelayerError> {
    if now < auth.valid_after {
        return Err(RelayerError::NotYetValid(iso_time(auth.valid_after)));
    }
    if now > auth.valid_before {
        return Err(RelayerError::Expired {
            expired_at: iso_time(auth.valid_before),
            now: iso_time(now),
        });
    }
    Ok(())
}

fn classify(err: SubmitError) -> RelayerError {
    match err {
        SubmitError::Reverted { reason, message } => {
            let reason = reason.unwrap_or(message);
            if reason.contains("expired") {
                RelayerError::AuthorizationExpired
            } else {
                RelayerError::Reverted(reason)
            }
        }
        SubmitError::Other(message) => RelayerError::Failed(message),
    }
}

fn iso_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory token with scripted answers.
    pub(crate) struct MockToken {
        pub(crate) balance: Option<U256>,
        pub(crate) decimals: Option<u8>,
        outcome: Mutex<Option<SubmitError>>,
        submissions: AtomicUsize,
    }

    impl MockToken {
        pub(crate) fn new(balance: u64) -> Self {
            Self {
                balance: Some(balance.into()),
                decimals: Some(18),
                outcome: Mutex::new(None),
                submissions: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing_with(self, err: SubmitError) -> Self {
            *self.outcome.lock().unwrap() = Some(err);
            self
        }

        pub(crate) fn submissions(&self) -> usize {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn relayed_tx_hash() -> H256 {
        H256::repeat_byte(0xcc)
    }

    #[async_trait]
    impl TokenClient for MockToken {
        async fn token_balance(&self, _owner: Address) -> Result<U256, RelayerError> {
            self.balance
                .ok_or_else(|| RelayerError::EthereumProviderError("call reverted".into()))
        }

        async fn token_decimals(&self) -> Result<u8, RelayerError> {
            self.decimals
                .ok_or_else(|| RelayerError::EthereumProviderError("call reverted".into()))
        }

        async fn submit_authorization(&self, _auth: &TransferAuthorization) -> Result<H256, SubmitError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            match self.outcome.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(relayed_tx_hash()),
            }
        }
    }
}
