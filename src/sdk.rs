// src/sdk.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::*;
use tracing::{debug, info};

use crate::builder::{BatchRequest, CallRequest, GasOverrides, UserOpBuilder};
use crate::bundler::BundlerClient;
use crate::config::SdkConfig;
use crate::contracts::{encode_erc20_approve, encode_erc20_transfer, EntryPoint, Eip3009Token};
use crate::error::BuilderError;
use crate::types::{UserOperation, UserOperationGasEstimation, UserOperationReceipt};

/// Produces the account owner's signature over a user operation hash.
#[async_trait]
pub trait UserOpSigner: Send + Sync {
    async fn sign_user_op_hash(&self, hash: H256) -> Result<Bytes, BuilderError>;
}

/// EIP-191 personal signature over the 32 hash bytes, as SimpleAccount-style
/// accounts expect.
#[async_trait]
impl UserOpSigner for LocalWallet {
    async fn sign_user_op_hash(&self, hash: H256) -> Result<Bytes, BuilderError> {
        let signature = self
            .sign_message(hash.as_bytes())
            .await
            .map_err(|e| BuilderError::Signing(e.to_string()))?;
        Ok(signature.to_vec().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    Failed,
}

/// What a mined user operation did.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub status: OperationStatus,
    pub transaction_hash: H256,
    pub user_op_hash: H256,
    pub receipt: UserOperationReceipt,
}

impl From<UserOperationReceipt> for OperationOutcome {
    fn from(receipt: UserOperationReceipt) -> Self {
        Self {
            status: if receipt.success {
                OperationStatus::Success
            } else {
                OperationStatus::Failed
            },
            transaction_hash: receipt.receipt.transaction_hash,
            user_op_hash: receipt.user_op_hash,
            receipt,
        }
    }
}

/// Drives one smart account: build, hash, sign, submit, wait.
pub struct AccountClient<M> {
    config: SdkConfig,
    provider: Arc<M>,
    builder: UserOpBuilder,
    bundler: BundlerClient,
}

impl AccountClient<Provider<Http>> {
    pub fn new(config: SdkConfig) -> Result<Self, BuilderError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| BuilderError::EthereumProviderError(e.to_string()))?;
        let provider = Arc::new(provider);

        let entry_point = Arc::new(EntryPoint::new(config.entry_point, provider.clone()));
        let builder = UserOpBuilder::new(
            entry_point,
            config.account,
            config.entry_point,
            config.chain_id,
        );
        let bundler = BundlerClient::new(&config.bundler_url)?;

        info!(
            "Initialized account client for {:?} (entry point {:?}, chain {})",
            config.account, config.entry_point, config.chain_id
        );

        Ok(Self::from_parts(config, provider, builder, bundler))
    }
}

impl<M: Middleware + 'static> AccountClient<M> {
    pub fn from_parts(
        config: SdkConfig,
        provider: Arc<M>,
        builder: UserOpBuilder,
        bundler: BundlerClient,
    ) -> Self {
        Self {
            config,
            provider,
            builder,
            bundler,
        }
    }

    pub fn account_address(&self) -> Address {
        self.config.account
    }

    pub fn builder(&self) -> &UserOpBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut UserOpBuilder {
        &mut self.builder
    }

    pub fn bundler(&self) -> &BundlerClient {
        &self.bundler
    }

    pub async fn send_user_operation_and_wait<S: UserOpSigner + ?Sized>(
        &self,
        request: &CallRequest,
        signer: &S,
        overrides: &GasOverrides,
    ) -> Result<OperationOutcome, BuilderError> {
        let op = self.builder.build_operation(request, overrides).await?;
        self.sign_and_submit(op, signer).await
    }

    pub async fn send_batch_user_operation_and_wait<S: UserOpSigner + ?Sized>(
        &self,
        request: &BatchRequest,
        signer: &S,
        overrides: &GasOverrides,
    ) -> Result<OperationOutcome, BuilderError> {
        let op = self.builder.build_batch_operation(request, overrides).await?;
        self.sign_and_submit(op, signer).await
    }

    /// ERC-20 `transfer` executed by the account.
    pub async fn send_erc20<S: UserOpSigner + ?Sized>(
        &self,
        token: Address,
        recipient: Address,
        amount: U256,
        signer: &S,
        overrides: &GasOverrides,
    ) -> Result<OperationOutcome, BuilderError> {
        let request = CallRequest {
            target: token,
            value: U256::zero(),
            call_data: encode_erc20_transfer(recipient, amount),
        };
        self.send_user_operation_and_wait(&request, signer, overrides)
            .await
    }

    /// ERC-20 `approve` executed by the account.
    pub async fn approve_erc20<S: UserOpSigner + ?Sized>(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
        signer: &S,
        overrides: &GasOverrides,
    ) -> Result<OperationOutcome, BuilderError> {
        let request = CallRequest {
            target: token,
            value: U256::zero(),
            call_data: encode_erc20_approve(spender, amount),
        };
        self.send_user_operation_and_wait(&request, signer, overrides)
            .await
    }

    pub async fn get_nonce(&self, key: U256) -> Result<U256, BuilderError> {
        self.builder.get_nonce(key).await
    }

    /// Native balance of the account, in wei.
    pub async fn get_balance(&self) -> Result<U256, BuilderError> {
        self.provider
            .get_balance(self.config.account, None)
            .await
            .map_err(|e| BuilderError::EthereumProviderError(e.to_string()))
    }

    pub async fn get_erc20_balance(&self, token: Address) -> Result<U256, BuilderError> {
        Eip3009Token::new(token, self.provider.clone())
            .balance_of(self.config.account)
            .call()
            .await
            .map_err(|e| BuilderError::EthereumProviderError(e.to_string()))
    }

    pub async fn estimate_user_operation_gas(
        &self,
        request: &CallRequest,
        overrides: &GasOverrides,
    ) -> Result<UserOperationGasEstimation, BuilderError> {
        let op = self.builder.build_operation(request, overrides).await?;
        Ok(self
            .bundler
            .estimate_user_operation_gas(&op, self.config.entry_point)
            .await?)
    }

    pub async fn supported_entry_points(&self) -> Result<Vec<Address>, BuilderError> {
        Ok(self.bundler.supported_entry_points().await?)
    }

    async fn sign_and_submit<S: UserOpSigner + ?Sized>(
        &self,
        mut op: UserOperation,
        signer: &S,
    ) -> Result<OperationOutcome, BuilderError> {
        let hash = self.builder.hash_operation(&op).await;
        debug!("Signing UserOperation hash {:?}", hash);
        op.signature = signer.sign_user_op_hash(hash).await?;

        let bundler_hash = self
            .bundler
            .send_user_operation(&op, self.config.entry_point)
            .await?;
        let receipt = self.bundler.wait_for_user_operation(bundler_hash).await?;
        let outcome = OperationOutcome::from(receipt);
        info!(
            "UserOperation {:?} finished with {:?} in tx {:?}",
            bundler_hash, outcome.status, outcome.transaction_hash
        );
        Ok(outcome)
    }
}
