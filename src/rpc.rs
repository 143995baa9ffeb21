// src/rpc.rs
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use ethers::prelude::*;
use ethers::utils::{format_units, parse_units};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use tracing::{debug, error, info, warn};

use crate::builder::GasOverrides;
use crate::config::TokenConfig;
use crate::error::RelayerError;
use crate::history::{next_local_midnight, HistoryStore};
use crate::relayer::RelayerService;
use crate::sdk::{AccountClient, OperationStatus};
use crate::types::{
    AaWalletInfo, BalanceResponse, HealthResponse, HistoryEntry, HistoryResponse, LimitsResponse,
    SupportedTokens, TokenInfo, TransferRecord, TransferResponse,
};
use crate::verifier::{sign_authorization, Eip3009Verifier};

#[rpc(server, namespace = "relayer")]
pub trait RelayerApi {
    #[method(name = "health")]
    async fn health(&self) -> RpcResult<HealthResponse>;

    #[method(name = "supportedTokens")]
    async fn supported_tokens(&self) -> RpcResult<SupportedTokens>;

    /// Token balance of `address`, or of the configured user wallet.
    #[method(name = "balance")]
    async fn balance(&self, address: Option<Address>) -> RpcResult<BalanceResponse>;

    /// Signs a transfer authorization with the user wallet and relays it.
    #[method(name = "transfer")]
    async fn transfer(&self, to: Address, amount: String) -> RpcResult<TransferResponse>;

    #[method(name = "aaWalletInfo")]
    async fn aa_wallet_info(&self) -> RpcResult<AaWalletInfo>;

    /// ERC-20 transfer from the smart account through the bundler.
    #[method(name = "aaWalletTransfer")]
    async fn aa_wallet_transfer(&self, to: Address, amount: String) -> RpcResult<TransferResponse>;

    #[method(name = "limits")]
    async fn limits(&self, address: Option<Address>) -> RpcResult<LimitsResponse>;

    #[method(name = "history")]
    async fn history(&self, address: Option<Address>) -> RpcResult<HistoryResponse>;
}

pub struct RelayerRpcImpl<M = Provider<Http>> {
    relayer: Arc<RelayerService>,
    verifier: Eip3009Verifier,
    history: Arc<HistoryStore>,
    token: TokenConfig,
    user_wallet: Option<LocalWallet>,
    account: Option<Arc<AccountClient<M>>>,
}

impl<M: Middleware + 'static> RelayerRpcImpl<M> {
    pub fn new(
        relayer: Arc<RelayerService>,
        verifier: Eip3009Verifier,
        history: Arc<HistoryStore>,
        token: TokenConfig,
    ) -> Self {
        Self {
            relayer,
            verifier,
            history,
            token,
            user_wallet: None,
            account: None,
        }
    }

    pub fn with_user_wallet(mut self, wallet: LocalWallet) -> Self {
        self.user_wallet = Some(wallet);
        self
    }

    pub fn with_account(mut self, account: Arc<AccountClient<M>>) -> Self {
        self.account = Some(account);
        self
    }

    fn user_wallet(&self) -> RpcResult<&LocalWallet> {
        self.user_wallet
            .as_ref()
            .ok_or_else(|| rpc_error("USER_PRIVATE_KEY not configured"))
    }

    fn account(&self) -> RpcResult<&AccountClient<M>> {
        self.account
            .as_deref()
            .ok_or_else(|| rpc_error("AA wallet not configured"))
    }

    fn default_address(&self, address: Option<Address>) -> Option<Address> {
        address.or_else(|| self.user_wallet.as_ref().map(|w| w.address()))
    }

    fn token_info(&self) -> TokenInfo {
        TokenInfo {
            address: self.token.address,
            balance_threshold: self.token.balance_threshold.to_string(),
            decimals: self.token.decimals,
            eip712_name: self.token.eip712_name.clone(),
            eip712_version: self.token.eip712_version.clone(),
            minimum_transfer_amount: self.token.minimum_transfer_amount.to_string(),
            name: self.token.name.clone(),
            symbol: self.token.symbol.clone(),
        }
    }

    fn history_entry(&self, record: TransferRecord) -> HistoryEntry {
        HistoryEntry {
            tx_hash: record.tx_hash,
            amount: format_amount(record.amount, self.token.decimals),
            date: Utc
                .timestamp_millis_opt(record.timestamp)
                .single()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default(),
            to: record.recipient,
            from: record.address,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> RelayerApiServer for RelayerRpcImpl<M> {
    async fn health(&self) -> RpcResult<HealthResponse> {
        Ok(HealthResponse {
            status: "ok".to_string(),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    async fn supported_tokens(&self) -> RpcResult<SupportedTokens> {
        Ok(SupportedTokens {
            testnet: vec![self.token_info()],
            mainnet: vec![],
        })
    }

    async fn balance(&self, address: Option<Address>) -> RpcResult<BalanceResponse> {
        let address = self
            .default_address(address)
            .ok_or_else(|| rpc_error("No address available"))?;

        let balance = self.relayer.check_balance(address).await;
        let decimals = self.relayer.get_decimals().await;
        Ok(BalanceResponse {
            address,
            balance: format_amount(balance, decimals),
        })
    }

    async fn transfer(&self, to: Address, amount: String) -> RpcResult<TransferResponse> {
        let wallet = self.user_wallet()?;
        let from = wallet.address();
        if to.is_zero() {
            return Err(rpc_error("Recipient address required"));
        }

        let decimals = self.relayer.get_decimals().await;
        let value = parse_amount(&amount, decimals)?;
        debug!("Transfer request: {} ({} wei) from {:?} to {:?}", amount, value, from, to);

        let balance = self.relayer.check_balance(from).await;
        if balance < value {
            warn!("Insufficient balance for {:?}: {} < {}", from, balance, value);
            return Err(rpc_error(RelayerError::InsufficientBalance));
        }

        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let auth = sign_authorization(wallet, &self.verifier, to, value, now)
            .await
            .map_err(rpc_error)?;
        info!(
            "Authorization window [{}, {}], nonce {:?}",
            auth.valid_after, auth.valid_before, auth.nonce
        );

        if !self.verifier.verify(&auth) {
            error!("Locally signed authorization failed verification");
            return Err(rpc_error(RelayerError::SignatureVerificationFailed));
        }

        let tx_hash = self
            .relayer
            .execute_gasless_transfer(&auth)
            .await
            .map_err(|e| {
                error!("Transfer error: {}", e);
                rpc_error(e)
            })?;

        if let Err(e) = self.history.record_transfer(from, to, value, tx_hash).await {
            error!("Failed to update transfer history: {}", e);
        }

        Ok(TransferResponse {
            success: true,
            tx_hash,
            amount,
            to,
            from,
        })
    }

    async fn aa_wallet_info(&self) -> RpcResult<AaWalletInfo> {
        let account = self.account()?;
        let balance = account
            .get_erc20_balance(self.token.address)
            .await
            .map_err(rpc_error)?;
        let decimals = self.relayer.get_decimals().await;

        Ok(AaWalletInfo {
            address: account.account_address(),
            balance: format_amount(balance, decimals),
            decimals,
        })
    }

    async fn aa_wallet_transfer(&self, to: Address, amount: String) -> RpcResult<TransferResponse> {
        let account = self.account()?;
        let owner = self.user_wallet()?;
        if to.is_zero() {
            return Err(rpc_error("Recipient address required"));
        }

        let decimals = self.relayer.get_decimals().await;
        let value = parse_amount(&amount, decimals)?;

        let outcome = account
            .send_erc20(self.token.address, to, value, owner, &GasOverrides::default())
            .await
            .map_err(|e| {
                error!("AA wallet transfer error: {}", e);
                rpc_error(e)
            })?;

        if outcome.status == OperationStatus::Failed {
            return Err(rpc_error(format!(
                "UserOperation {:?} failed in transaction {:?}",
                outcome.user_op_hash, outcome.transaction_hash
            )));
        }

        Ok(TransferResponse {
            success: true,
            tx_hash: outcome.transaction_hash,
            amount,
            to,
            from: account.account_address(),
        })
    }

    async fn limits(&self, address: Option<Address>) -> RpcResult<LimitsResponse> {
        let now = Local::now();
        let Some(address) = self.default_address(address) else {
            return Ok(LimitsResponse {
                count: 0,
                value: "0".to_string(),
                address: None,
                reset_time: iso_local(next_local_midnight(now)),
            });
        };

        let usage = self
            .history
            .daily_usage(address, now)
            .await
            .map_err(rpc_error)?;
        Ok(LimitsResponse {
            count: usage.count,
            value: format_amount(usage.value, self.token.decimals),
            address: Some(address),
            reset_time: iso_local(usage.reset_time),
        })
    }

    async fn history(&self, address: Option<Address>) -> RpcResult<HistoryResponse> {
        let address = self.default_address(address);
        let records = self.history.history(address).await.map_err(rpc_error)?;

        let history: Vec<_> = records.into_iter().map(|r| self.history_entry(r)).collect();
        Ok(HistoryResponse {
            total: history.len(),
            history,
            address,
        })
    }
}

fn rpc_error(e: impl Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32000, e.to_string(), None::<()>)
}

/// Parses a positive human-readable token amount into base units.
fn parse_amount(amount: &str, decimals: u8) -> RpcResult<U256> {
    let amount = amount.trim();
    if amount.starts_with('-') {
        return Err(rpc_error("Valid amount required"));
    }
    let value: U256 = parse_units(amount, u32::from(decimals))
        .map_err(|_| rpc_error("Valid amount required"))?
        .into();
    if value.is_zero() {
        return Err(rpc_error("Valid amount required"));
    }
    Ok(value)
}

/// Formats base units with `decimals` places, trimming trailing zeros but
/// keeping one fractional digit.
fn format_amount(value: U256, decimals: u8) -> String {
    let Ok(formatted) = format_units(value, u32::from(decimals)) else {
        return value.to_string();
    };
    if !formatted.contains('.') {
        return formatted;
    }
    let trimmed = formatted.trim_end_matches('0');
    if trimmed.ends_with('.') {
        format!("{trimmed}0")
    } else {
        trimmed.to_string()
    }
}

fn iso_local(t: DateTime<Local>) -> String {
    t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true)
}
