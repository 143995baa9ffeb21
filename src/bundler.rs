// src/bundler.rs
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PollConfig;
use crate::error::BundlerError;
use crate::types::{
    UserOperation, UserOperationByHash, UserOperationGasEstimation, UserOperationReceipt,
};

/// Placeholder ECDSA signature (65 bytes, r || s || v) used for gas estimation.
/// Must stay the same length as the account's real signatures or the
/// pre-verification estimate comes out low.
pub const DUMMY_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// A JSON-RPC quantity. Parses from `0x` hex or decimal, always prints minimal `0x` hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quantity(pub U256);

impl From<U256> for Quantity {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<Quantity> for U256 {
    fn from(value: Quantity) -> Self {
        value.0
    }
}

impl FromStr for Quantity {
    type Err = BundlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Some(U256::zero()),
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None => U256::from_dec_str(s).ok(),
        };
        parsed
            .map(Self)
            .ok_or_else(|| BundlerError::InvalidQuantity(s.to_string()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Self::from(n)),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A user operation as bundlers expect it on the wire: every numeric field a hex quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    pub sender: Address,
    pub nonce: Quantity,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: Quantity,
    pub verification_gas_limit: Quantity,
    pub pre_verification_gas: Quantity,
    pub max_fee_per_gas: Quantity,
    pub max_priority_fee_per_gas: Quantity,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl From<&UserOperation> for RpcUserOperation {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce.into(),
            init_code: op.init_code.clone(),
            call_data: op.call_data.clone(),
            call_gas_limit: op.call_gas_limit.into(),
            verification_gas_limit: op.verification_gas_limit.into(),
            pre_verification_gas: op.pre_verification_gas.into(),
            max_fee_per_gas: op.max_fee_per_gas.into(),
            max_priority_fee_per_gas: op.max_priority_fee_per_gas.into(),
            paymaster_and_data: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

/// Moves one JSON-RPC envelope to the bundler and back.
#[async_trait]
pub trait BundlerTransport: Send + Sync {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, BundlerError>;
}

/// JSON-RPC over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl BundlerTransport for HttpTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, BundlerError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| BundlerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BundlerError::Transport(format!(
                "HTTP error! status: {}",
                response.status()
            )));
        }

        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| BundlerError::Decode(e.to_string()))
    }
}

/// JSON-RPC written straight onto a TCP socket as an HTTP/1.0 POST. Only
/// plain `http://` endpoints are reachable this way.
pub struct RawHttpTransport {
    url: Url,
}

impl RawHttpTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl BundlerTransport for RawHttpTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, BundlerError> {
        if self.url.scheme() != "http" {
            return Err(BundlerError::Transport(format!(
                "raw transport cannot reach {} endpoints",
                self.url.scheme()
            )));
        }
        let host = self
            .url
            .host_str()
            .ok_or_else(|| BundlerError::Transport(format!("no host in {}", self.url)))?;
        let port = self.url.port_or_known_default().unwrap_or(80);

        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host_header = match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let body = serde_json::to_vec(request).map_err(|e| BundlerError::Decode(e.to_string()))?;
        let mut message = format!(
            "POST {path} HTTP/1.0\r\nHost: {host_header}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        message.extend_from_slice(&body);

        let transport = |e: std::io::Error| BundlerError::Transport(e.to_string());
        let mut stream = TcpStream::connect((host, port)).await.map_err(transport)?;
        stream.write_all(&message).await.map_err(transport)?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.map_err(transport)?;

        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| BundlerError::Decode("malformed HTTP response".to_string()))?;

        let head = String::from_utf8_lossy(&raw[..split]);
        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| BundlerError::Decode("malformed HTTP status line".to_string()))?;
        if !(200..300).contains(&status) {
            return Err(BundlerError::Transport(format!("HTTP error! status: {status}")));
        }

        serde_json::from_slice(&raw[split + 4..]).map_err(|e| BundlerError::Decode(e.to_string()))
    }
}

/// Tries `primary`; if it fails before a JSON-RPC envelope comes back, re-issues
/// the same request on `fallback`. When both fail the primary's error is returned.
pub struct FallbackTransport {
    primary: Box<dyn BundlerTransport>,
    fallback: Option<Box<dyn BundlerTransport>>,
}

impl FallbackTransport {
    pub fn new(primary: Box<dyn BundlerTransport>, fallback: Box<dyn BundlerTransport>) -> Self {
        Self {
            primary,
            fallback: Some(fallback),
        }
    }

    pub fn primary_only(primary: Box<dyn BundlerTransport>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    /// reqwest first, raw socket second. The raw socket only speaks plain
    /// `http://`, so other schemes get no fallback.
    pub fn http(url: Url) -> Self {
        let primary = Box::new(HttpTransport::new(url.clone()));
        if url.scheme() == "http" {
            Self::new(primary, Box::new(RawHttpTransport::new(url)))
        } else {
            Self::primary_only(primary)
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

#[async_trait]
impl BundlerTransport for FallbackTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, BundlerError> {
        let err = match self.primary.send(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        let Some(fallback) = &self.fallback else {
            return Err(err);
        };

        warn!("{} failed on primary transport ({}), retrying on fallback", request.method, err);
        match fallback.send(request).await {
            Ok(response) => Ok(response),
            Err(fallback_err) => {
                warn!("{} failed on fallback transport: {}", request.method, fallback_err);
                Err(err)
            }
        }
    }
}

/// ERC-4337 bundler JSON-RPC client.
pub struct BundlerClient {
    transport: Arc<dyn BundlerTransport>,
    poll: PollConfig,
    next_id: AtomicU64,
}

impl BundlerClient {
    pub fn new(bundler_url: &str) -> Result<Self, BundlerError> {
        let url = Url::parse(bundler_url)
            .map_err(|e| BundlerError::Transport(format!("invalid bundler url {bundler_url}: {e}")))?;
        Ok(Self::with_transport(Arc::new(FallbackTransport::http(url))))
    }

    pub fn with_transport(transport: Arc<dyn BundlerTransport>) -> Self {
        Self {
            transport,
            poll: PollConfig::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    async fn request<P, R>(&self, method: &str, params: P) -> Result<R, BundlerError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(|e| BundlerError::Decode(e.to_string()))?,
        };
        debug!("Bundler request {} (id {})", method, request.id);

        let response = self.transport.send(&request).await?;
        if let Some(error) = response.error {
            return Err(BundlerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| BundlerError::Decode(format!("{method}: {e}")))
    }

    /// `eth_sendUserOperation`; returns the bundler-assigned operation hash.
    pub async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256, BundlerError> {
        let hash: H256 = self
            .request("eth_sendUserOperation", (RpcUserOperation::from(op), entry_point))
            .await?;
        info!("UserOperation from {:?} accepted by bundler: {:?}", op.sender, hash);
        Ok(hash)
    }

    /// `eth_estimateUserOperationGas` with [`DUMMY_SIGNATURE`] in place of the real one.
    pub async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<UserOperationGasEstimation, BundlerError> {
        let mut wire = RpcUserOperation::from(op);
        wire.signature = dummy_signature();
        self.request("eth_estimateUserOperationGas", (wire, entry_point))
            .await
    }

    /// `None` until the operation is mined.
    pub async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationReceipt>, BundlerError> {
        self.request("eth_getUserOperationReceipt", [hash]).await
    }

    pub async fn get_user_operation_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<UserOperationByHash>, BundlerError> {
        self.request("eth_getUserOperationByHash", [hash]).await
    }

    pub async fn supported_entry_points(&self) -> Result<Vec<Address>, BundlerError> {
        self.request("eth_supportedEntryPoints", Vec::<Value>::new())
            .await
    }

    /// Polls with the client's [`PollConfig`].
    pub async fn wait_for_user_operation(
        &self,
        hash: H256,
    ) -> Result<UserOperationReceipt, BundlerError> {
        self.wait_for_user_operation_with(hash, self.poll).await
    }

    /// Polls `eth_getUserOperationReceipt` every `poll.interval` until a receipt
    /// shows up or `poll.timeout` has elapsed.
    pub async fn wait_for_user_operation_with(
        &self,
        hash: H256,
        poll: PollConfig,
    ) -> Result<UserOperationReceipt, BundlerError> {
        let start = Instant::now();
        let mut attempts = 0u32;

        while start.elapsed() < poll.timeout {
            attempts += 1;
            if let Some(receipt) = self.get_user_operation_receipt(hash).await? {
                info!(
                    "UserOperation {:?} mined in tx {:?} after {} polls",
                    hash, receipt.receipt.transaction_hash, attempts
                );
                return Ok(receipt);
            }
            sleep(poll.interval).await;
        }

        warn!("Gave up on UserOperation {:?} after {} polls", hash, attempts);
        Err(BundlerError::Timeout(hash))
    }
}

fn dummy_signature() -> Bytes {
    DUMMY_SIGNATURE.parse().unwrap_or_default()
}
