// src/builder.rs
use std::sync::Arc;

use ethers::abi::AbiEncode;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use tracing::{debug, info, warn};

use crate::contracts::{encode_execute, encode_execute_batch, EntryPointReader};
use crate::error::BuilderError;
use crate::types::{PackedUserOperation, UserOperation};

pub const DEFAULT_CALL_GAS_LIMIT: u64 = 100_000;
pub const DEFAULT_VERIFICATION_GAS_LIMIT: u64 = 100_000;
pub const DEFAULT_PRE_VERIFICATION_GAS: u64 = 50_000;
/// 1 gwei
pub const DEFAULT_FEE_PER_GAS: u64 = 1_000_000_000;

/// A single call executed through the smart account's `execute`.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub target: Address,
    pub value: U256,
    pub call_data: Bytes,
}

/// Parallel arrays executed through `executeBatch`. An empty `values` means
/// zero value for every target.
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub targets: Vec<Address>,
    pub values: Vec<U256>,
    pub call_datas: Vec<Bytes>,
}

/// Caller-supplied gas and fee fields; anything left `None` gets the default.
#[derive(Debug, Clone, Default)]
pub struct GasOverrides {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    /// Entry point nonce channel (uint192). Defaults to 0.
    pub nonce_key: Option<U256>,
}

/// How the operation hash is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStrategy {
    /// Ask the entry point's `getUserOpHash`, computing locally if the call fails.
    Remote,
    /// Compute locally, no network.
    Local,
}

/// Computes the ERC-4337 v0.6 user operation hash:
/// `keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))`.
pub fn user_operation_hash(op: &UserOperation, entry_point: Address, chain_id: u64) -> H256 {
    let packed = PackedUserOperation::from(op).encode();
    H256::from(keccak256(
        [
            keccak256(packed).to_vec(),
            entry_point.encode(),
            U256::from(chain_id).encode(),
        ]
        .concat(),
    ))
}

pub struct UserOpBuilder {
    reader: Arc<dyn EntryPointReader>,
    sender: Address,
    entry_point: Address,
    chain_id: u64,
    strategy: HashStrategy,
}

impl UserOpBuilder {
    pub fn new(
        reader: Arc<dyn EntryPointReader>,
        sender: Address,
        entry_point: Address,
        chain_id: u64,
    ) -> Self {
        Self {
            reader,
            sender,
            entry_point,
            chain_id,
            strategy: HashStrategy::Remote,
        }
    }

    pub fn with_hash_strategy(mut self, strategy: HashStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn hash_strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Picks `Remote` if the entry point answers `getUserOpHash` for a blank
    /// operation, `Local` otherwise.
    pub async fn probe_hash_strategy(&mut self) -> HashStrategy {
        let probe = UserOperation {
            sender: self.sender,
            ..Default::default()
        };
        self.strategy = match self.reader.user_op_hash(&probe).await {
            Ok(_) => HashStrategy::Remote,
            Err(e) => {
                info!("EntryPoint getUserOpHash unavailable, hashing locally: {}", e);
                HashStrategy::Local
            }
        };
        self.strategy
    }

    pub async fn get_nonce(&self, key: U256) -> Result<U256, BuilderError> {
        let nonce = self.reader.nonce(self.sender, key).await?;
        debug!("Nonce for {:?} (key {}): {}", self.sender, key, nonce);
        Ok(nonce)
    }

    /// Builds an unsigned operation that runs `execute(target, value, callData)`.
    pub async fn build_operation(
        &self,
        request: &CallRequest,
        overrides: &GasOverrides,
    ) -> Result<UserOperation, BuilderError> {
        let call_data = encode_execute(request.target, request.value, request.call_data.clone());
        let nonce = self.get_nonce(overrides.nonce_key.unwrap_or_default()).await?;

        Ok(self.assemble(nonce, call_data, overrides, 1))
    }

    /// Builds an unsigned operation that runs `executeBatch(targets, values, callDatas)`.
    /// Gas defaults are doubled.
    pub async fn build_batch_operation(
        &self,
        request: &BatchRequest,
        overrides: &GasOverrides,
    ) -> Result<UserOperation, BuilderError> {
        if request.targets.len() != request.call_datas.len() {
            return Err(BuilderError::LengthMismatch(format!(
                "{} targets but {} call datas",
                request.targets.len(),
                request.call_datas.len()
            )));
        }

        let values = if request.values.is_empty() {
            vec![U256::zero(); request.targets.len()]
        } else {
            request.values.clone()
        };
        if values.len() != request.targets.len() {
            return Err(BuilderError::LengthMismatch(format!(
                "{} targets but {} values",
                request.targets.len(),
                values.len()
            )));
        }

        let call_data = encode_execute_batch(
            request.targets.clone(),
            values,
            request.call_datas.clone(),
        );
        let nonce = self.get_nonce(overrides.nonce_key.unwrap_or_default()).await?;

        Ok(self.assemble(nonce, call_data, overrides, 2))
    }

    /// The hash the account owner signs.
    pub async fn hash_operation(&self, op: &UserOperation) -> H256 {
        match self.strategy {
            HashStrategy::Local => self.local_hash(op),
            HashStrategy::Remote => match self.reader.user_op_hash(op).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Falling back to local user operation hash: {}", e);
                    self.local_hash(op)
                }
            },
        }
    }

    pub fn local_hash(&self, op: &UserOperation) -> H256 {
        user_operation_hash(op, self.entry_point, self.chain_id)
    }

    fn assemble(
        &self,
        nonce: U256,
        call_data: Bytes,
        overrides: &GasOverrides,
        gas_multiplier: u64,
    ) -> UserOperation {
        let gas = |value: Option<U256>, default: u64| {
            value.unwrap_or_else(|| U256::from(default * gas_multiplier))
        };

        UserOperation {
            sender: self.sender,
            nonce,
            init_code: Bytes::default(),
            call_data,
            call_gas_limit: gas(overrides.call_gas_limit, DEFAULT_CALL_GAS_LIMIT),
            verification_gas_limit: gas(
                overrides.verification_gas_limit,
                DEFAULT_VERIFICATION_GAS_LIMIT,
            ),
            pre_verification_gas: gas(overrides.pre_verification_gas, DEFAULT_PRE_VERIFICATION_GAS),
            max_fee_per_gas: overrides
                .max_fee_per_gas
                .unwrap_or_else(|| U256::from(DEFAULT_FEE_PER_GAS)),
            max_priority_fee_per_gas: overrides
                .max_priority_fee_per_gas
                .unwrap_or_else(|| U256::from(DEFAULT_FEE_PER_GAS)),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::contracts::encode_erc20_transfer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

    /// In-memory entry point: fixed nonce, optional remote hash.
    pub(crate) struct FakeEntryPoint {
        pub nonce: U256,
        pub remote_hash: Option<H256>,
        pub nonce_calls: AtomicUsize,
        pub hash_calls: AtomicUsize,
    }

    impl FakeEntryPoint {
        pub(crate) fn new(nonce: u64, remote_hash: Option<H256>) -> Self {
            Self {
                nonce: nonce.into(),
                remote_hash,
                nonce_calls: AtomicUsize::new(0),
                hash_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EntryPointReader for FakeEntryPoint {
        async fn nonce(&self, _sender: Address, _key: U256) -> Result<U256, BuilderError> {
            self.nonce_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.nonce)
        }

        async fn user_op_hash(&self, _op: &UserOperation) -> Result<H256, BuilderError> {
            self.hash_calls.fetch_add(1, Ordering::SeqCst);
            self.remote_hash
                .ok_or_else(|| BuilderError::RemoteHash("execution reverted".to_string()))
        }
    }

    fn builder(reader: Arc<FakeEntryPoint>, chain_id: u64) -> UserOpBuilder {
        let sender: Address = "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap();
        UserOpBuilder::new(reader, sender, ENTRY_POINT.parse().unwrap(), chain_id)
    }

    pub(crate) fn reference_operation() -> UserOperation {
        UserOperation {
            sender: "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap(),
            nonce: U256::zero(),
            init_code: "0x9406cc6185a346906296840746125a0e449764545fbfb9cf000000000000000000000000ce0fefa6f7979c4c9b5373e0f5105b7259092c6d0000000000000000000000000000000000000000000000000000000000000000".parse().unwrap(),
            call_data: "0xb61d27f60000000000000000000000009c5754de1443984659e1b3a8d1931d83475ba29c00000000000000000000000000000000000000000000000000005af3107a400000000000000000000000000000000000000000000000000000000000000000600000000000000000000000000000000000000000000000000000000000000000".parse().unwrap(),
            call_gas_limit: 33_100.into(),
            verification_gas_limit: 361_460.into(),
            pre_verification_gas: 44_980.into(),
            max_fee_per_gas: 1_695_000_030u64.into(),
            max_priority_fee_per_gas: 1_695_000_000u64.into(),
            paymaster_and_data: Bytes::default(),
            signature: "0xebfd4657afe1f1c05c1ec65f3f9cc992a3ac083c424454ba61eab93152195e1400d74df01fc9fa53caadcb83a891d478b713016bcc0c64307c1ad3d7ea2e2d921b".parse().unwrap(),
        }
    }

    pub(crate) fn reference_hash() -> H256 {
        "0x7c1b8c9df49a9e09ecef0f0fe6841d895850d29820f9a4b494097764085dcd7e"
            .parse()
            .unwrap()
    }

    #[test]
    fn local_hash_matches_reference_vectors() {
        let entry_point: Address = ENTRY_POINT.parse().unwrap();

        let blank = UserOperation {
            verification_gas_limit: 100_000.into(),
            pre_verification_gas: 21_000.into(),
            max_priority_fee_per_gas: 1_000_000_000.into(),
            ..Default::default()
        };
        assert_eq!(
            user_operation_hash(&blank, entry_point, 80_001),
            "0x95418c07086df02ff6bc9e8bdc150b380cb761beecc098630440bcec6e862702"
                .parse::<H256>()
                .unwrap()
        );

        let op = reference_operation();
        assert_eq!(user_operation_hash(&op, entry_point, 80_001), reference_hash());
        // deterministic
        assert_eq!(
            user_operation_hash(&op, entry_point, 80_001),
            user_operation_hash(&op, entry_point, 80_001)
        );
    }

    #[test]
    fn local_hash_ignores_signature_but_not_chain() {
        let entry_point: Address = ENTRY_POINT.parse().unwrap();
        let op = reference_operation();
        let unsigned = UserOperation {
            signature: Bytes::default(),
            ..op.clone()
        };
        assert_eq!(
            user_operation_hash(&op, entry_point, 80_001),
            user_operation_hash(&unsigned, entry_point, 80_001)
        );
        assert_ne!(
            user_operation_hash(&op, entry_point, 80_001),
            user_operation_hash(&op, entry_point, 1)
        );
    }

    #[tokio::test]
    async fn remote_and_local_agree_when_entry_point_reachable() {
        let reader = Arc::new(FakeEntryPoint::new(0, Some(reference_hash())));
        let remote = builder(reader.clone(), 80_001);
        let local = builder(reader.clone(), 80_001).with_hash_strategy(HashStrategy::Local);

        let op = reference_operation();
        assert_eq!(remote.hash_operation(&op).await, local.hash_operation(&op).await);
        assert_eq!(reader.hash_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_local() {
        let reader = Arc::new(FakeEntryPoint::new(0, None));
        let builder = builder(reader.clone(), 80_001);
        assert_eq!(builder.hash_strategy(), HashStrategy::Remote);

        let hash = builder.hash_operation(&reference_operation()).await;
        assert_eq!(hash, reference_hash());
        assert_eq!(reader.hash_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_selects_strategy() {
        let reachable = Arc::new(FakeEntryPoint::new(0, Some(H256::zero())));
        let mut b = builder(reachable, 1).with_hash_strategy(HashStrategy::Local);
        assert_eq!(b.probe_hash_strategy().await, HashStrategy::Remote);

        let unreachable = Arc::new(FakeEntryPoint::new(0, None));
        let mut b = builder(unreachable.clone(), 1);
        assert_eq!(b.probe_hash_strategy().await, HashStrategy::Local);

        // local strategy never touches the entry point again
        b.hash_operation(&reference_operation()).await;
        assert_eq!(unreachable.hash_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_erc20_transfer_uses_execute_and_defaults() {
        let reader = Arc::new(FakeEntryPoint::new(0, None));
        let builder = builder(reader.clone(), 2368);

        let token: Address = "0x2eed6D0736B5cF79F8C4964353dbe1640069Cff4".parse().unwrap();
        let recipient = Address::repeat_byte(0xab);
        let transfer = encode_erc20_transfer(recipient, U256::exp10(19));
        let request = CallRequest {
            target: token,
            value: U256::zero(),
            call_data: transfer.clone(),
        };

        let op = builder
            .build_operation(&request, &GasOverrides::default())
            .await
            .unwrap();

        assert_eq!(op.nonce, U256::zero());
        assert_eq!(op.call_data, encode_execute(token, U256::zero(), transfer));
        assert_eq!(&op.call_data[..4], &[0xb6, 0x1d, 0x27, 0xf6]);
        assert_eq!(op.call_gas_limit, U256::from(100_000));
        assert_eq!(op.verification_gas_limit, U256::from(100_000));
        assert_eq!(op.pre_verification_gas, U256::from(50_000));
        assert_eq!(op.max_fee_per_gas, U256::from(1_000_000_000u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(1_000_000_000u64));
        assert!(op.init_code.is_empty());
        assert!(op.paymaster_and_data.is_empty());
        assert!(op.signature.is_empty());
        assert_eq!(reader.nonce_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overrides_win_over_defaults() {
        let builder = builder(Arc::new(FakeEntryPoint::new(7, None)), 2368);
        let overrides = GasOverrides {
            call_gas_limit: Some(1.into()),
            max_fee_per_gas: Some(2.into()),
            ..Default::default()
        };
        let request = CallRequest {
            target: Address::zero(),
            value: 5.into(),
            call_data: Bytes::default(),
        };

        let op = builder.build_operation(&request, &overrides).await.unwrap();
        assert_eq!(op.nonce, U256::from(7));
        assert_eq!(op.call_gas_limit, U256::from(1));
        assert_eq!(op.max_fee_per_gas, U256::from(2));
        assert_eq!(op.verification_gas_limit, U256::from(100_000));
    }

    #[tokio::test]
    async fn batch_doubles_gas_and_fills_values() {
        let builder = builder(Arc::new(FakeEntryPoint::new(3, None)), 2368);
        let targets = vec![Address::repeat_byte(1), Address::repeat_byte(2)];
        let call_datas = vec![Bytes::from(vec![1u8]), Bytes::from(vec![2u8])];
        let request = BatchRequest {
            targets: targets.clone(),
            values: vec![],
            call_datas: call_datas.clone(),
        };

        let op = builder
            .build_batch_operation(&request, &GasOverrides::default())
            .await
            .unwrap();

        assert_eq!(
            op.call_data,
            encode_execute_batch(targets, vec![U256::zero(); 2], call_datas)
        );
        assert_eq!(op.call_gas_limit, U256::from(200_000));
        assert_eq!(op.verification_gas_limit, U256::from(200_000));
        assert_eq!(op.pre_verification_gas, U256::from(100_000));
        assert_eq!(op.max_fee_per_gas, U256::from(1_000_000_000u64));
    }

    #[tokio::test]
    async fn batch_length_mismatch_fails_before_network() {
        let reader = Arc::new(FakeEntryPoint::new(0, None));
        let builder = builder(reader.clone(), 2368);

        let request = BatchRequest {
            targets: vec![Address::zero(); 2],
            values: vec![],
            call_datas: vec![Bytes::default()],
        };
        let err = builder
            .build_batch_operation(&request, &GasOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuilderError::LengthMismatch(_)));

        let request = BatchRequest {
            targets: vec![Address::zero(); 2],
            values: vec![U256::one()],
            call_datas: vec![Bytes::default(); 2],
        };
        let err = builder
            .build_batch_operation(&request, &GasOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuilderError::LengthMismatch(_)));
        assert_eq!(reader.nonce_calls.load(Ordering::SeqCst), 0);
    }
}
