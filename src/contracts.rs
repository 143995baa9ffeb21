// src/contracts.rs
use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::prelude::*;

use crate::error::BuilderError;

abigen!(
    EntryPoint,
    r#"[
        struct UserOperation {address sender;uint256 nonce;bytes initCode;bytes callData;uint256 callGasLimit;uint256 verificationGasLimit;uint256 preVerificationGas;uint256 maxFeePerGas;uint256 maxPriorityFeePerGas;bytes paymasterAndData;bytes signature;}
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce)
        function getUserOpHash(UserOperation userOp) external view returns (bytes32)
    ]"#
);

abigen!(
    SimpleAccount,
    r#"[
        function execute(address dest, uint256 value, bytes func) external
        function executeBatch(address[] dest, uint256[] value, bytes[] func) external
    ]"#
);

abigen!(
    Eip3009Token,
    r#"[
        function transferWithAuthorization(address from, address to, uint256 value, uint256 validAfter, uint256 validBefore, bytes32 nonce, uint8 v, bytes32 r, bytes32 s) external returns (bool)
        function balanceOf(address account) external view returns (uint256)
        function decimals() external view returns (uint8)
        function transfer(address to, uint256 amount) external returns (bool)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

impl From<&crate::types::UserOperation> for UserOperation {
    fn from(op: &crate::types::UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.init_code.clone(),
            call_data: op.call_data.clone(),
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster_and_data: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

/// The two entry point views the builder reads.
#[async_trait]
pub trait EntryPointReader: Send + Sync {
    /// Current nonce of `sender` on nonce channel `key`.
    async fn nonce(&self, sender: Address, key: U256) -> Result<U256, BuilderError>;

    /// The entry point's own `getUserOpHash`.
    async fn user_op_hash(&self, op: &crate::types::UserOperation) -> Result<H256, BuilderError>;
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointReader for EntryPoint<M> {
    async fn nonce(&self, sender: Address, key: U256) -> Result<U256, BuilderError> {
        self.get_nonce(sender, key)
            .call()
            .await
            .map_err(|e| BuilderError::Nonce(e.to_string()))
    }

    async fn user_op_hash(&self, op: &crate::types::UserOperation) -> Result<H256, BuilderError> {
        self.get_user_op_hash(op.into())
            .call()
            .await
            .map(H256::from)
            .map_err(|e| BuilderError::RemoteHash(e.to_string()))
    }
}

/// ABI-encodes `execute(dest, value, func)` for the smart account.
pub fn encode_execute(dest: Address, value: U256, func: Bytes) -> Bytes {
    ExecuteCall { dest, value, func }.encode().into()
}

/// ABI-encodes `executeBatch(dest[], value[], func[])` for the smart account.
pub fn encode_execute_batch(dest: Vec<Address>, value: Vec<U256>, func: Vec<Bytes>) -> Bytes {
    ExecuteBatchCall { dest, value, func }.encode().into()
}

/// ABI-encodes an ERC-20 `transfer(to, amount)`.
pub fn encode_erc20_transfer(to: Address, amount: U256) -> Bytes {
    TransferCall { to, amount }.encode().into()
}

/// ABI-encodes an ERC-20 `approve(spender, amount)`.
pub fn encode_erc20_approve(spender: Address, amount: U256) -> Bytes {
    ApproveCall { spender, amount }.encode().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::contract::EthCall;

    #[test]
    fn selectors() {
        assert_eq!(ExecuteCall::selector(), [0xb6, 0x1d, 0x27, 0xf6]);
        assert_eq!(ExecuteBatchCall::selector(), [0x47, 0xe1, 0xda, 0x2a]);
        assert_eq!(TransferCall::selector(), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(ApproveCall::selector(), [0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(BalanceOfCall::selector(), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(TransferWithAuthorizationCall::selector(), [0xe3, 0xee, 0x16, 0x0e]);
        assert_eq!(GetNonceCall::selector(), [0x35, 0x56, 0x7e, 0x1a]);
    }

    #[test]
    fn execute_matches_known_encoding() {
        // execute(0x9c57..., 0.0001 ether, "") as sent by a v0.6 SimpleAccount
        let dest: Address = "0x9c5754De1443984659E1b3a8d1931D83475ba29C".parse().unwrap();
        let encoded = encode_execute(dest, U256::from(100_000_000_000_000u64), Bytes::default());
        let expected: Bytes = "0xb61d27f60000000000000000000000009c5754de1443984659e1b3a8d1931d83475ba29c00000000000000000000000000000000000000000000000000005af3107a400000000000000000000000000000000000000000000000000000000000000000600000000000000000000000000000000000000000000000000000000000000000".parse().unwrap();
        assert_eq!(encoded, expected);
    }
}
