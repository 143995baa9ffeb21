// src/verifier.rs
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip712::{EIP712Domain, Eip712, Eip712Error};
use ethers::utils::keccak256;
use tracing::debug;

use crate::config::TokenConfig;
use crate::error::RelayerError;
use crate::types::TransferAuthorization;

const TRANSFER_WITH_AUTHORIZATION_TYPE: &str = "TransferWithAuthorization(address from,address to,uint256 value,uint256 validAfter,uint256 validBefore,bytes32 nonce)";

/// Seconds an authorization is back-dated so clock skew does not reject it.
pub const VALID_AFTER_SKEW: u64 = 300;
/// Lifetime of a fresh authorization, in seconds.
pub const VALID_FOR: u64 = 3600;

/// The signed struct of an EIP-3009 `transferWithAuthorization`.
#[derive(Debug, Clone)]
pub struct TransferWithAuthorization {
    pub domain: EIP712Domain,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: U256,
    pub valid_before: U256,
    pub nonce: H256,
}

impl Eip712 for TransferWithAuthorization {
    type Error = Eip712Error;

    fn domain(&self) -> Result<EIP712Domain, Self::Error> {
        Ok(self.domain.clone())
    }

    fn type_hash() -> Result<[u8; 32], Self::Error> {
        Ok(keccak256(TRANSFER_WITH_AUTHORIZATION_TYPE))
    }

    fn struct_hash(&self) -> Result<[u8; 32], Self::Error> {
        Ok(keccak256(abi::encode(&[
            Token::FixedBytes(Self::type_hash()?.to_vec()),
            Token::Address(self.from),
            Token::Address(self.to),
            Token::Uint(self.value),
            Token::Uint(self.valid_after),
            Token::Uint(self.valid_before),
            Token::FixedBytes(self.nonce.as_bytes().to_vec()),
        ])))
    }
}

/// Checks EIP-3009 authorizations against one token's EIP-712 domain.
#[derive(Debug, Clone)]
pub struct Eip3009Verifier {
    domain: EIP712Domain,
}

impl Eip3009Verifier {
    pub fn new(name: &str, version: &str, chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            domain: EIP712Domain {
                name: Some(name.to_string()),
                version: Some(version.to_string()),
                chain_id: Some(chain_id.into()),
                verifying_contract: Some(verifying_contract),
                salt: None,
            },
        }
    }

    pub fn from_config(token: &TokenConfig, chain_id: u64) -> Self {
        Self::new(&token.eip712_name, &token.eip712_version, chain_id, token.address)
    }

    pub fn domain(&self) -> &EIP712Domain {
        &self.domain
    }

    pub fn payload(&self, auth: &TransferAuthorization) -> TransferWithAuthorization {
        TransferWithAuthorization {
            domain: self.domain.clone(),
            from: auth.from,
            to: auth.to,
            value: auth.value,
            valid_after: auth.valid_after.into(),
            valid_before: auth.valid_before.into(),
            nonce: auth.nonce,
        }
    }

    /// The EIP-712 digest the token owner signs.
    pub fn digest(&self, auth: &TransferAuthorization) -> Result<H256, Eip712Error> {
        self.payload(auth).encode_eip712().map(H256::from)
    }

    /// True when the signature recovers to `auth.from`. Malformed signatures
    /// are reported as false.
    pub fn verify(&self, auth: &TransferAuthorization) -> bool {
        let digest = match self.digest(auth) {
            Ok(digest) => digest,
            Err(e) => {
                debug!("Could not hash authorization: {}", e);
                return false;
            }
        };

        let signature = Signature {
            r: U256::from_big_endian(auth.r.as_bytes()),
            s: U256::from_big_endian(auth.s.as_bytes()),
            v: auth.v.into(),
        };

        match signature.recover(RecoveryMessage::Hash(digest)) {
            Ok(signer) => signer == auth.from,
            Err(e) => {
                debug!("Could not recover authorization signer: {}", e);
                false
            }
        }
    }
}

/// Signs a transfer of `value` from `wallet` to `to`, valid from five minutes
/// before `now` until one hour after it, with a random nonce.
pub async fn sign_authorization(
    wallet: &LocalWallet,
    verifier: &Eip3009Verifier,
    to: Address,
    value: U256,
    now: u64,
) -> Result<TransferAuthorization, RelayerError> {
    let mut auth = TransferAuthorization {
        from: wallet.address(),
        to,
        value,
        valid_after: now.saturating_sub(VALID_AFTER_SKEW),
        valid_before: now + VALID_FOR,
        nonce: H256::random(),
        v: 0,
        r: H256::zero(),
        s: H256::zero(),
    };

    let signature = wallet
        .sign_typed_data(&verifier.payload(&auth))
        .await
        .map_err(|e| RelayerError::Failed(format!("signing authorization: {e}")))?;

    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    signature.r.to_big_endian(&mut r);
    signature.s.to_big_endian(&mut s);
    auth.v = signature.v as u8;
    auth.r = H256::from(r);
    auth.s = H256::from(s);

    Ok(auth)
}
