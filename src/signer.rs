use crate::encoding::{fmt_h256, strip_hex_prefix};
use crate::para::{CustodyService, WalletRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip712::Eip712;
use ethers::types::{Address, Signature, H256};
use ethers::utils::hash_message;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Hex digits in a 65-byte signature.
const SIGNATURE_HEX_LEN: usize = 130;

/// Ethereum offset between the raw recovery id and `v`.
const RECOVERY_OFFSET: u8 = 27;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Para wallet not available for signing.")]
    WalletUnavailable,

    #[error("Signature failed")]
    SignatureFailed,

    #[error("malformed signature from custody service: {0}")]
    MalformedSignature(String),

    /// Only raw ids 0/1 are rewritten; anything else below 27 means the service
    /// changed its output format.
    #[error("unexpected recovery byte {0:#04x} in custody signature")]
    UnexpectedRecoveryByte(u8),

    #[error("wallet address {0:?} is not a valid EVM address")]
    InvalidAddress(String),

    #[error("{0} is not supported by the custodial account")]
    Unsupported(&'static str),

    #[error("failed to hash typed data: {0}")]
    Eip712(String),

    #[error("invalid hex digest: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Custody(#[from] anyhow::Error),
}

/// Re-encode a hex string (no `0x`) as standard base64, the custody service's
/// payload encoding.
pub fn hex_to_base64(hex_str: &str) -> Result<String, SignerError> {
    Ok(B64.encode(hex::decode(hex_str)?))
}

/// Payload for a digest rendered as hex: the `0x` marker is dropped before
/// re-encoding.
pub fn encode_digest_payload(hash_hex: &str) -> Result<String, SignerError> {
    hex_to_base64(strip_hex_prefix(hash_hex))
}

/// Lift a raw 0/1 recovery id to 27/28, leaving `r || s` untouched.
///
/// Signatures already at or above 27 pass through unchanged. The result is
/// always `0x`-prefixed.
pub fn normalize_recovery_byte(signature: &str) -> Result<String, SignerError> {
    let body = strip_hex_prefix(signature.trim());
    if body.len() != SIGNATURE_HEX_LEN || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SignerError::MalformedSignature(format!(
            "expected {} hex digits, got {:?}",
            SIGNATURE_HEX_LEN, body
        )));
    }

    let (rs, v_hex) = body.split_at(SIGNATURE_HEX_LEN - 2);
    let v = u8::from_str_radix(v_hex, 16)
        .map_err(|e| SignerError::MalformedSignature(e.to_string()))?;

    match v {
        0 | 1 => {
            let adjusted = v + RECOVERY_OFFSET;
            tracing::debug!(v, adjusted, "normalized recovery byte");
            Ok(format!("0x{rs}{adjusted:02x}"))
        }
        v if v >= RECOVERY_OFFSET => {
            if v > RECOVERY_OFFSET + 1 {
                tracing::warn!(v, "custody signature carries a non-standard recovery byte");
            }
            Ok(format!("0x{body}"))
        }
        other => Err(SignerError::UnexpectedRecoveryByte(other)),
    }
}

/// Id of the wallet to sign with. Fails before any request is made.
pub fn signing_wallet_id(wallet: Option<&WalletRecord>) -> Result<&str, SignerError> {
    wallet
        .and_then(WalletRecord::id_str)
        .ok_or(SignerError::WalletUnavailable)
}

/// Ask the custody service to sign `digest` and return its raw signature hex.
pub async fn request_signature(
    custody: &dyn CustodyService,
    wallet: Option<&WalletRecord>,
    digest: H256,
) -> Result<String, SignerError> {
    let wallet_id = signing_wallet_id(wallet)?;
    let payload = encode_digest_payload(&fmt_h256(digest))?;

    let res = custody.sign_message(wallet_id, &payload).await?;
    match res.signature {
        Some(signature) => Ok(signature),
        None => {
            tracing::error!(
                wallet_id,
                pending_transaction_id = ?res.pending_transaction_id,
                review_url = ?res.transaction_review_url,
                "custody service returned no signature"
            );
            Err(SignerError::SignatureFailed)
        }
    }
}

/// How a [`CustodialAccount`] turns a digest into a signature. Personal
/// messages and EIP-712 payloads both go through the installed strategy.
#[async_trait]
pub trait SignMessageStrategy: fmt::Debug + Send + Sync {
    async fn sign_digest(
        &self,
        custody: &dyn CustodyService,
        wallet: Option<&WalletRecord>,
        digest: H256,
    ) -> Result<String, SignerError>;

    /// EIP-191 personal message.
    async fn sign_message(
        &self,
        custody: &dyn CustodyService,
        wallet: Option<&WalletRecord>,
        message: &[u8],
    ) -> Result<String, SignerError> {
        self.sign_digest(custody, wallet, hash_message(message)).await
    }
}

/// Returns the service's signature as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl SignMessageStrategy for Passthrough {
    async fn sign_digest(
        &self,
        custody: &dyn CustodyService,
        wallet: Option<&WalletRecord>,
        digest: H256,
    ) -> Result<String, SignerError> {
        let raw = request_signature(custody, wallet, digest).await?;
        Ok(format!("0x{}", strip_hex_prefix(&raw)))
    }
}

/// The custody service signs 32-byte digests and may report `v` as the raw
/// recovery id (0/1). Ethereum verifiers, smart-account validation included,
/// expect 27/28, so the trailing byte is normalized.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryByteAdjusted;

#[async_trait]
impl SignMessageStrategy for RecoveryByteAdjusted {
    async fn sign_digest(
        &self,
        custody: &dyn CustodyService,
        wallet: Option<&WalletRecord>,
        digest: H256,
    ) -> Result<String, SignerError> {
        let raw = request_signature(custody, wallet, digest).await?;
        normalize_recovery_byte(&raw)
    }
}

/// A custody-held wallet usable wherever `ethers` expects a [`Signer`].
pub struct CustodialAccount {
    custody: Arc<dyn CustodyService>,
    wallet: WalletRecord,
    address: Address,
    chain_id: u64,
    strategy: Arc<dyn SignMessageStrategy>,
}

impl fmt::Debug for CustodialAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodialAccount")
            .field("wallet_id", &self.wallet.id)
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl CustodialAccount {
    /// Wrap the first wallet of the custody session. Messages are signed with
    /// [`Passthrough`] until another strategy is installed.
    pub fn from_first_wallet(
        custody: Arc<dyn CustodyService>,
        chain_id: u64,
    ) -> Result<Self, SignerError> {
        let wallet = custody
            .wallets()
            .first()
            .cloned()
            .ok_or(SignerError::WalletUnavailable)?;

        let raw_address = wallet
            .address
            .as_deref()
            .ok_or(SignerError::WalletUnavailable)?;
        let address = Address::from_str(raw_address)
            .map_err(|_| SignerError::InvalidAddress(raw_address.to_string()))?;

        tracing::info!(
            wallet_id = ?wallet.id,
            wallet_type = wallet.kind.as_deref().unwrap_or("<unknown>"),
            address = ?address,
            "custodial signer ready"
        );

        Ok(Self {
            custody,
            wallet,
            address,
            chain_id,
            strategy: Arc::new(Passthrough),
        })
    }

    pub fn with_sign_strategy(mut self, strategy: Arc<dyn SignMessageStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Personal-message signature as `0x`-prefixed hex.
    pub async fn sign_message_hex(&self, message: &[u8]) -> Result<String, SignerError> {
        self.strategy
            .sign_message(self.custody.as_ref(), Some(&self.wallet), message)
            .await
    }
}

fn parse_signature(hex_sig: &str) -> Result<Signature, SignerError> {
    Signature::from_str(hex_sig).map_err(|e| SignerError::MalformedSignature(e.to_string()))
}

#[async_trait]
impl Signer for CustodialAccount {
    type Error = SignerError;

    async fn sign_message<S: Send + Sync + AsRef<[u8]>>(
        &self,
        message: S,
    ) -> Result<Signature, Self::Error> {
        let hex_sig = self.sign_message_hex(message.as_ref()).await?;
        parse_signature(&hex_sig)
    }

    async fn sign_transaction(&self, _tx: &TypedTransaction) -> Result<Signature, Self::Error> {
        Err(SignerError::Unsupported("transaction signing"))
    }

    async fn sign_typed_data<T: Eip712 + Send + Sync>(
        &self,
        payload: &T,
    ) -> Result<Signature, Self::Error> {
        let digest = payload
            .encode_eip712()
            .map_err(|e| SignerError::Eip712(e.to_string()))?;
        let hex_sig = self
            .strategy
            .sign_digest(self.custody.as_ref(), Some(&self.wallet), H256::from(digest))
            .await?;
        parse_signature(&hex_sig)
    }

    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn with_chain_id<T: Into<u64>>(mut self, chain_id: T) -> Self {
        self.chain_id = chain_id.into();
        self
    }
}
