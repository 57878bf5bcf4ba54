use crate::bundler::{self, BundlerClient};
use crate::encoding;
use crate::paymaster::{PaymasterClient, PaymasterFields};
use crate::types::{Call, UserOperation};
use anyhow::{anyhow, bail, Context, Result};
use ethers::abi::{encode, Abi, AbiParser, Function, Token};
use ethers::prelude::*;
use ethers::utils::id;
use std::sync::Arc;
use std::time::Duration;

const GET_USER_OP_HASH_ABI: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"bytes32","name":"accountGasLimits","type":"bytes32"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"bytes32","name":"gasFees","type":"bytes32"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct PackedUserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#;

/// Validation entity of the account owner on a semi-modular account.
const OWNER_ENTITY_ID: u32 = 0;

/// Leading signature byte when no validation hook takes per-hook data.
const RESERVED_VALIDATION_DATA_INDEX: u8 = 0xff;

/// Owner signature type: plain ECDSA from an EOA.
const EOA_SIGNATURE_TYPE: u8 = 0x00;

/// Well-formed ECDSA signature (low `s`, `v` = 28) that recovers to no known
/// key. Lets the bundler simulate validation without a real signature.
const DUMMY_ECDSA_SIGNATURE: &str = "fffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// Where the smart account lives and how its operations are routed.
#[derive(Debug, Clone)]
pub struct SmartAccountOptions {
    pub entrypoint: Address,
    pub factory: Address,
    pub salt: U256,
    pub bundler_url: String,
    /// Gas Manager endpoint and policy id; `None` means the account pays its own gas.
    pub paymaster: Option<(String, String)>,
    /// Applied to `eth_gasPrice` for both fee fields (10_000 = 1x).
    pub gas_multiplier_bps: u64,
    /// Zero disables the receipt timeout.
    pub receipt_timeout: Duration,
}

/// ERC-4337 client for a Modular Account v2 in semi-modular form (EntryPoint
/// v0.7), validated by `signer` as its EOA owner.
#[derive(Debug)]
pub struct SmartAccountClient<M, S> {
    client: Arc<M>,
    signer: S,
    bundler: BundlerClient,
    paymaster: Option<PaymasterClient>,
    entrypoint: Address,
    factory: Address,
    salt: U256,
    chain_id: u64,
    address: Address,
    gas_multiplier_bps: u64,
    receipt_timeout: Duration,
}

impl<M, S> SmartAccountClient<M, S>
where
    M: Middleware + 'static,
    S: Signer + 'static,
    S::Error: 'static,
{
    /// Resolve the counterfactual account address for `signer` and bind the
    /// bundler/paymaster endpoints.
    pub async fn connect(
        client: Arc<M>,
        signer: S,
        chain_id: u64,
        opts: SmartAccountOptions,
    ) -> Result<Self> {
        let owner = signer.address();
        let (address, deployed) =
            compute_account_address(client.clone(), opts.factory, owner, opts.salt).await?;

        tracing::info!(
            owner = %encoding::fmt_address(owner),
            account = %encoding::fmt_address(address),
            deployed,
            "smart account resolved"
        );

        let paymaster = opts
            .paymaster
            .map(|(url, policy_id)| PaymasterClient::new(url, policy_id));

        Ok(Self {
            client,
            signer,
            bundler: BundlerClient::new(opts.bundler_url),
            paymaster,
            entrypoint: opts.entrypoint,
            factory: opts.factory,
            salt: opts.salt,
            chain_id,
            address,
            gas_multiplier_bps: opts.gas_multiplier_bps,
            receipt_timeout: opts.receipt_timeout,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Build, sponsor, sign and submit one user operation. Returns its hash as
    /// soon as the bundler accepts it.
    ///
    /// The signer is asked exactly once, after gas and sponsorship are final;
    /// estimation runs against a dummy signature.
    pub async fn send_user_operation(&self, calls: &[Call]) -> Result<H256> {
        let call_data = encode_account_call(calls)?;
        let nonce = fetch_entrypoint_nonce(
            self.client.clone(),
            self.entrypoint,
            self.address,
            validation_nonce_key(OWNER_ENTITY_ID, true),
        )
        .await?;

        let code = self
            .client
            .get_code(self.address, None)
            .await
            .map_err(|e| anyhow!("eth_getCode failed: {e}"))?;
        let factory = if code.as_ref().is_empty() {
            Some((
                self.factory,
                build_factory_data(self.signer.address(), self.salt)?,
            ))
        } else {
            None
        };

        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| anyhow!("failed to fetch gas price: {e}"))?;
        let fee = scale_fee(gas_price, self.gas_multiplier_bps);
        if self.gas_multiplier_bps != 10_000 {
            tracing::info!(
                bps = self.gas_multiplier_bps,
                fee = %fee,
                "gas multiplier applied"
            );
        }

        let mut op = UserOperation::draft(
            self.address,
            nonce,
            factory,
            call_data,
            fee,
            fee,
            dummy_signature()?,
        );

        // Stub data must be present before estimation so verification gas covers the paymaster.
        let mut sponsorship_final = false;
        if let Some(pm) = self.paymaster.as_ref() {
            tracing::info!("requesting paymaster stub data");
            let stub = pm
                .get_paymaster_stub_data(
                    encoding::user_op_to_json(&op),
                    self.entrypoint,
                    self.chain_id,
                )
                .await?;
            sponsorship_final = stub.is_final;
            apply_paymaster(&mut op, stub);
        }

        let est = self
            .bundler
            .estimate_user_operation_gas(encoding::user_op_to_json(&op), self.entrypoint)
            .await
            .context("bundler gas estimate failed")?;
        op.call_gas_limit = est.call_gas_limit;
        op.verification_gas_limit = est.verification_gas_limit;
        op.pre_verification_gas = est.pre_verification_gas;
        if op.paymaster.is_some() {
            if let Some(v) = est.paymaster_verification_gas_limit {
                op.paymaster_verification_gas_limit = v;
            }
            if let Some(v) = est.paymaster_post_op_gas_limit {
                op.paymaster_post_op_gas_limit = v;
            }
        }

        if let Some(pm) = self.paymaster.as_ref().filter(|_| !sponsorship_final) {
            tracing::info!("requesting paymaster data");
            let data = pm
                .get_paymaster_data(
                    encoding::user_op_to_json(&op),
                    self.entrypoint,
                    self.chain_id,
                )
                .await?;
            apply_paymaster(&mut op, data);
        }

        self.sign_user_operation(&mut op).await?;

        tracing::debug!(
            user_op = %encoding::user_op_to_json(&op),
            "submitting user operation"
        );

        let user_op_hash = self
            .bundler
            .send_user_operation(encoding::user_op_to_json(&op), self.entrypoint)
            .await
            .context("bundler send failed")?;

        tracing::info!(user_op_hash = %encoding::fmt_h256(user_op_hash), "user operation accepted");
        Ok(user_op_hash)
    }

    /// Wait until the operation is mined and return the bundle transaction hash.
    pub async fn wait_for_user_operation_transaction(&self, user_op_hash: H256) -> Result<H256> {
        let receipt = self
            .bundler
            .wait_user_operation_receipt(user_op_hash, self.receipt_timeout)
            .await
            .context("failed waiting for userOp receipt")?;

        if bundler::receipt_success(&receipt) == Some(false) {
            tracing::warn!(
                user_op_hash = %encoding::fmt_h256(user_op_hash),
                reason = ?receipt.get("reason"),
                "user operation was mined but its execution reverted"
            );
        }

        bundler::receipt_transaction_hash(&receipt)
    }

    async fn sign_user_operation(&self, op: &mut UserOperation) -> Result<()> {
        // Ask the EntryPoint for the hash so the packing always matches the deployed contract.
        let entrypoint_abi: Abi =
            serde_json::from_str(GET_USER_OP_HASH_ABI).context("failed to parse EntryPoint ABI")?;
        let entrypoint_c = Contract::new(self.entrypoint, entrypoint_abi, self.client.clone());

        let user_op_hash: H256 = entrypoint_c
            .method("getUserOpHash", (op.as_packed_tuple()?,))?
            .call()
            .await
            .context("entryPoint.getUserOpHash failed")?;

        // The owner validation checks an EIP-191 signature over the hash.
        let sig = self
            .signer
            .sign_message(user_op_hash.as_bytes())
            .await
            .context("failed to sign userOpHash")?;

        op.signature = pack_owner_signature(&sig.to_vec());
        Ok(())
    }
}

fn apply_paymaster(op: &mut UserOperation, fields: PaymasterFields) {
    op.paymaster = Some(fields.paymaster);
    op.paymaster_data = fields.paymaster_data;
    if let Some(v) = fields.verification_gas_limit {
        op.paymaster_verification_gas_limit = v;
    }
    if let Some(v) = fields.post_op_gas_limit {
        op.paymaster_post_op_gas_limit = v;
    }
}

fn scale_fee(gas_price: U256, bps: u64) -> U256 {
    gas_price * U256::from(bps.max(1)) / U256::from(10_000u64)
}

/// EntryPoint nonce key selecting the validation to run:
/// `entityId << 8 | isGlobal`.
fn validation_nonce_key(entity_id: u32, global: bool) -> U256 {
    (U256::from(entity_id) << 8usize) | U256::from(u8::from(global))
}

/// Owner signature as the account expects it in `userOp.signature`.
fn pack_owner_signature(ecdsa: &[u8]) -> Bytes {
    let mut v = Vec::with_capacity(2 + ecdsa.len());
    v.push(RESERVED_VALIDATION_DATA_INDEX);
    v.push(EOA_SIGNATURE_TYPE);
    v.extend_from_slice(ecdsa);
    Bytes::from(v)
}

fn dummy_signature() -> Result<Bytes> {
    Ok(pack_owner_signature(&hex::decode(DUMMY_ECDSA_SIGNATURE)?))
}

fn parse_function(signature: &str, name: &str) -> Result<Function> {
    let abi = AbiParser::default().parse(&[signature])?;
    Ok(abi.function(name)?.clone())
}

/// Account calldata: `execute` for one call, `executeBatch` for several.
pub fn encode_account_call(calls: &[Call]) -> Result<Bytes> {
    match calls {
        [] => bail!("a user operation needs at least one call"),
        [call] => {
            let execute = parse_function(
                "function execute(address target, uint256 value, bytes data) returns (bytes)",
                "execute",
            )?;
            let data = execute.encode_input(&[
                Token::Address(call.target),
                Token::Uint(call.value),
                Token::Bytes(call.data.to_vec()),
            ])?;
            Ok(Bytes::from(data))
        }
        many => {
            let batch = many
                .iter()
                .map(|c| {
                    Token::Tuple(vec![
                        Token::Address(c.target),
                        Token::Uint(c.value),
                        Token::Bytes(c.data.to_vec()),
                    ])
                })
                .collect();
            let mut data = id("executeBatch((address,uint256,bytes)[])").to_vec();
            data.extend(encode(&[Token::Array(batch)]));
            Ok(Bytes::from(data))
        }
    }
}

/// `createSemiModularAccount(owner, salt)` calldata for the account factory.
pub fn build_factory_data(owner: Address, salt: U256) -> Result<Bytes> {
    let create_account = parse_function(
        "function createSemiModularAccount(address owner, uint256 salt) returns (address)",
        "createSemiModularAccount",
    )?;
    let data = create_account.encode_input(&[Token::Address(owner), Token::Uint(salt)])?;
    Ok(Bytes::from(data))
}

async fn compute_account_address<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    owner: Address,
    salt: U256,
) -> Result<(Address, bool)> {
    let factory_abi = AbiParser::default().parse(&[
        "function getAddressSemiModular(address owner, uint256 salt) view returns (address)",
    ])?;
    let factory = Contract::new(factory, factory_abi, client.clone());

    let account: Address = factory
        .method("getAddressSemiModular", (owner, salt))?
        .call()
        .await
        .context("factory.getAddressSemiModular failed")?;

    let code = client
        .get_code(account, None)
        .await
        .map_err(|e| anyhow!("eth_getCode failed: {e}"))?;

    Ok((account, !code.as_ref().is_empty()))
}

async fn fetch_entrypoint_nonce<M: Middleware + 'static>(
    client: Arc<M>,
    entrypoint: Address,
    account: Address,
    key: U256,
) -> Result<U256> {
    let entrypoint_abi = AbiParser::default()
        .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
    let entrypoint_c = Contract::new(entrypoint, entrypoint_abi, client);

    let nonce: U256 = entrypoint_c
        .method("getNonce", (account, key))?
        .call()
        .await
        .context("entryPoint.getNonce failed")?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{decode, ParamType};

    fn call(byte: u8, value: u64) -> Call {
        Call {
            target: Address::repeat_byte(byte),
            value: U256::from(value),
            data: Bytes::from(vec![byte; 4]),
        }
    }

    #[test]
    fn single_call_uses_execute() {
        let data = encode_account_call(&[call(0x11, 5)]).unwrap();
        assert_eq!(&data[..4], &id("execute(address,uint256,bytes)")[..]);

        let tokens = decode(
            &[ParamType::Address, ParamType::Uint(256), ParamType::Bytes],
            &data[4..],
        )
        .unwrap();
        assert_eq!(tokens[0], Token::Address(Address::repeat_byte(0x11)));
        assert_eq!(tokens[1], Token::Uint(U256::from(5u64)));
        assert_eq!(tokens[2], Token::Bytes(vec![0x11; 4]));
    }

    #[test]
    fn several_calls_use_execute_batch_with_values() {
        let data = encode_account_call(&[call(0x11, 0), call(0x22, 3)]).unwrap();
        assert_eq!(&data[..4], &id("executeBatch((address,uint256,bytes)[])")[..]);

        let call_type =
            ParamType::Tuple(vec![ParamType::Address, ParamType::Uint(256), ParamType::Bytes]);
        let tokens = decode(&[ParamType::Array(Box::new(call_type))], &data[4..]).unwrap();
        assert_eq!(
            tokens[0],
            Token::Array(vec![
                Token::Tuple(vec![
                    Token::Address(Address::repeat_byte(0x11)),
                    Token::Uint(U256::zero()),
                    Token::Bytes(vec![0x11; 4]),
                ]),
                Token::Tuple(vec![
                    Token::Address(Address::repeat_byte(0x22)),
                    Token::Uint(U256::from(3u64)),
                    Token::Bytes(vec![0x22; 4]),
                ]),
            ])
        );
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(encode_account_call(&[]).is_err());
    }

    #[test]
    fn factory_data_creates_semi_modular_account() {
        let owner = Address::repeat_byte(0x0e);
        let data = build_factory_data(owner, U256::from(9u64)).unwrap();

        assert_eq!(&data[..4], &id("createSemiModularAccount(address,uint256)")[..]);
        let tokens = decode(&[ParamType::Address, ParamType::Uint(256)], &data[4..]).unwrap();
        assert_eq!(tokens, vec![Token::Address(owner), Token::Uint(U256::from(9u64))]);
    }

    #[test]
    fn owner_validation_uses_global_nonce_key() {
        assert_eq!(validation_nonce_key(OWNER_ENTITY_ID, true), U256::one());
        assert_eq!(validation_nonce_key(OWNER_ENTITY_ID, false), U256::zero());
        assert_eq!(validation_nonce_key(2, true), U256::from(0x201u64));
    }

    #[test]
    fn owner_signature_is_prefixed() {
        let ecdsa = vec![0xab; 65];
        let packed = pack_owner_signature(&ecdsa);
        assert_eq!(packed.len(), 67);
        assert_eq!(&packed[..2], &[0xff, 0x00]);
        assert_eq!(&packed[2..], &ecdsa[..]);

        let dummy = dummy_signature().unwrap();
        assert_eq!(dummy.len(), 67);
        assert_eq!(&dummy[..2], &[0xff, 0x00]);
        assert_eq!(dummy[66], 0x1c);
    }

    #[test]
    fn paymaster_limits_only_override_when_present() {
        let mut op = UserOperation::draft(
            Address::repeat_byte(0x11),
            U256::one(),
            None,
            Bytes::default(),
            U256::one(),
            U256::one(),
            Bytes::default(),
        );
        op.paymaster_post_op_gas_limit = U256::from(7u64);

        apply_paymaster(
            &mut op,
            PaymasterFields {
                paymaster: Address::repeat_byte(0x99),
                paymaster_data: Bytes::from(vec![0x01]),
                verification_gas_limit: Some(U256::from(500u64)),
                post_op_gas_limit: None,
                is_final: false,
            },
        );

        assert_eq!(op.paymaster, Some(Address::repeat_byte(0x99)));
        assert_eq!(op.paymaster_data, Bytes::from(vec![0x01]));
        assert_eq!(op.paymaster_verification_gas_limit, U256::from(500u64));
        assert_eq!(op.paymaster_post_op_gas_limit, U256::from(7u64));
    }

    #[test]
    fn fee_scaling_uses_basis_points() {
        assert_eq!(scale_fee(U256::from(100u64), 10_000), U256::from(100u64));
        assert_eq!(scale_fee(U256::from(100u64), 15_000), U256::from(150u64));
        assert_eq!(scale_fee(U256::from(100_000u64), 0), U256::from(10u64));
    }
}
