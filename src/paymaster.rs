use crate::encoding;
use crate::rpc::JsonRpcClient;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;

/// ERC-7677 paymaster web service client, used against Alchemy Gas Manager.
///
/// Sponsorship is selected by `policyId` in the request context.
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: JsonRpcClient,
    policy_id: String,
}

/// EntryPoint v0.7 sponsorship fields. Gas limits are only present when the
/// service wants to pin them; otherwise the bundler estimate decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub paymaster_data: Bytes,
    pub verification_gas_limit: Option<U256>,
    pub post_op_gas_limit: Option<U256>,
    /// Stub data that is already final; `pm_getPaymasterData` can be skipped.
    pub is_final: bool,
}

impl PaymasterClient {
    pub fn new(url: String, policy_id: String) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
            policy_id,
        }
    }

    /// Placeholder sponsorship good enough for gas estimation.
    pub async fn get_paymaster_stub_data(
        &self,
        user_op: Value,
        entrypoint: Address,
        chain_id: u64,
    ) -> Result<PaymasterFields> {
        let params = build_params(user_op, entrypoint, chain_id, &self.policy_id);
        let res = self
            .rpc
            .call("pm_getPaymasterStubData", params)
            .await
            .context("pm_getPaymasterStubData RPC failed")?;
        parse_v07_paymaster_fields(&res)
    }

    /// Final, signed sponsorship for the estimated operation.
    pub async fn get_paymaster_data(
        &self,
        user_op: Value,
        entrypoint: Address,
        chain_id: u64,
    ) -> Result<PaymasterFields> {
        let params = build_params(user_op, entrypoint, chain_id, &self.policy_id);
        let res = self
            .rpc
            .call("pm_getPaymasterData", params)
            .await
            .context("pm_getPaymasterData RPC failed")?;
        parse_v07_paymaster_fields(&res)
    }
}

fn build_params(user_op: Value, entrypoint: Address, chain_id: u64, policy_id: &str) -> Value {
    serde_json::json!([
        user_op,
        encoding::fmt_address(entrypoint),
        encoding::fmt_u256(U256::from(chain_id)),
        { "policyId": policy_id }
    ])
}

fn parse_v07_paymaster_fields(result: &Value) -> Result<PaymasterFields> {
    // ERC-7677 returns v0.7 fields at the top level; Alchemy may nest them per
    // entrypoint version.
    let fields = if result.get("paymaster").is_some() {
        result
    } else {
        result
            .get("entrypointV07Response")
            .or_else(|| result.get("entryPointV07Response"))
            .ok_or_else(|| {
                anyhow!("missing paymaster (expected top-level fields or entrypointV07Response)")
            })?
    };

    let str_field = |key: &str| fields.get(key).and_then(Value::as_str);

    let paymaster = str_field("paymaster")
        .ok_or_else(|| anyhow!("paymaster is missing or not a string"))
        .and_then(encoding::parse_address)
        .context("invalid paymaster address")?;
    let paymaster_data = encoding::parse_bytes(str_field("paymasterData").unwrap_or("0x"))
        .context("invalid hex in paymasterData")?;

    let quantity = |key: &str| -> Result<Option<U256>> {
        str_field(key)
            .map(encoding::parse_u256_quantity)
            .transpose()
            .with_context(|| format!("invalid {key}"))
    };

    Ok(PaymasterFields {
        paymaster,
        paymaster_data,
        verification_gas_limit: quantity("paymasterVerificationGasLimit")?,
        post_op_gas_limit: quantity("paymasterPostOpGasLimit")?,
        is_final: fields.get("isFinal").and_then(Value::as_bool).unwrap_or(false),
    })
}
