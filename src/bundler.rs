use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity};
use crate::rpc::JsonRpcClient;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::time::{Duration, Instant};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// ERC-4337 bundler JSON-RPC client.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: JsonRpcClient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    /// Only reported for sponsored operations.
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
        }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self
            .rpc
            .call("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;

        parse_gas_estimates(&res)
    }

    pub async fn send_user_operation(&self, user_op: Value, entrypoint: Address) -> Result<H256> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self
            .rpc
            .call("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Poll `eth_getUserOperationReceipt` until the bundler reports one.
    ///
    /// A zero `timeout` waits forever.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<Value> {
        let start = Instant::now();
        loop {
            if !timeout.is_zero() && start.elapsed() > timeout {
                return Err(anyhow!(
                    "timed out waiting for userOp receipt after {:?}",
                    timeout
                ));
            }

            let params = serde_json::json!([fmt_h256(user_op_hash)]);
            match self.rpc.call("eth_getUserOperationReceipt", params).await {
                Ok(v) if !v.is_null() => return Ok(v),
                Ok(_) => {
                    tracing::debug!(user_op_hash = %fmt_h256(user_op_hash), "receipt not yet available");
                }
                Err(e) => {
                    // free-tier bundlers drop requests under load; keep polling
                    tracing::warn!(error = %e, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

fn parse_gas_estimates(res: &Value) -> Result<GasEstimates> {
    Ok(GasEstimates {
        call_gas_limit: parse_u256_field(res, "callGasLimit")?,
        verification_gas_limit: parse_u256_field(res, "verificationGasLimit")?,
        pre_verification_gas: parse_u256_field(res, "preVerificationGas")?,
        paymaster_verification_gas_limit: parse_optional_u256_field(
            res,
            "paymasterVerificationGasLimit",
        )?,
        paymaster_post_op_gas_limit: parse_optional_u256_field(res, "paymasterPostOpGasLimit")?,
    })
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256> {
    parse_optional_u256_field(v, key)?.ok_or_else(|| anyhow!("missing or invalid field {key}"))
}

fn parse_optional_u256_field(v: &Value, key: &str) -> Result<Option<U256>> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_u256_quantity(s).map(Some),
        Some(other) => Err(anyhow!("field {key} is not a hex quantity: {other}")),
    }
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Bundlers normally return the hash as a bare string; some wrap it.
    let hash_str = res
        .as_str()
        .or_else(|| res.get("result").and_then(Value::as_str))
        .or_else(|| res.get("userOpHash").and_then(Value::as_str))
        .or_else(|| res.get("userOperationHash").and_then(Value::as_str))
        .ok_or_else(|| {
            anyhow!(
                "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
                res
            )
        })?;

    parse_h256(hash_str)
}

/// Pull the mined transaction hash out of a user-operation receipt.
///
/// The hash normally sits under `receipt.transactionHash`; some bundlers also
/// echo it at the top level.
pub fn receipt_transaction_hash(receipt: &Value) -> Result<H256> {
    let hash_str = receipt
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .and_then(Value::as_str)
        .or_else(|| receipt.get("transactionHash").and_then(Value::as_str))
        .ok_or_else(|| anyhow!("userOp receipt has no transactionHash: {}", receipt))?;

    parse_h256(hash_str)
}

/// `success` flag of a user-operation receipt, if present.
pub fn receipt_success(receipt: &Value) -> Option<bool> {
    receipt.get("success").and_then(Value::as_bool)
}
