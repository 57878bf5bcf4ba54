use crate::types::UserOperation;
use anyhow::{bail, Context, Result};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

// `Debug` on ethers hashes is the full lowercase `0x` form; `Display` abbreviates.

pub fn fmt_address(addr: Address) -> String {
    format!("{addr:?}")
}

pub fn fmt_h256(h: H256) -> String {
    format!("{h:?}")
}

/// JSON-RPC "quantity": `0x`, no leading zeros.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".into()
    } else {
        format!("{v:#x}")
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b))
}

/// Drops one leading `0x`, if any.
pub fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Unpacked v0.7 RPC form. Factory and paymaster fields are omitted entirely
/// when unset; bundlers reject a `paymaster` of `0x`.
pub fn user_op_to_json(op: &UserOperation) -> Value {
    let mut m = Map::new();
    let mut put = |k: &str, v: String| {
        m.insert(k.to_string(), Value::String(v));
    };

    put("sender", fmt_address(op.sender));
    put("nonce", fmt_u256(op.nonce));
    if let Some(factory) = op.factory {
        put("factory", fmt_address(factory));
        put("factoryData", fmt_bytes(&op.factory_data));
    }
    put("callData", fmt_bytes(&op.call_data));
    put("callGasLimit", fmt_u256(op.call_gas_limit));
    put("verificationGasLimit", fmt_u256(op.verification_gas_limit));
    put("preVerificationGas", fmt_u256(op.pre_verification_gas));
    put("maxFeePerGas", fmt_u256(op.max_fee_per_gas));
    put("maxPriorityFeePerGas", fmt_u256(op.max_priority_fee_per_gas));
    if let Some(paymaster) = op.paymaster {
        put("paymaster", fmt_address(paymaster));
        put(
            "paymasterVerificationGasLimit",
            fmt_u256(op.paymaster_verification_gas_limit),
        );
        put("paymasterPostOpGasLimit", fmt_u256(op.paymaster_post_op_gas_limit));
        put("paymasterData", fmt_bytes(&op.paymaster_data));
    }
    put("signature", fmt_bytes(&op.signature));

    Value::Object(m)
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let digits = strip_hex_prefix(s);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).with_context(|| format!("invalid quantity {s:?}"))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let bytes = hex::decode(strip_hex_prefix(s))?;
    if bytes.len() != 32 {
        bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_address(s: &str) -> Result<Address> {
    let bytes = hex::decode(strip_hex_prefix(s))?;
    if bytes.len() != 20 {
        bail!("expected 20-byte address, got {} bytes", bytes.len());
    }
    Ok(Address::from_slice(&bytes))
}

pub fn parse_bytes(s: &str) -> Result<Bytes> {
    Ok(Bytes::from(hex::decode(strip_hex_prefix(s))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> UserOperation {
        UserOperation::draft(
            Address::repeat_byte(0x11),
            U256::from(7u64),
            None,
            Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb]),
            U256::from(2u64),
            U256::from(1u64),
            Bytes::from(vec![0u8; 67]),
        )
    }

    #[test]
    fn hex_rendering_is_full_length() {
        let addr = Address::repeat_byte(0xab);
        assert_eq!(fmt_address(addr), format!("0x{}", "ab".repeat(20)));
        assert_eq!(fmt_h256(H256::repeat_byte(0x01)), format!("0x{}", "01".repeat(32)));
        assert_eq!(fmt_bytes(&Bytes::default()), "0x");
    }

    #[test]
    fn quantity_formatting_has_no_leading_zeros() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(1_000_000u64)), "0xf4240");
        assert_eq!(fmt_u256(U256::from(10143u64)), "0x279f");
    }

    #[test]
    fn parse_u256_quantity_accepts_empty_and_prefixed() {
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert_eq!(parse_u256_quantity("0xf4240").unwrap(), U256::from(1_000_000u64));
        assert_eq!(parse_u256_quantity("ff").unwrap(), U256::from(255u64));
        assert!(parse_u256_quantity("0xzz").is_err());
    }

    #[test]
    fn fixed_width_parsers_check_length() {
        assert!(parse_h256("0xdeadbeef").is_err());
        assert!(parse_h256(&format!("0x{}", "ab".repeat(32))).is_ok());
        assert!(parse_address("0x1234").is_err());
        assert_eq!(
            parse_address(&format!("0x{}", "99".repeat(20))).unwrap(),
            Address::repeat_byte(0x99)
        );
    }

    #[test]
    fn strip_hex_prefix_only_strips_once() {
        assert_eq!(strip_hex_prefix("0xabcd"), "abcd");
        assert_eq!(strip_hex_prefix("abcd"), "abcd");
        assert_eq!(strip_hex_prefix("0x0xab"), "0xab");
    }

    #[test]
    fn deployed_unsponsored_op_omits_optional_fields() {
        let v = user_op_to_json(&op());
        assert_eq!(v["sender"], format!("0x{}", "11".repeat(20)));
        assert_eq!(v["nonce"], "0x7");
        assert_eq!(v["callData"], "0xa9059cbb");
        assert_eq!(v["callGasLimit"], "0x0");
        assert_eq!(v["maxPriorityFeePerGas"], "0x1");
        for absent in ["factory", "factoryData", "paymaster", "paymasterData", "initCode", "paymasterAndData"] {
            assert!(v.get(absent).is_none(), "{absent} should be omitted");
        }
    }

    #[test]
    fn undeployed_sponsored_op_carries_factory_and_paymaster() {
        let mut op = op();
        op.factory = Some(Address::repeat_byte(0xfa));
        op.factory_data = Bytes::from(vec![0x01]);
        op.paymaster = Some(Address::repeat_byte(0x99));
        op.paymaster_verification_gas_limit = U256::from(0x10u64);
        op.paymaster_data = Bytes::from(vec![0xee]);

        let v = user_op_to_json(&op);
        assert_eq!(v["factory"], format!("0x{}", "fa".repeat(20)));
        assert_eq!(v["factoryData"], "0x01");
        assert_eq!(v["paymaster"], format!("0x{}", "99".repeat(20)));
        assert_eq!(v["paymasterVerificationGasLimit"], "0x10");
        assert_eq!(v["paymasterPostOpGasLimit"], "0x0");
        assert_eq!(v["paymasterData"], "0xee");
    }
}
