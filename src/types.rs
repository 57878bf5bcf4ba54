use anyhow::{bail, Result};
use ethers::types::{Address, Bytes, H256, U256};

/// One call executed by the smart account on behalf of a user operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    /// A call that moves no native value.
    pub fn new(target: Address, data: Bytes) -> Self {
        Self {
            target,
            value: U256::zero(),
            data,
        }
    }
}

/// ERC-4337 UserOperation for EntryPoint v0.7, in the unpacked form bundlers
/// and paymasters speak over JSON-RPC.
///
/// `factory` is set only while the account is undeployed; `paymaster` only
/// once sponsorship data has been attached.
#[derive(Clone, Debug)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<Address>,
    pub factory_data: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster: Option<Address>,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
    pub paymaster_data: Bytes,
    pub signature: Bytes,
}

/// On-chain `PackedUserOperation`, for `EntryPoint.getUserOpHash((...))`.
pub type PackedUserOperationTuple = (Address, U256, Bytes, Bytes, H256, U256, H256, Bytes, Bytes);

impl UserOperation {
    /// Unsponsored operation with zeroed gas limits, ready for paymaster stub
    /// data and bundler estimation.
    pub fn draft(
        sender: Address,
        nonce: U256,
        factory: Option<(Address, Bytes)>,
        call_data: Bytes,
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
        signature: Bytes,
    ) -> Self {
        let (factory, factory_data) = match factory {
            Some((addr, data)) => (Some(addr), data),
            None => (None, Bytes::default()),
        };
        Self {
            sender,
            nonce,
            factory,
            factory_data,
            call_data,
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster: None,
            paymaster_verification_gas_limit: U256::zero(),
            paymaster_post_op_gas_limit: U256::zero(),
            paymaster_data: Bytes::default(),
            signature,
        }
    }

    /// `factory || factoryData`, or empty for a deployed account.
    pub fn init_code(&self) -> Bytes {
        match self.factory {
            Some(factory) => concat(&[factory.as_bytes(), self.factory_data.as_ref()]),
            None => Bytes::default(),
        }
    }

    /// `paymaster || uint128 verificationGas || uint128 postOpGas || paymasterData`.
    pub fn paymaster_and_data(&self) -> Result<Bytes> {
        let Some(paymaster) = self.paymaster else {
            return Ok(Bytes::default());
        };
        let verification = u128_be(self.paymaster_verification_gas_limit)?;
        let post_op = u128_be(self.paymaster_post_op_gas_limit)?;
        Ok(concat(&[
            paymaster.as_bytes(),
            &verification,
            &post_op,
            self.paymaster_data.as_ref(),
        ]))
    }

    pub fn as_packed_tuple(&self) -> Result<PackedUserOperationTuple> {
        Ok((
            self.sender,
            self.nonce,
            self.init_code(),
            self.call_data.clone(),
            pack_u128_pair(self.verification_gas_limit, self.call_gas_limit)?,
            self.pre_verification_gas,
            pack_u128_pair(self.max_priority_fee_per_gas, self.max_fee_per_gas)?,
            self.paymaster_and_data()?,
            self.signature.clone(),
        ))
    }
}

/// Two uint128 values in one word, `high` first (`accountGasLimits`, `gasFees`).
pub fn pack_u128_pair(high: U256, low: U256) -> Result<H256> {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&u128_be(high)?);
    word[16..].copy_from_slice(&u128_be(low)?);
    Ok(H256(word))
}

fn u128_be(v: U256) -> Result<[u8; 16]> {
    if v.bits() > 128 {
        bail!("{v} does not fit in uint128");
    }
    Ok(v.as_u128().to_be_bytes())
}

fn concat(parts: &[&[u8]]) -> Bytes {
    Bytes::from(parts.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> UserOperation {
        UserOperation::draft(
            Address::repeat_byte(0x11),
            U256::one(),
            None,
            Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            U256::from(200u64),
            U256::from(100u64),
            Bytes::default(),
        )
    }

    #[test]
    fn gas_words_put_high_half_first() {
        let word = pack_u128_pair(U256::from(0x0a0bu64), U256::from(0x0c0du64)).unwrap();
        assert_eq!(&word[14..16], &[0x0a, 0x0b]);
        assert_eq!(&word[30..32], &[0x0c, 0x0d]);
        assert!(word[..14].iter().all(|b| *b == 0));

        assert!(pack_u128_pair(U256::MAX, U256::zero()).is_err());
    }

    #[test]
    fn init_code_only_for_undeployed_accounts() {
        assert!(op().init_code().is_empty());

        let mut undeployed = op();
        undeployed.factory = Some(Address::repeat_byte(0xfa));
        undeployed.factory_data = Bytes::from(vec![1, 2, 3]);
        let init_code = undeployed.init_code();
        assert_eq!(&init_code[..20], Address::repeat_byte(0xfa).as_bytes());
        assert_eq!(&init_code[20..], &[1, 2, 3]);
    }

    #[test]
    fn paymaster_and_data_layout() {
        let mut sponsored = op();
        assert!(sponsored.paymaster_and_data().unwrap().is_empty());

        sponsored.paymaster = Some(Address::repeat_byte(0x99));
        sponsored.paymaster_verification_gas_limit = U256::from(0x0102u64);
        sponsored.paymaster_post_op_gas_limit = U256::from(0x03u64);
        sponsored.paymaster_data = Bytes::from(vec![0xee; 5]);

        let pmd = sponsored.paymaster_and_data().unwrap();
        assert_eq!(pmd.len(), 20 + 16 + 16 + 5);
        assert_eq!(&pmd[..20], Address::repeat_byte(0x99).as_bytes());
        assert_eq!(&pmd[34..36], &[0x01, 0x02]);
        assert_eq!(pmd[51], 0x03);
        assert_eq!(&pmd[52..], &[0xee; 5]);
    }

    #[test]
    fn packed_tuple_orders_fee_fields() {
        let (_, _, _, _, gas_limits, _, gas_fees, _, _) = op().as_packed_tuple().unwrap();
        assert_eq!(gas_limits, H256::zero());
        // maxPriorityFeePerGas in the high half, maxFeePerGas in the low half
        assert_eq!(gas_fees[15], 100);
        assert_eq!(gas_fees[31], 200);
    }
}
