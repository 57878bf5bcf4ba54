use crate::encoding::fmt_h256;
use crate::smart_account::SmartAccountClient;
use crate::types::Call;
use anyhow::{Context, Result};
use ethers::abi::{AbiParser, Token};
use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::{Address, Bytes, H256, U256};

/// `transfer(address,uint256)` calldata from a minimal ERC-20 fragment.
pub fn encode_transfer(to: Address, amount: U256) -> Result<Bytes> {
    let erc20 = AbiParser::default()
        .parse(&["function transfer(address to, uint256 amount) returns (bool)"])?;
    let data = erc20
        .function("transfer")?
        .encode_input(&[Token::Address(to), Token::Uint(amount)])
        .context("failed to encode transfer calldata")?;
    Ok(Bytes::from(data))
}

/// Send `amount` (smallest unit) of `token` from the smart account to
/// `target` as a single-call user operation and wait for it to be mined.
pub async fn transfer_token_with_smart_account<M, S>(
    target: Address,
    token: Address,
    amount: U256,
    client: &SmartAccountClient<M, S>,
) -> Result<H256>
where
    M: Middleware + 'static,
    S: Signer + 'static,
    S::Error: 'static,
{
    let data = encode_transfer(target, amount)?;
    tracing::info!(
        token = ?token,
        to = ?target,
        amount = %amount,
        "submitting token transfer"
    );

    let res = client.send_user_operation(&[Call::new(token, data)]).await?;
    println!("res {}", fmt_h256(res));

    client.wait_for_user_operation_transaction(res).await
}
