mod bundler;
mod config;
mod encoding;
mod para;
mod paymaster;
mod rpc;
mod signer;
mod smart_account;
mod transfer;
mod types;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::{Config, EnvSecrets, RunArgs};
use ethers::providers::{Http, Middleware, Provider};
use para::{CustodyService, ParaClient};
use signer::{CustodialAccount, RecoveryByteAdjusted};
use smart_account::{SmartAccountClient, SmartAccountOptions};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "para-aa",
    version,
    about = "Send an ERC-20 transfer from a Para-owned smart account via ERC-4337"
)]
struct Cli {
    #[command(flatten)]
    secrets: EnvSecrets,

    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // stdout is reserved for the run's results
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_args(cli.secrets, cli.run)?;

    run(cfg).await
}

async fn run(cfg: Config) -> Result<()> {
    let para = ParaClient::import_session(
        cfg.para_environment,
        cfg.para_api_key.expose(),
        cfg.para_session_token.expose(),
    )?;
    if !para.is_session_active().await? {
        return Err(anyhow!("Para session not active"));
    }
    let custody: Arc<dyn CustodyService> = Arc::new(para);

    let provider = Provider::<Http>::try_from(cfg.chain.rpc_url.as_str())
        .context("invalid chain RPC URL")?
        .interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != cfg.chain.chain_id {
        return Err(anyhow!(
            "chainId mismatch: {} is {}, RPC returned {}",
            cfg.chain.name,
            cfg.chain.chain_id,
            chain_id
        ));
    }

    let account = CustodialAccount::from_first_wallet(custody, chain_id)?
        .with_sign_strategy(Arc::new(RecoveryByteAdjusted));

    let smart_account = SmartAccountClient::connect(
        Arc::new(provider),
        account,
        chain_id,
        SmartAccountOptions {
            entrypoint: cfg.entrypoint,
            factory: cfg.factory,
            salt: cfg.salt,
            bundler_url: cfg.chain.rpc_url.clone(),
            paymaster: Some((cfg.chain.rpc_url.clone(), cfg.gas_policy_id.clone())),
            gas_multiplier_bps: cfg.gas_multiplier_bps,
            receipt_timeout: cfg.receipt_timeout,
        },
    )
    .await?;

    println!("smart account address {:?}", smart_account.address());

    let receipt = transfer::transfer_token_with_smart_account(
        cfg.recipient,
        cfg.token,
        cfg.amount,
        &smart_account,
    )
    .await?;

    println!("Transfer Token Receipt:  {}", encoding::fmt_h256(receipt));
    println!("{}", cfg.chain.explorer_tx_url(receipt));

    Ok(())
}
