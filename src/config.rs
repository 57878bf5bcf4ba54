use crate::para::Environment;
use anyhow::{anyhow, Context, Result};
use clap::Args;
use ethers::types::{Address, H256, U256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// EntryPoint v0.7.
pub const DEFAULT_ENTRYPOINT: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";
/// Modular Account v2 factory (semi-modular accounts).
pub const DEFAULT_FACTORY: &str = "0x00000000000017c61b5bEe81050EC8eFc9c6fecd";
pub const DEFAULT_RECIPIENT: &str = "0x7EE314Ba3dc6e4a34eeBF17c5034DecDa4Fb5D1e";
pub const DEFAULT_TOKEN: &str = "0xf817257fed379853cDe0fa4F97AB987181B1E5Ea";
pub const DEFAULT_AMOUNT: &str = "1000000";

const MONAD_TESTNET_CHAIN_ID: u64 = 10143;

/// Credentials. Each is required; they are optional here only so a missing one
/// can be reported by its environment variable name.
#[derive(Args, Clone, Default)]
pub struct EnvSecrets {
    /// Para API key.
    #[arg(long, env = "PARA_API_KEY", hide_env_values = true)]
    pub para_api_key: Option<String>,

    /// Exported Para session (base64).
    #[arg(long, env = "PARA_SESSION_TOKEN", hide_env_values = true)]
    pub para_session_token: Option<String>,

    /// Alchemy API key (chain RPC, bundler and Gas Manager).
    #[arg(long, env = "ALCHEMY_API_KEY", hide_env_values = true)]
    pub alchemy_api_key: Option<String>,

    /// Alchemy Gas Manager policy id.
    #[arg(long, env = "ALCHEMY_GAS_POLICY_ID")]
    pub alchemy_gas_policy_id: Option<String>,
}

impl fmt::Debug for EnvSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSecrets")
            .field("para_api_key", &self.para_api_key.as_ref().map(|_| "<redacted>"))
            .field(
                "para_session_token",
                &self.para_session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("alchemy_api_key", &self.alchemy_api_key.as_ref().map(|_| "<redacted>"))
            .field("alchemy_gas_policy_id", &self.alchemy_gas_policy_id)
            .finish()
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Para API environment.
    #[arg(long, value_enum, env = "PARA_ENVIRONMENT", default_value_t = Environment::Beta)]
    pub para_environment: Environment,

    /// Recipient of the token transfer.
    #[arg(long, default_value = DEFAULT_RECIPIENT)]
    pub recipient: String,

    /// ERC-20 token contract.
    #[arg(long, default_value = DEFAULT_TOKEN)]
    pub token: String,

    /// Amount in the token's smallest unit.
    #[arg(long, default_value = DEFAULT_AMOUNT)]
    pub amount: String,

    /// EntryPoint (v0.7) address.
    #[arg(long, env = "PARA_AA_ENTRYPOINT", default_value = DEFAULT_ENTRYPOINT)]
    pub entrypoint: String,

    /// Modular Account v2 factory address.
    #[arg(long, env = "PARA_AA_FACTORY", default_value = DEFAULT_FACTORY)]
    pub factory: String,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    pub salt: u64,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    #[arg(long, default_value_t = 10_000)]
    pub gas_multiplier_bps: u64,

    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    pub max_wait_seconds: u64,
}

#[derive(Clone)]
pub struct ChainConfig {
    pub name: &'static str,
    pub chain_id: u64,
    /// Chain RPC; on Alchemy this also serves bundler and paymaster methods.
    pub rpc_url: String,
    explorer_tx_base: &'static str,
}

// rpc_url embeds the API key
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl ChainConfig {
    pub fn monad_testnet(alchemy_api_key: &str) -> Self {
        Self {
            name: "monad-testnet",
            chain_id: MONAD_TESTNET_CHAIN_ID,
            rpc_url: format!("https://monad-testnet.g.alchemy.com/v2/{alchemy_api_key}"),
            explorer_tx_base: "https://testnet.monadexplorer.com/tx/",
        }
    }

    pub fn explorer_tx_url(&self, tx_hash: H256) -> String {
        format!("{}{}", self.explorer_tx_base, crate::encoding::fmt_h256(tx_hash))
    }
}

/// A credential that stays out of `Debug` output.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Everything the run needs, resolved once at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    pub para_environment: Environment,
    pub para_api_key: Secret,
    pub para_session_token: Secret,
    pub gas_policy_id: String,
    pub chain: ChainConfig,

    pub entrypoint: Address,
    pub factory: Address,
    pub salt: U256,
    pub gas_multiplier_bps: u64,
    pub receipt_timeout: Duration,

    pub recipient: Address,
    pub token: Address,
    pub amount: U256,
}

impl Config {
    pub fn from_args(secrets: EnvSecrets, run: RunArgs) -> Result<Self> {
        let para_api_key = require(secrets.para_api_key, "PARA_API_KEY")?;
        let para_session_token = require(secrets.para_session_token, "PARA_SESSION_TOKEN")?;
        let alchemy_api_key = require(secrets.alchemy_api_key, "ALCHEMY_API_KEY")?;
        let gas_policy_id = require(secrets.alchemy_gas_policy_id, "ALCHEMY_GAS_POLICY_ID")?;

        let amount = U256::from_dec_str(&run.amount)
            .with_context(|| format!("invalid --amount (expected integer): {}", run.amount))?;
        if amount.is_zero() {
            return Err(anyhow!("--amount must be > 0"));
        }

        if run.gas_multiplier_bps == 0 {
            return Err(anyhow!("--gas-multiplier-bps must be > 0"));
        }

        Ok(Self {
            para_environment: run.para_environment,
            para_api_key: Secret(para_api_key),
            para_session_token: Secret(para_session_token),
            gas_policy_id,
            chain: ChainConfig::monad_testnet(&alchemy_api_key),
            entrypoint: parse_addr(&run.entrypoint).context("invalid --entrypoint address")?,
            factory: parse_addr(&run.factory).context("invalid --factory address")?,
            salt: U256::from(run.salt),
            gas_multiplier_bps: run.gas_multiplier_bps,
            receipt_timeout: Duration::from_secs(run.max_wait_seconds),
            recipient: parse_addr(&run.recipient).context("invalid --recipient address")?,
            token: parse_addr(&run.token).context("invalid --token address")?,
            amount,
        })
    }
}

fn require(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("{name} is required"))
}

fn parse_addr(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["para-aa"];
        argv.extend_from_slice(extra);
        TestCli::try_parse_from(argv).unwrap().run
    }

    fn secrets() -> EnvSecrets {
        EnvSecrets {
            para_api_key: Some("para-key".into()),
            para_session_token: Some("c2Vzc2lvbg==".into()),
            alchemy_api_key: Some("alchemy-key".into()),
            alchemy_gas_policy_id: Some("policy".into()),
        }
    }

    #[test]
    fn defaults_match_the_demo_transfer() {
        let cfg = Config::from_args(secrets(), run_args(&[])).unwrap();

        assert_eq!(cfg.chain.chain_id, 10143);
        assert_eq!(
            cfg.chain.rpc_url,
            "https://monad-testnet.g.alchemy.com/v2/alchemy-key"
        );
        assert_eq!(cfg.recipient, DEFAULT_RECIPIENT.parse::<Address>().unwrap());
        assert_eq!(cfg.token, DEFAULT_TOKEN.parse::<Address>().unwrap());
        assert_eq!(cfg.amount, U256::from(1_000_000u64));
        assert_eq!(cfg.gas_policy_id, "policy");
        assert_eq!(cfg.receipt_timeout, Duration::from_secs(180));
        assert_eq!(
            cfg.entrypoint,
            "0x0000000071727De22E5E9d8BAf0edAc6f37da032".parse::<Address>().unwrap()
        );
        assert_eq!(cfg.salt, U256::zero());
    }

    #[test]
    fn each_missing_secret_is_named() {
        let cases: [(&str, fn(&mut EnvSecrets)); 4] = [
            ("PARA_API_KEY", |s| s.para_api_key = None),
            ("PARA_SESSION_TOKEN", |s| s.para_session_token = None),
            ("ALCHEMY_API_KEY", |s| s.alchemy_api_key = Some("  ".into())),
            ("ALCHEMY_GAS_POLICY_ID", |s| s.alchemy_gas_policy_id = None),
        ];

        for (name, clear) in cases {
            let mut s = secrets();
            clear(&mut s);
            let err = Config::from_args(s, run_args(&[])).unwrap_err();
            assert_eq!(err.to_string(), format!("{name} is required"));
        }
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        assert!(Config::from_args(secrets(), run_args(&["--amount", "1.5"])).is_err());
        assert!(Config::from_args(secrets(), run_args(&["--amount", "0"])).is_err());
        assert!(Config::from_args(secrets(), run_args(&["--recipient", "0x1234"])).is_err());
        assert!(Config::from_args(secrets(), run_args(&["--gas-multiplier-bps", "0"])).is_err());
    }

    #[test]
    fn explorer_link_and_debug_hide_key() {
        let chain = ChainConfig::monad_testnet("secret-key");
        let tx = H256::repeat_byte(0xab);
        assert_eq!(
            chain.explorer_tx_url(tx),
            format!("https://testnet.monadexplorer.com/tx/0x{}", "ab".repeat(32))
        );
        assert!(!format!("{chain:?}").contains("secret-key"));
        assert!(!format!("{:?}", secrets()).contains("para-key"));

        let cfg = Config::from_args(secrets(), run_args(&[])).unwrap();
        assert_eq!(cfg.para_api_key.expose(), "para-key");
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("para-key"));
        assert!(!rendered.contains("alchemy-key"));
    }
}
