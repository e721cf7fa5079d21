// src/main.rs
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, time::Duration};

use ledger_extrinsic_signer::{
    ledger::{LedgerSigner, TcpApduTransport},
    metadata::HttpMetadataService,
    CallPayload, DerivationPath, EraPolicy, NetworkRegistry, OrchestratorConfig,
    OrchestratorState, SigningError, SigningOrchestrator, SubxtChainClient,
};

/// Sign Polkadot / Kusama extrinsics on a Ledger device and submit them.
#[derive(Parser, Debug)]
#[command(name = "ledger-extrinsic-signer", version, about)]
struct Cli {
    /// JSON network table replacing the built-in polkadot/kusama profiles
    #[arg(long, global = true, env = "NETWORKS_FILE")]
    networks: Option<PathBuf>,

    /// Address of the Ledger APDU TCP transport (Speculos or HID proxy)
    #[arg(long, global = true, env = "LEDGER_PROXY_ADDR", default_value = "127.0.0.1:9999")]
    ledger: String,

    /// Seconds to wait for the device to answer, including user confirmation
    #[arg(long, global = true, default_value_t = 300)]
    device_timeout_secs: u64,

    /// Seconds to wait for a terminal status after submission
    #[arg(long, global = true, default_value_t = 120)]
    finality_timeout_secs: u64,

    /// Make the transaction mortal for this many blocks after the latest
    /// finalized block (immortal by default)
    #[arg(long, global = true)]
    mortal_period: Option<u64>,

    /// Display the derived address on the device for confirmation
    #[arg(long, global = true)]
    show_address: bool,

    /// Override the RPC endpoint of the selected network
    #[arg(long, global = true, env = "RPC_URL")]
    rpc: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct AccountArgs {
    /// Network name from the network table (e.g. polkadot, kusama)
    #[arg(long)]
    network: String,

    /// Account type, the account segment of m/44'/354'/account'/0'/index'
    #[arg(long, default_value_t = 0)]
    account: u32,

    /// Address index, the last segment of the derivation path
    #[arg(long, default_value_t = 0)]
    index: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// balances.transferKeepAlive
    Transfer {
        #[command(flatten)]
        account: AccountArgs,

        /// SS58 address of the recipient
        #[arg(long)]
        recipient: String,

        /// Amount in plancks
        #[arg(long)]
        amount: u128,
    },
    /// staking.bondExtra
    Bond {
        #[command(flatten)]
        account: AccountArgs,

        /// Additional amount to bond, in plancks
        #[arg(long)]
        amount: u128,
    },
}

impl Command {
    fn account(&self) -> &AccountArgs {
        match self {
            Command::Transfer { account, .. } | Command::Bond { account, .. } => account,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let registry = match &cli.networks {
        Some(path) => NetworkRegistry::from_json_file(path)
            .with_context(|| format!("loading network table {}", path.display()))?,
        None => NetworkRegistry::default(),
    };

    let account = cli.command.account();
    let profile = registry.lookup(&account.network)?.clone();
    let path = DerivationPath::for_account(account.account, account.index)?;

    let call = match &cli.command {
        Command::Transfer {
            recipient, amount, ..
        } => CallPayload::transfer_keep_alive(&profile, recipient, *amount)?,
        Command::Bond { amount, .. } => CallPayload::bond_extra(&profile, *amount)?,
    };

    let metadata = HttpMetadataService::new(&profile.metadata_service_url, Duration::from_secs(30))?;

    let rpc_url = cli.rpc.as_deref().unwrap_or(&profile.rpc_endpoint);
    let chain = SubxtChainClient::connect(rpc_url).await?;

    let transport = TcpApduTransport::connect(&cli.ledger, Duration::from_secs(cli.device_timeout_secs))
        .await
        .map_err(|e| SigningError::SignerUnavailable(format!("{}: {}", cli.ledger, e)))?;
    let signer = LedgerSigner::open(transport, metadata.clone(), profile.chain_id.clone())
        .await?
        .with_show_address(cli.show_address);

    let config = OrchestratorConfig {
        finality_timeout: Duration::from_secs(cli.finality_timeout_secs),
        era: match cli.mortal_period {
            Some(period) => EraPolicy::Mortal { period },
            None => EraPolicy::Immortal,
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator =
        SigningOrchestrator::new(&registry, &account.network, config, &chain, &metadata, &signer)?;

    match orchestrator.run(path, &call).await {
        Ok(finalized) => {
            log::info!("📤 RESULT:");
            log::info!("   Extrinsic hash: 0x{}", hex::encode(finalized.extrinsic_hash));
            log::info!("   Block hash: 0x{}", hex::encode(finalized.block_hash));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            log::error!("📤 RESULT: {}", err);
            if err.is_resumable() {
                log::info!("   Nothing was signed; the run can be retried as is");
            } else if err.state == OrchestratorState::Rejected {
                log::info!("   The node refused the extrinsic; it will not be included");
            } else if let Some(tx) = &err.progress.signed_transaction {
                log::info!(
                    "   Signed extrinsic 0x{} may still be included, re-check the account nonce",
                    hex::encode(tx.hash())
                );
            }
            Ok(match err.state {
                OrchestratorState::TimedOut => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            })
        }
    }
}
