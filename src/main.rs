// src/main.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use ethers::prelude::*;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use kite_relayer::config::{
    DEFAULT_BUNDLER_URL, DEFAULT_CHAIN_ID, DEFAULT_ENTRY_POINT, DEFAULT_RPC_URL,
    DEFAULT_TOKEN_ADDRESS,
};
use kite_relayer::rpc::{RelayerApiServer, RelayerRpcImpl};
use kite_relayer::{
    AccountClient, Eip3009Verifier, HistoryStore, RelayerConfig, RelayerService, SdkConfig,
    TokenConfig,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short, long, env = "RPC_SERVER_ADDR", default_value = "127.0.0.1:3000")]
    rpc_server_addr: String,

    #[clap(short, long, env = "KITE_RPC_URL", default_value = DEFAULT_RPC_URL)]
    eth_rpc_url: String,

    #[clap(short, long, env = "CHAIN_ID", default_value_t = DEFAULT_CHAIN_ID)]
    chain_id: u64,

    /// Key that pays gas for relayed transfers.
    #[clap(long, env = "RELAYER_PRIVATE_KEY", hide_env_values = true)]
    relayer_private_key: String,

    /// Key that signs transfer authorizations and owns the AA wallet.
    #[clap(long, env = "USER_PRIVATE_KEY", hide_env_values = true)]
    user_private_key: Option<String>,

    #[clap(long, env = "TOKEN_ADDRESS", default_value = DEFAULT_TOKEN_ADDRESS)]
    token_address: String,

    #[clap(long, env = "BUNDLER_URL", default_value = DEFAULT_BUNDLER_URL)]
    bundler_url: String,

    #[clap(long, env = "ENTRY_POINT_ADDRESS", default_value = DEFAULT_ENTRY_POINT)]
    entry_point: String,

    /// Smart account driven by `relayer_aaWalletTransfer`.
    #[clap(long, env = "AA_WALLET_ADDRESS")]
    aa_wallet_address: Option<String>,

    #[clap(long, env = "HISTORY_PATH", default_value = "transfer-limits.json")]
    history_path: PathBuf,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Args::parse();

    let level: Level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let token = TokenConfig {
        address: args.token_address.parse().context("invalid TOKEN_ADDRESS")?,
        ..TokenConfig::default()
    };
    let config = RelayerConfig {
        rpc_url: args.eth_rpc_url.clone(),
        chain_id: args.chain_id,
        token,
        history_path: args.history_path.clone(),
    };

    let relayer = RelayerService::connect(&config, &args.relayer_private_key).await?;
    let verifier = Eip3009Verifier::from_config(&config.token, config.chain_id);
    let history = HistoryStore::new(&config.history_path);

    let mut relayer_rpc = RelayerRpcImpl::new(
        Arc::new(relayer),
        verifier,
        Arc::new(history),
        config.token.clone(),
    );

    match args.user_private_key.as_deref() {
        Some(key) => {
            let wallet: LocalWallet = key.parse().context("invalid USER_PRIVATE_KEY")?;
            info!("User wallet: {:?}", wallet.address());
            relayer_rpc = relayer_rpc.with_user_wallet(wallet.with_chain_id(args.chain_id));
        }
        None => warn!("USER_PRIVATE_KEY not set, transfer endpoints are disabled"),
    }

    if let Some(account) = args.aa_wallet_address.as_deref() {
        let sdk_config = SdkConfig {
            rpc_url: args.eth_rpc_url.clone(),
            bundler_url: args.bundler_url.clone(),
            entry_point: args.entry_point.parse().context("invalid ENTRY_POINT_ADDRESS")?,
            account: account.parse().context("invalid AA_WALLET_ADDRESS")?,
            chain_id: args.chain_id,
        };
        let mut client = AccountClient::new(sdk_config)?;
        let strategy = client.builder_mut().probe_hash_strategy().await;
        info!("AA wallet {} using {:?} user operation hashing", account, strategy);
        relayer_rpc = relayer_rpc.with_account(Arc::new(client));
    }

    let server_addr: SocketAddr = args.rpc_server_addr.parse()?;
    info!("Starting gasless transfer relayer RPC server on {}", server_addr);

    let server_handle = start_server(server_addr, relayer_rpc).await?;

    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn start_server(
    server_addr: SocketAddr,
    relayer_rpc: RelayerRpcImpl,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    let server_handle = server.start(relayer_rpc.into_rpc());

    Ok(server_handle)
}
