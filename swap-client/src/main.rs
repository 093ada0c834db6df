use clap::{Parser, Subcommand};
use swap_client::{
    gateway::{network_name, OpenAsBuyerRequest, OpenAsSellerRequest},
    SwapClientConfig, SwapContext,
};
use swap_common::{
    derive_asset_id, hash_secret, parse_address, parse_h256, recompute_lock_id, ErrorSeverity, SwapError, U256,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "swapctl")]
#[command(about = "Hashed time-locked swap client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "swap-client.toml")]
    config: String,

    /// JSON-RPC endpoint
    #[arg(long)]
    rpc_url: Option<String>,

    /// Swap contract address
    #[arg(long)]
    contract: Option<String>,

    /// Keep every contract event, not only the connected account's
    #[arg(long)]
    global: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, print the ledger and follow new events until interrupted
    Watch,
    /// Run one backfill and print the ledger
    Refresh,
    /// Recompute a lock id
    LockId {
        token: String,
        creator: String,
        hashed_secret: String,
        timeout: u64,
    },
    /// Derive a 32-byte asset id from text
    AssetId { input: String },
    /// Hash a 32-byte secret
    HashSecret { secret: String },
    /// Token balance of the connected account
    Balance { token: String },
    /// Value held by a lock
    LockValue { lock_id: String },
    /// Current network
    Network,
    /// Open a lock as the buyer
    OpenBuyer {
        token: String,
        recipient: String,
        hashed_secret: String,
        timeout: u64,
        value: String,
        #[arg(long, default_value = "")]
        sell_asset_id: String,
        #[arg(long, default_value = "0")]
        sell_price: String,
        /// Amounts are base units
        #[arg(long)]
        raw: bool,
    },
    /// Open a lock as the seller
    OpenSeller {
        token: String,
        recipient: String,
        hashed_secret: String,
        timeout: u64,
        value: String,
        #[arg(long, default_value = "")]
        buy_asset_id: String,
        #[arg(long, default_value = "")]
        buy_lock_id: String,
        #[arg(long)]
        raw: bool,
    },
    /// Claim a lock with its secret
    Unlock {
        token: String,
        creator: String,
        secret: String,
        timeout: u64,
    },
    /// Reclaim an expired lock
    Retrieve {
        token: String,
        recipient: String,
        hashed_secret: String,
        timeout: u64,
    },
    /// Refuse a lock
    Decline {
        token: String,
        creator: String,
        hashed_secret: String,
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("swap_client={0},swap_common={0},swapctl={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Offline helpers need no configuration
    match &args.command {
        Command::LockId {
            token,
            creator,
            hashed_secret,
            timeout,
        } => {
            let lock_id = recompute_lock_id(&parse_address(token)?, &parse_address(creator)?, &parse_h256(hashed_secret)?, *timeout);
            println!("{:?}", lock_id);
            return Ok(());
        }
        Command::AssetId { input } => {
            println!("{:?}", derive_asset_id(input)?);
            return Ok(());
        }
        Command::HashSecret { secret } => {
            println!("{:?}", hash_secret(&parse_h256(secret)?));
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let mut config = SwapClientConfig::load(&args.config)?;
    if let Some(rpc_url) = args.rpc_url {
        config.network.rpc_url = rpc_url;
    }
    if let Some(contract) = args.contract {
        config.network.swap_contract = contract;
    }
    if args.global {
        config.reconciliation.listen_mode = swap_client::ListenMode::Global;
    }

    let context = SwapContext::over_http(config).map_err(report)?;
    info!("Using endpoint {}", context.config().network.rpc_url);

    if let Command::Network = args.command {
        match context.gateway().current_network().await {
            Some(network) => println!("{} ({})", network.name, network.chain_id),
            None => println!("unavailable"),
        }
        return Ok(());
    }

    let state = context.connect().await?;
    info!("Connected: {:?}", state);

    match args.command {
        Command::Watch => {
            print_ledger(&context).await?;
            let mut notifications = context.notifications();
            loop {
                tokio::select! {
                    event = notifications.recv() => match event {
                        Ok(event) => println!("{}", serde_json::to_string(&event)?),
                        Err(RecvError::Lagged(skipped)) => warn!("Notification stream skipped {} events", skipped),
                        Err(RecvError::Closed) => {
                            info!("Notification stream closed");
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }
        Command::Refresh => {
            let summary = context.refresh().await;
            info!("Refresh: {:?}", summary);
            print_ledger(&context).await?;
        }
        Command::Balance { token } => {
            let balance = context.gateway().token_balance(parse_address(&token)?).await?;
            println!("{} {} ({} base units)", balance.formatted, balance.symbol, balance.raw);
        }
        Command::LockValue { lock_id } => {
            let value: U256 = context.gateway().lock_value(parse_h256(&lock_id)?).await;
            println!("{}", value);
        }
        Command::OpenBuyer {
            token,
            recipient,
            hashed_secret,
            timeout,
            value,
            sell_asset_id,
            sell_price,
            raw,
        } => {
            let receipt = context
                .open_as_buyer(OpenAsBuyerRequest {
                    token: parse_address(&token)?,
                    recipient: parse_address(&recipient)?,
                    hashed_secret: parse_h256(&hashed_secret)?,
                    timeout_epoch_seconds: timeout,
                    value,
                    sell_asset_id,
                    sell_price,
                    value_is_raw: raw,
                    price_is_raw: raw,
                })
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::OpenSeller {
            token,
            recipient,
            hashed_secret,
            timeout,
            value,
            buy_asset_id,
            buy_lock_id,
            raw,
        } => {
            let receipt = context
                .open_as_seller(OpenAsSellerRequest {
                    token: parse_address(&token)?,
                    recipient: parse_address(&recipient)?,
                    hashed_secret: parse_h256(&hashed_secret)?,
                    timeout_epoch_seconds: timeout,
                    value,
                    buy_asset_id,
                    buy_lock_id,
                    value_is_raw: raw,
                })
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::Unlock {
            token,
            creator,
            secret,
            timeout,
        } => {
            let receipt = context
                .unlock(parse_address(&token)?, parse_address(&creator)?, parse_h256(&secret)?, timeout)
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::Retrieve {
            token,
            recipient,
            hashed_secret,
            timeout,
        } => {
            let receipt = context
                .retrieve(parse_address(&token)?, parse_address(&recipient)?, parse_h256(&hashed_secret)?, timeout)
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::Decline {
            token,
            creator,
            hashed_secret,
            timeout,
        } => {
            let receipt = context
                .decline(parse_address(&token)?, parse_address(&creator)?, parse_h256(&hashed_secret)?, timeout)
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::LockId { .. } | Command::AssetId { .. } | Command::HashSecret { .. } | Command::Network => {}
    }

    context.disconnect().await;
    info!("swapctl finished on {}", network_name(state.chain_id.unwrap_or_default()));
    Ok(())
}

fn report(err: SwapError) -> SwapError {
    match err.severity() {
        ErrorSeverity::High => error!("{}", err),
        ErrorSeverity::Medium => warn!("{}", err),
        ErrorSeverity::Low => debug!("{}", err),
    }
    err
}

async fn print_ledger(context: &SwapContext) -> anyhow::Result<()> {
    let ledger = context.ledger().await;
    info!("Ledger holds {} events", ledger.len());
    for event in ledger {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
