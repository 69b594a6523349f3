use battle_royale::{
    ConnectOutcome,
    SessionContext,
    SubmitOutcome,
    alert,
    config::{
        AppConfig,
        DEFAULT_CONTRACT_ADDRESS,
        DEFAULT_POLL_INTERVAL,
        NetworkTarget,
        WalletConfig,
        default_data_dir,
        resolve_dir,
    },
    evm::EvmConnector,
    gateway::{
        CallOptions,
        ContractCall,
        DEFAULT_CONFIRMATION_TIMEOUT,
        DEFAULT_GAS_LIMIT,
    },
    preferences::PreferenceStore,
    types::{
        Account,
        GameView,
    },
    wallets::{
        KeystoreWallet,
        find_wallet,
        list_wallets,
        resolve_wallet_dir,
        unlock_wallet,
    },
};
use clap::{
    ArgGroup,
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use rand::Rng;
use std::{
    path::Path,
    sync::Arc,
    time::Duration,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

#[derive(Parser, Debug)]
#[command(
    name = "battle-royale",
    about = "Play the on-chain card battle game from the command line",
    version,
    group(
        ArgGroup::new("network")
            .args(["testnet", "local"])
            .required(true)
    )
)]
struct Args {
    /// Use the public testnet
    #[arg(long)]
    testnet: bool,

    /// Use a local development node
    #[arg(long)]
    local: bool,

    /// Override RPC URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Game contract address
    #[arg(long, default_value = DEFAULT_CONTRACT_ADDRESS)]
    contract: String,

    /// Keystore name inside the wallet directory
    #[arg(long)]
    wallet: Option<String>,

    /// Override keystore directory (defaults to ~/.foundry/keystores)
    #[arg(long)]
    wallet_dir: Option<String>,

    /// Gas ceiling for every transaction
    #[arg(long, default_value_t = DEFAULT_GAS_LIMIT)]
    gas_limit: u64,

    /// Seconds to wait for a transaction to confirm
    #[arg(long, default_value_t = DEFAULT_CONFIRMATION_TIMEOUT.as_secs())]
    tx_timeout_secs: u64,

    /// Milliseconds between event log polls
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    poll_interval_ms: u64,

    /// Where preferences and logs live (defaults to ~/.battle-royale)
    #[arg(long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and follow the game view until interrupted
    Watch,
    /// Register the wallet as a player
    Register { name: String },
    /// Open a new battle
    CreateBattle {
        /// Card to play with
        #[arg(long)]
        card: u64,
        /// Battle id (random when omitted)
        #[arg(long)]
        id: Option<u64>,
        #[arg(long)]
        computer_card: Option<u64>,
        #[arg(long)]
        player_stat: Option<u64>,
        #[arg(long)]
        computer_stat: Option<u64>,
    },
    /// Join a battle waiting for an opponent
    Join { name: String },
    /// Print the current game view as JSON
    Battles,
    /// List keystores in the wallet directory
    Wallets,
    /// Show or change the preferred battleground
    Battleground { id: Option<String> },
}

impl Args {
    fn network(&self) -> NetworkTarget {
        if self.testnet {
            NetworkTarget::testnet(self.rpc_url.clone())
        } else {
            NetworkTarget::local(self.rpc_url.clone())
        }
    }

    fn into_config(self) -> Result<(AppConfig, Command)> {
        let network = self.network();
        let contract: Account = self
            .contract
            .parse()
            .map_err(|err| eyre!("--contract: {err}"))?;
        let name = self
            .wallet
            .clone()
            .ok_or_else(|| eyre!("Specify --wallet <name> to select a keystore"))?;
        let dir = resolve_wallet_dir(self.wallet_dir.as_deref())?;
        let data_dir = resolve_dir(self.data_dir.as_deref(), default_data_dir)?;
        let config = AppConfig {
            network,
            contract,
            wallet: WalletConfig::Keystore { name, dir },
            call_options: CallOptions {
                gas_limit: self.gas_limit,
                confirmation_timeout: Duration::from_secs(self.tx_timeout_secs),
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            data_dir,
        };
        Ok((config, self.command))
    }
}

fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let appender = rolling::daily(log_dir, "battle-royale.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    // Commands that never touch a wallet.
    match &args.command {
        Command::Battleground { id } => {
            let data_dir = resolve_dir(args.data_dir.as_deref(), default_data_dir)?;
            return battleground(&data_dir, id.as_deref());
        }
        Command::Wallets => {
            let dir = resolve_wallet_dir(args.wallet_dir.as_deref())?;
            for wallet in list_wallets(&dir)? {
                println!("{}\t{}", wallet.name, wallet.path.display());
            }
            return Ok(());
        }
        _ => {}
    }

    let (config, command) = args.into_config()?;
    std::fs::create_dir_all(&config.data_dir)
        .wrap_err_with(|| format!("Failed to create {}", config.data_dir.display()))?;
    let _guard = init_tracing(&config.data_dir.join("logs"));
    tracing::info!(network = %config.network, "starting battle-royale client");

    let context = build_context(&config).await?;
    let result = run(&context, command).await;
    context.shutdown();
    result
}

fn battleground(data_dir: &Path, id: Option<&str>) -> Result<()> {
    let store = PreferenceStore::new(data_dir);
    match id {
        Some(id) => {
            store.save_battleground(id)?;
            println!("{}", id.trim());
        }
        None => println!("{}", store.load_battleground()?),
    }
    Ok(())
}

type CliContext = SessionContext<KeystoreWallet, EvmConnector>;

async fn build_context(config: &AppConfig) -> Result<Arc<CliContext>> {
    let WalletConfig::Keystore { name, dir } = &config.wallet;
    let descriptor = find_wallet(dir, name)?;
    let wallet = unlock_wallet(&descriptor)?;
    let connector =
        EvmConnector::connect(config.network.url(), &config.contract, config.poll_interval)
            .await?;
    let chain_id = connector.chain_id();
    let context = SessionContext::init(
        KeystoreWallet::new(wallet),
        connector,
        PreferenceStore::new(&config.data_dir),
        config.context_options(),
    )?;
    match context.connect().await {
        Ok(ConnectOutcome::Connected(account)) => {
            println!("Connected as {account} on chain {chain_id}");
            Ok(context)
        }
        Ok(ConnectOutcome::Superseded) => {
            Err(eyre!("Wallet session ended while connecting"))
        }
        Err(err) => {
            tracing::warn!(?err, "wallet connection failed");
            Err(eyre!("{}", alert::decode(&err).message))
        }
    }
}

async fn run(context: &CliContext, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch(context).await,
        Command::Register { name } => {
            submit(context, ContractCall::RegisterPlayer { name }).await
        }
        Command::CreateBattle {
            card,
            id,
            computer_card,
            player_stat,
            computer_stat,
        } => {
            let mut rng = rand::rng();
            let call = ContractCall::CreateBattle {
                id: id.unwrap_or_else(|| rng.random_range(0..10_000)),
                player_card_id: card,
                computer_card_id: computer_card.unwrap_or_else(|| rng.random_range(0..1_000)),
                player_stat_value: player_stat.unwrap_or_else(|| rng.random_range(0..100)),
                computer_stat_value: computer_stat
                    .unwrap_or_else(|| rng.random_range(0..100)),
            };
            submit(context, call).await
        }
        Command::Join { name } => submit(context, ContractCall::JoinBattle { name }).await,
        Command::Battles => {
            print_view(&context.game_view())?;
            Ok(())
        }
        Command::Battleground { .. } | Command::Wallets => Ok(()),
    }
}

async fn submit(context: &CliContext, call: ContractCall) -> Result<()> {
    match context.submit(call).await {
        Ok(SubmitOutcome::Confirmed(receipt)) => {
            println!("{}", context.alert().message);
            println!("tx {}", receipt.tx_hash);
            Ok(())
        }
        Ok(SubmitOutcome::Discarded) => {
            println!("Session changed before the transaction settled");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(?err, "transaction not applied");
            Err(eyre!("{}", alert::decode(&err).message))
        }
    }
}

fn print_view(view: &GameView) -> Result<()> {
    let json = serde_json::to_string_pretty(view).wrap_err("Failed to render game view")?;
    println!("{json}");
    Ok(())
}

async fn watch(context: &CliContext) -> Result<()> {
    let mut views = context.watch_game_view();
    let mut alerts = context.watch_alert();
    print_view(&views.borrow_and_update())?;
    loop {
        tokio::select! {
            changed = views.changed() => {
                changed.wrap_err("game view closed")?;
                print_view(&views.borrow_and_update())?;
            }
            changed = alerts.changed() => {
                changed.wrap_err("alerts closed")?;
                let alert = alerts.borrow_and_update().clone();
                if alert.status {
                    println!("[{:?}] {}", alert.kind, alert.message);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                return Ok(());
            }
        }
    }
}
