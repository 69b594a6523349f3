use crate::{
    alert::REVERT_PREFIX,
    error::SessionError,
    gateway::{
        BattleEventKind,
        ChainError,
        ContractCall,
        ContractEvent,
        ContractHandle,
        Receipt,
    },
    types::{
        Account,
        Battle,
        BattleStatus,
    },
    wallet_session::ContractConnector,
};
use ethers::{
    contract::{
        ContractError,
        EthEvent,
    },
    middleware::SignerMiddleware,
    providers::{
        Http,
        Middleware,
        Provider,
    },
    signers::{
        LocalWallet,
        Signer,
    },
    types::{
        Address,
        Filter,
        H256,
        Log,
        U64,
        U256,
    },
};
use futures::{
    StreamExt,
    channel::mpsc,
    stream::BoxStream,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::time;
use tracing::{
    debug,
    info,
    warn,
};

pub mod abi {
    ethers::contract::abigen!(
        TradingCardGame,
        r#"[
            struct Battle { uint8 battleStatus; string name; address[2] players; address winner; }
            function registerPlayer(string name)
            function createBattle(uint256 id, uint256 playerCardId, uint256 computerCardId, uint256 playerStatValue, uint256 computerStatValue)
            function joinBattle(string name)
            function getAllBattles() view returns (Battle[])
            function isPlayer(address addr) view returns (bool)
            event NewPlayer(address indexed owner, string name)
            event NewBattle(string battleName, address indexed player1, address indexed player2)
            event BattleJoined(string battleName, address indexed player)
            event BattleMove(string indexed battleName, bool indexed isFirstMove)
            event RoundEnded(address[2] damagedPlayers)
            event BattleEnded(string battleName, address indexed winner, address indexed loser)
        ]"#
    );
}

pub type SignedClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Maps a log's first topic to the lifecycle event it announces.
pub fn classify(topic: &H256) -> Option<BattleEventKind> {
    let kinds = [
        (abi::NewPlayerFilter::signature(), BattleEventKind::NewPlayer),
        (abi::NewBattleFilter::signature(), BattleEventKind::NewBattle),
        (abi::BattleJoinedFilter::signature(), BattleEventKind::BattleJoined),
        (abi::BattleMoveFilter::signature(), BattleEventKind::BattleMove),
        (abi::RoundEndedFilter::signature(), BattleEventKind::RoundEnded),
        (abi::BattleEndedFilter::signature(), BattleEventKind::BattleEnded),
    ];
    kinds
        .into_iter()
        .find_map(|(signature, kind)| (signature == *topic).then_some(kind))
}

fn contract_error(err: ContractError<SignedClient>) -> ChainError {
    if let Some(reason) = err.decode_revert::<String>() {
        return ChainError::reverted(format!("{REVERT_PREFIX}{reason}"));
    }
    ChainError::message(err.to_string())
}

fn provider_error(err: impl std::fmt::Display) -> ChainError {
    ChainError::message(err.to_string())
}

/// `getAllBattles()` entry as decoded: status, name, player slots, winner.
type RawBattle = (u8, String, [Address; 2], Address);

fn to_battle(id: usize, raw: RawBattle) -> Result<Battle, ChainError> {
    let (code, name, players, winner) = raw;
    let status = BattleStatus::from_code(code).ok_or_else(|| {
        ChainError::message(format!("battle {id} has unknown status {code}"))
    })?;
    Ok(Battle {
        id: id as u64,
        name,
        players: players
            .into_iter()
            .filter(|player| !player.is_zero())
            .map(Account::from)
            .collect(),
        status,
        winner: Account::from(winner),
    })
}

/// Contract binding over JSON-RPC for one local signer.
#[derive(Clone)]
pub struct EvmContractHandle {
    contract: abi::TradingCardGame<SignedClient>,
    poll_interval: Duration,
}

impl ContractHandle for EvmContractHandle {
    async fn execute(
        &self,
        call: &ContractCall,
        gas_limit: u64,
    ) -> Result<Receipt, ChainError> {
        let tx = match call {
            ContractCall::RegisterPlayer { name } => {
                self.contract.register_player(name.trim().to_owned())
            }
            ContractCall::CreateBattle {
                id,
                player_card_id,
                computer_card_id,
                player_stat_value,
                computer_stat_value,
            } => self.contract.create_battle(
                U256::from(*id),
                U256::from(*player_card_id),
                U256::from(*computer_card_id),
                U256::from(*player_stat_value),
                U256::from(*computer_stat_value),
            ),
            ContractCall::JoinBattle { name } => {
                self.contract.join_battle(name.trim().to_owned())
            }
        }
        .gas(gas_limit);

        let pending = tx.send().await.map_err(contract_error)?;
        let tx_hash = pending.tx_hash();
        debug!(tx_hash = ?tx_hash, "transaction sent; waiting for receipt");
        let receipt = pending
            .await
            .map_err(provider_error)?
            .ok_or_else(|| ChainError::message(format!("transaction {tx_hash:?} was dropped")))?;
        if receipt.status == Some(U64::zero()) {
            return Err(ChainError::reverted("execution reverted"));
        }
        Ok(Receipt {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_number: receipt.block_number.map(|block| block.as_u64()),
        })
    }

    async fn all_battles(&self) -> Result<Vec<Battle>, ChainError> {
        let raw = self
            .contract
            .get_all_battles()
            .call()
            .await
            .map_err(contract_error)?;
        raw.into_iter()
            .enumerate()
            .map(|(id, battle)| to_battle(id, battle))
            .collect()
    }

    async fn is_player(&self, account: &Account) -> Result<bool, ChainError> {
        let address = account
            .to_address()
            .map_err(|err| ChainError::message(err.to_string()))?;
        self.contract
            .is_player(address)
            .call()
            .await
            .map_err(contract_error)
    }

    async fn events(&self) -> Result<BoxStream<'static, ContractEvent>, ChainError> {
        let client = self.contract.client();
        let head = client.get_block_number().await.map_err(provider_error)?;
        let (sender, receiver) = mpsc::unbounded();
        tokio::spawn(poll_logs(
            client,
            self.contract.address(),
            head + 1,
            self.poll_interval,
            sender,
        ));
        Ok(receiver.boxed())
    }
}

/// Polls the contract's logs until the receiving stream is dropped.
async fn poll_logs(
    client: Arc<SignedClient>,
    address: Address,
    mut from: U64,
    interval: Duration,
    sender: mpsc::UnboundedSender<ContractEvent>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if sender.is_closed() {
            break;
        }
        let head = match client.get_block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!(?err, "failed to read block height");
                continue;
            }
        };
        if head < from {
            continue;
        }
        let filter = Filter::new().address(address).from_block(from).to_block(head);
        let logs: Vec<Log> = match client.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(err) => {
                warn!(?err, from = from.as_u64(), to = head.as_u64(), "failed to read logs");
                continue;
            }
        };
        for log in logs {
            let Some(kind) = log.topics.first().and_then(classify) else {
                continue;
            };
            let event = ContractEvent {
                kind,
                block_number: log.block_number.map(|block| block.as_u64()),
            };
            if sender.unbounded_send(event).is_err() {
                return;
            }
        }
        from = head + 1;
    }
    debug!("log polling stopped");
}

/// Builds signer-bound contract handles against one JSON-RPC endpoint.
#[derive(Clone)]
pub struct EvmConnector {
    provider: Provider<Http>,
    address: Address,
    chain_id: u64,
    poll_interval: Duration,
}

impl EvmConnector {
    pub async fn connect(
        rpc_url: &str,
        contract: &Account,
        poll_interval: Duration,
    ) -> Result<Self, SessionError> {
        let address = contract.to_address()?;
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|err| SessionError::ConnectionFailed {
                cause: format!("invalid RPC url '{rpc_url}': {err}"),
            })?
            .interval(poll_interval);
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|err| SessionError::ConnectionFailed {
                cause: err.to_string(),
            })?
            .as_u64();
        info!(rpc_url, chain_id, %contract, "connected to node");
        Ok(Self {
            provider,
            address,
            chain_id,
            poll_interval,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

impl ContractConnector<LocalWallet> for EvmConnector {
    type Handle = EvmContractHandle;

    fn bind(&self, signer: &LocalWallet) -> Result<EvmContractHandle, ChainError> {
        let signer = signer.clone().with_chain_id(self.chain_id);
        let client = Arc::new(SignerMiddleware::new(self.provider.clone(), signer));
        Ok(EvmContractHandle {
            contract: abi::TradingCardGame::new(self.address, client),
            poll_interval: self.poll_interval,
        })
    }
}
