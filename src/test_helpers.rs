use crate::{
    context::{
        ContextOptions,
        SessionContext,
    },
    gateway::{
        BattleEventKind,
        ChainError,
        ContractCall,
        ContractEvent,
        ContractHandle,
        Receipt,
    },
    preferences::PreferenceStore,
    types::{
        Account,
        Battle,
        BattleStatus,
    },
    wallet_session::{
        ContractConnector,
        WalletNotification,
        WalletProvider,
    },
};
use futures::{
    StreamExt,
    stream::{
        self,
        BoxStream,
    },
};
use std::{
    collections::{
        HashSet,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
    },
};
use tempdir::TempDir;
use tokio::sync::{
    Semaphore,
    broadcast::{
        self,
        error::RecvError,
    },
};

pub const ALICE: &str = "0x00000000000000000000000000000000000A11CE";
pub const BOB: &str = "0x0000000000000000000000000000000000000B0B";

pub fn alice() -> Account {
    Account::new(ALICE)
}

pub fn bob() -> Account {
    Account::new(BOB)
}

/// Lets spawned tasks on the current-thread runtime catch up.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn genesis() -> Battle {
    Battle {
        id: 0,
        name: String::new(),
        players: Vec::new(),
        status: BattleStatus::Pending,
        winner: Account::null(),
    }
}

pub fn battle(id: u64, players: &[Account], status: BattleStatus, winner: Account) -> Battle {
    Battle {
        id,
        name: format!("battle-{id}"),
        players: players.to_vec(),
        status,
        winner,
    }
}

struct WalletState {
    available: bool,
    accounts: Vec<Account>,
    request_gate: Option<Arc<Semaphore>>,
}

/// In-memory wallet whose accounts the test controls.
#[derive(Clone)]
pub struct FakeWallet {
    state: Arc<Mutex<WalletState>>,
    notifications: broadcast::Sender<WalletNotification>,
}

impl FakeWallet {
    fn build(available: bool, accounts: Vec<Account>) -> Self {
        let (notifications, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(WalletState {
                available,
                accounts,
                request_gate: None,
            })),
            notifications,
        }
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        Self::build(true, accounts)
    }

    pub fn unavailable() -> Self {
        Self::build(false, Vec::new())
    }

    pub fn set_accounts(&self, accounts: Vec<Account>) {
        self.state.lock().unwrap().accounts = accounts;
    }

    /// Changes the accounts and tells listeners, like a wallet UI would.
    pub fn switch_accounts(&self, accounts: Vec<Account>) {
        self.set_accounts(accounts.clone());
        let _ = self
            .notifications
            .send(WalletNotification::AccountsChanged(accounts));
    }

    /// Holds `request_accounts` until released, like a pending approval popup.
    pub fn hold_requests(&self) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().request_gate = Some(Arc::clone(&semaphore));
        Gate { semaphore }
    }

    pub fn switch_chain(&self, chain_id: u64) {
        let _ = self
            .notifications
            .send(WalletNotification::ChainChanged(chain_id));
    }
}

impl WalletProvider for FakeWallet {
    type Signer = Account;

    fn is_available(&self) -> bool {
        self.state.lock().unwrap().available
    }

    async fn request_accounts(&self) -> Result<Vec<Account>, ChainError> {
        let gate = self.state.lock().unwrap().request_gate.clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn accounts(&self) -> Result<Vec<Account>, ChainError> {
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn signer(&self, account: &Account) -> Result<Account, ChainError> {
        Ok(account.clone())
    }

    fn notifications(&self) -> broadcast::Receiver<WalletNotification> {
        self.notifications.subscribe()
    }
}

struct ChainState {
    battles: Vec<Battle>,
    players: HashSet<Account>,
    call_failures: VecDeque<ChainError>,
    query_failures: VecDeque<ChainError>,
    calls: Vec<(Account, ContractCall)>,
    battle_queries: usize,
    block: u64,
    call_gate: Option<Arc<Semaphore>>,
    query_gate: Option<Arc<Semaphore>>,
}

/// Holds calls or queries until released.
pub struct Gate {
    semaphore: Arc<Semaphore>,
}

impl Gate {
    pub fn release(&self, count: usize) {
        self.semaphore.add_permits(count);
    }
}

#[derive(Clone, Copy)]
enum GateKind {
    Call,
    Query,
}

/// In-memory stand-in for the deployed contract, shared by every handle
/// bound to it.
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
    events: broadcast::Sender<ContractEvent>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self::with_battles(vec![genesis()])
    }

    pub fn with_battles(battles: Vec<Battle>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(ChainState {
                battles,
                players: HashSet::new(),
                call_failures: VecDeque::new(),
                query_failures: VecDeque::new(),
                calls: Vec::new(),
                battle_queries: 0,
                block: 1,
                call_gate: None,
                query_gate: None,
            })),
            events,
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            chain: self.clone(),
        }
    }

    pub fn handle_for(&self, caller: Account) -> FakeContractHandle {
        FakeContractHandle {
            chain: self.clone(),
            caller,
        }
    }

    pub fn battles(&self) -> Vec<Battle> {
        self.state.lock().unwrap().battles.clone()
    }

    pub fn set_battles(&self, battles: Vec<Battle>) {
        self.state.lock().unwrap().battles = battles;
    }

    pub fn calls(&self) -> Vec<(Account, ContractCall)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn battle_queries(&self) -> usize {
        self.state.lock().unwrap().battle_queries
    }

    pub fn event_listeners(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn emit(&self, kind: BattleEventKind) {
        let block = {
            let mut state = self.state.lock().unwrap();
            state.block += 1;
            state.block
        };
        let _ = self.events.send(ContractEvent {
            kind,
            block_number: Some(block),
        });
    }

    pub fn fail_next_call(&self, err: ChainError) {
        self.state.lock().unwrap().call_failures.push_back(err);
    }

    pub fn fail_next_query(&self, err: ChainError) {
        self.state.lock().unwrap().query_failures.push_back(err);
    }

    pub fn hold_calls(&self) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().call_gate = Some(Arc::clone(&semaphore));
        Gate { semaphore }
    }

    pub fn hold_queries(&self) -> Gate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().query_gate = Some(Arc::clone(&semaphore));
        Gate { semaphore }
    }

    async fn pass_gate(&self, kind: GateKind) {
        let gate = {
            let state = self.state.lock().unwrap();
            match kind {
                GateKind::Call => state.call_gate.clone(),
                GateKind::Query => state.query_gate.clone(),
            }
        };
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }

    fn apply(&self, caller: &Account, call: &ContractCall) -> Result<Receipt, ChainError> {
        let (kind, receipt) = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.call_failures.pop_front() {
                return Err(err);
            }
            let kind = match call {
                ContractCall::RegisterPlayer { .. } => {
                    if !state.players.insert(caller.clone()) {
                        return Err(ChainError::reverted(
                            "execution reverted: Player already registered",
                        ));
                    }
                    BattleEventKind::NewPlayer
                }
                ContractCall::CreateBattle { id, .. } => {
                    let index = state.battles.len() as u64;
                    state.battles.push(battle(
                        index,
                        std::slice::from_ref(caller),
                        BattleStatus::Pending,
                        Account::null(),
                    ));
                    if let Some(created) = state.battles.last_mut() {
                        created.name = format!("battle-{id}");
                    }
                    BattleEventKind::NewBattle
                }
                ContractCall::JoinBattle { name } => {
                    let Some(joined) = state.battles.iter_mut().skip(1).find(|b| {
                        &b.name == name && b.status == BattleStatus::Pending
                    }) else {
                        return Err(ChainError::reverted(
                            "execution reverted: Battle already started!",
                        ));
                    };
                    joined.players.push(caller.clone());
                    joined.status = BattleStatus::Active;
                    BattleEventKind::BattleJoined
                }
            };
            state.block += 1;
            let receipt = Receipt {
                tx_hash: format!("0x{:064x}", state.calls.len()),
                block_number: Some(state.block),
            };
            (kind, receipt)
        };
        let _ = self.events.send(ContractEvent {
            kind,
            block_number: receipt.block_number,
        });
        Ok(receipt)
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    chain: FakeChain,
}

impl ContractConnector<Account> for FakeConnector {
    type Handle = FakeContractHandle;

    fn bind(&self, signer: &Account) -> Result<FakeContractHandle, ChainError> {
        Ok(self.chain.handle_for(signer.clone()))
    }
}

#[derive(Clone)]
pub struct FakeContractHandle {
    chain: FakeChain,
    caller: Account,
}

impl ContractHandle for FakeContractHandle {
    async fn execute(
        &self,
        call: &ContractCall,
        _gas_limit: u64,
    ) -> Result<Receipt, ChainError> {
        self.chain
            .state
            .lock()
            .unwrap()
            .calls
            .push((self.caller.clone(), call.clone()));
        self.chain.pass_gate(GateKind::Call).await;
        self.chain.apply(&self.caller, call)
    }

    async fn all_battles(&self) -> Result<Vec<Battle>, ChainError> {
        let failure = {
            let mut state = self.chain.state.lock().unwrap();
            state.battle_queries += 1;
            state.query_failures.pop_front()
        };
        self.chain.pass_gate(GateKind::Query).await;
        match failure {
            Some(err) => Err(err),
            None => Ok(self.chain.battles()),
        }
    }

    async fn is_player(&self, account: &Account) -> Result<bool, ChainError> {
        Ok(self.chain.state.lock().unwrap().players.contains(account))
    }

    async fn events(&self) -> Result<BoxStream<'static, ContractEvent>, ChainError> {
        let receiver = self.chain.events.subscribe();
        Ok(stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

pub type FakeSessionContext = SessionContext<FakeWallet, FakeConnector>;

/// A session context wired to a fake wallet and an in-memory contract, with
/// preferences in a throwaway directory.
pub struct TestContext {
    pub chain: FakeChain,
    pub wallet: FakeWallet,
    context: Arc<FakeSessionContext>,
    _preferences: TempDir,
}

impl TestContext {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self::with_chain(FakeChain::new(), accounts)
    }

    pub fn with_chain(chain: FakeChain, accounts: Vec<Account>) -> Self {
        let wallet = FakeWallet::with_accounts(accounts);
        let preferences = TempDir::new("battle-royale-prefs").unwrap();
        let context = SessionContext::init(
            wallet.clone(),
            chain.connector(),
            PreferenceStore::new(preferences.path()),
            ContextOptions::default(),
        )
        .unwrap();
        Self {
            chain,
            wallet,
            context,
            _preferences: preferences,
        }
    }

    pub fn context(&self) -> &Arc<FakeSessionContext> {
        &self.context
    }

    /// A second handle onto the same contract, acting as another player.
    pub fn other_player(&self, account: Account) -> FakeContractHandle {
        self.chain.handle_for(account)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.context.shutdown();
    }
}
