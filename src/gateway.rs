use crate::{
    error::{
        Result,
        SessionError,
    },
    types::{
        Account,
        Battle,
    },
};
use futures::{
    StreamExt,
    stream::BoxStream,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const DEFAULT_GAS_LIMIT: u64 = 200_000;
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// EIP-1193 "user rejected the request".
pub const USER_REJECTED_CODE: i64 = 4001;

/// State-changing contract methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractCall {
    RegisterPlayer {
        name: String,
    },
    CreateBattle {
        id: u64,
        player_card_id: u64,
        computer_card_id: u64,
        player_stat_value: u64,
        computer_stat_value: u64,
    },
    JoinBattle {
        name: String,
    },
}

impl ContractCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            ContractCall::RegisterPlayer { .. } => "registerPlayer",
            ContractCall::CreateBattle { .. } => "createBattle",
            ContractCall::JoinBattle { .. } => "joinBattle",
        }
    }

    /// Rejects calls the contract would refuse anyway, before paying gas.
    pub fn validate(&self) -> Result<()> {
        match self {
            ContractCall::RegisterPlayer { name } if name.trim().is_empty() => Err(
                SessionError::InvalidInput("Name cannot be empty".to_owned()),
            ),
            ContractCall::JoinBattle { name } if name.trim().is_empty() => Err(
                SessionError::InvalidInput("Battle name cannot be empty".to_owned()),
            ),
            _ => Ok(()),
        }
    }

    pub fn success_message(&self) -> String {
        match self {
            ContractCall::RegisterPlayer { name } => format!("Welcome, {}!", name.trim()),
            ContractCall::CreateBattle { id, .. } => {
                format!("Battle with ID {id} created successfully")
            }
            ContractCall::JoinBattle { name } => format!("Joined battle {}", name.trim()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    /// Execution budget handed to the transaction.
    pub gas_limit: u64,
    pub confirmation_timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            gas_limit: DEFAULT_GAS_LIMIT,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BattleEventKind {
    NewPlayer,
    NewBattle,
    BattleJoined,
    BattleMove,
    RoundEnded,
    BattleEnded,
}

impl BattleEventKind {
    pub const LIFECYCLE: [BattleEventKind; 6] = [
        BattleEventKind::NewPlayer,
        BattleEventKind::NewBattle,
        BattleEventKind::BattleJoined,
        BattleEventKind::BattleMove,
        BattleEventKind::RoundEnded,
        BattleEventKind::BattleEnded,
    ];
}

/// Only the kind is carried: events are resync triggers, never deltas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractEvent {
    pub kind: BattleEventKind,
    pub block_number: Option<u64>,
}

/// Raw failure as reported by the chain client, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainError {
    pub code: Option<i64>,
    /// Revert payload, `"execution reverted: <message>"` when present.
    pub reason: Option<String>,
    pub message: String,
}

impl ChainError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn reverted(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            code: None,
            message: reason.clone(),
            reason: Some(reason),
        }
    }

    pub fn rejected() -> Self {
        Self {
            code: Some(USER_REJECTED_CODE),
            reason: None,
            message: "user rejected transaction".to_owned(),
        }
    }
}

/// Maps a failed state-changing call onto the error taxonomy.
pub fn normalize_call_error(err: ChainError) -> SessionError {
    if err.code == Some(USER_REJECTED_CODE) {
        return SessionError::TransactionRejected;
    }
    if let Some(reason) = err.reason {
        return SessionError::TransactionReverted { reason };
    }
    if let Some(start) = err.message.find("execution reverted") {
        return SessionError::TransactionReverted {
            reason: err.message[start..].to_owned(),
        };
    }
    SessionError::TransactionFailed { cause: err.message }
}

fn query_failed(err: ChainError) -> SessionError {
    SessionError::QueryFailed { cause: err.message }
}

/// A contract binding for one signer.
pub trait ContractHandle: Clone + Send + Sync + 'static {
    /// Submits the call and resolves once the transaction is confirmed.
    fn execute(
        &self,
        call: &ContractCall,
        gas_limit: u64,
    ) -> impl Future<Output = Result<Receipt, ChainError>> + Send;

    fn all_battles(&self) -> impl Future<Output = Result<Vec<Battle>, ChainError>> + Send;

    fn is_player(
        &self,
        account: &Account,
    ) -> impl Future<Output = Result<bool, ChainError>> + Send;

    /// Contract events in emission order, starting from the current head.
    fn events(
        &self,
    ) -> impl Future<Output = Result<BoxStream<'static, ContractEvent>, ChainError>> + Send;
}

pub type EventHandler = Arc<dyn Fn(&ContractEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Binding<H> {
    handle: Option<H>,
    epoch: u64,
}

/// The only way the session layer talks to the contract.
pub struct ContractGateway<H> {
    binding: Mutex<Binding<H>>,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_subscription: AtomicU64,
}

impl<H> Default for ContractGateway<H> {
    fn default() -> Self {
        Self {
            binding: Mutex::new(Binding {
                handle: None,
                epoch: 0,
            }),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
        }
    }
}

impl<H: ContractHandle> ContractGateway<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, handle: H) {
        let mut binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        binding.handle = Some(handle);
        binding.epoch += 1;
    }

    /// Drops the handle along with every subscription made through it.
    pub fn unbind(&self) {
        {
            let mut binding =
                self.binding.lock().unwrap_or_else(PoisonError::into_inner);
            binding.handle = None;
            binding.epoch += 1;
        }
        let dropped = self.drain_subscriptions();
        if dropped > 0 {
            debug!(dropped, "dropped subscriptions on unbind");
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .is_some()
    }

    fn bound(&self) -> Result<(H, u64)> {
        let binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = binding.handle.clone().ok_or(SessionError::NotConnected)?;
        Ok((handle, binding.epoch))
    }

    fn epoch(&self) -> u64 {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }

    pub async fn call(&self, call: ContractCall, options: CallOptions) -> Result<Receipt> {
        let (handle, _) = self.bound()?;
        let method = call.method_name();
        info!(method, gas_limit = options.gas_limit, "submitting transaction");
        let receipt = time::timeout(
            options.confirmation_timeout,
            handle.execute(&call, options.gas_limit),
        )
        .await
        .map_err(|_| {
            warn!(method, "transaction confirmation timed out");
            SessionError::TransactionTimeout
        })?
        .map_err(|err| {
            warn!(method, ?err, "transaction failed");
            normalize_call_error(err)
        })?;
        info!(method, tx_hash = %receipt.tx_hash, "transaction confirmed");
        Ok(receipt)
    }

    pub async fn all_battles(&self) -> Result<Vec<Battle>> {
        let (handle, _) = self.bound()?;
        handle.all_battles().await.map_err(query_failed)
    }

    pub async fn is_player(&self, account: &Account) -> Result<bool> {
        let (handle, _) = self.bound()?;
        handle.is_player(account).await.map_err(query_failed)
    }

    /// Invokes `handler` for every event whose kind is in `kinds`.
    pub async fn subscribe(
        &self,
        kinds: &[BattleEventKind],
        handler: EventHandler,
    ) -> Result<SubscriptionId> {
        let (handle, epoch) = self.bound()?;
        let mut events = handle.events().await.map_err(query_failed)?;
        let kinds = kinds.to_vec();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if kinds.contains(&event.kind) {
                    handler(&event);
                }
            }
            debug!(?id, "event stream ended");
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);

        // The handle may have been swapped out while the stream was opening.
        if self.epoch() != epoch {
            self.unsubscribe(id);
            return Err(SessionError::NotConnected);
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn drain_subscriptions(&self) -> usize {
        let drained: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = drained.len();
        for (_, task) in drained {
            task.abort();
        }
        count
    }
}

impl<H> Drop for ContractGateway<H> {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        FakeChain,
        FakeContractHandle,
    };
    use std::sync::atomic::AtomicUsize;

    fn alice() -> Account {
        Account::new("0x00000000000000000000000000000000000A11CE")
    }

    fn bound_gateway(chain: &FakeChain) -> ContractGateway<FakeContractHandle> {
        let gateway = ContractGateway::new();
        gateway.bind(chain.handle_for(alice()));
        gateway
    }

    #[test]
    fn normalize_call_error__maps_user_rejection() {
        assert_eq!(
            normalize_call_error(ChainError::rejected()),
            SessionError::TransactionRejected
        );
    }

    #[test]
    fn normalize_call_error__keeps_full_revert_payload() {
        // given
        let err =
            ChainError::message("(code: 3) execution reverted: Player already registered");

        // when
        let normalized = normalize_call_error(err);

        // then
        assert_eq!(
            normalized,
            SessionError::TransactionReverted {
                reason: "execution reverted: Player already registered".to_owned()
            }
        );
    }

    #[test]
    fn normalize_call_error__unknown_failures_are_generic() {
        let normalized = normalize_call_error(ChainError::message("nonce too low"));

        assert_eq!(
            normalized,
            SessionError::TransactionFailed {
                cause: "nonce too low".to_owned()
            }
        );
    }

    #[test]
    fn validate__rejects_blank_names() {
        let call = ContractCall::RegisterPlayer {
            name: "   ".to_owned(),
        };

        assert!(matches!(call.validate(), Err(SessionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn call__without_binding_is_not_connected() {
        // given
        let gateway: ContractGateway<FakeContractHandle> = ContractGateway::new();

        // when
        let result = gateway
            .call(
                ContractCall::RegisterPlayer {
                    name: "alice".into(),
                },
                CallOptions::default(),
            )
            .await;

        // then
        assert_eq!(result, Err(SessionError::NotConnected));
    }

    #[tokio::test]
    async fn call__surfaces_reverts_with_reason() {
        // given
        let chain = FakeChain::new();
        let gateway = bound_gateway(&chain);
        chain.fail_next_call(ChainError::reverted("execution reverted: Not enough mana"));

        // when
        let result = gateway
            .call(
                ContractCall::JoinBattle {
                    name: "arena".into(),
                },
                CallOptions::default(),
            )
            .await;

        // then
        assert_eq!(
            result,
            Err(SessionError::TransactionReverted {
                reason: "execution reverted: Not enough mana".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn call__times_out_when_confirmation_never_arrives() {
        // given
        let chain = FakeChain::new();
        let gateway = bound_gateway(&chain);
        let _gate = chain.hold_calls();
        let options = CallOptions {
            confirmation_timeout: Duration::from_secs(3),
            ..CallOptions::default()
        };

        // when
        let result = gateway
            .call(
                ContractCall::RegisterPlayer {
                    name: "alice".into(),
                },
                options,
            )
            .await;

        // then
        assert_eq!(result, Err(SessionError::TransactionTimeout));
    }

    #[tokio::test]
    async fn all_battles__query_failure_carries_cause() {
        // given
        let chain = FakeChain::new();
        let gateway = bound_gateway(&chain);
        chain.fail_next_query(ChainError::message("connection refused"));

        // when
        let result = gateway.all_battles().await;

        // then
        assert_eq!(
            result,
            Err(SessionError::QueryFailed {
                cause: "connection refused".into()
            })
        );
    }

    #[tokio::test]
    async fn subscribe__delivers_matching_events_until_unsubscribed() {
        // given
        let chain = FakeChain::new();
        let gateway = bound_gateway(&chain);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = gateway
            .subscribe(
                &[BattleEventKind::NewBattle],
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        // when
        chain.emit(BattleEventKind::NewBattle);
        chain.emit(BattleEventKind::NewPlayer);
        crate::test_helpers::settle().await;
        let removed = gateway.unsubscribe(id);
        chain.emit(BattleEventKind::NewBattle);
        crate::test_helpers::settle().await;

        // then
        assert!(removed);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn unbind__drops_every_subscription() {
        // given
        let chain = FakeChain::new();
        let gateway = bound_gateway(&chain);
        for _ in 0..3 {
            gateway
                .subscribe(&BattleEventKind::LIFECYCLE, Arc::new(|_| {}))
                .await
                .unwrap();
        }

        // when
        gateway.unbind();

        // then
        assert_eq!(gateway.live_subscriptions(), 0);
        assert!(!gateway.is_bound());
    }
}
