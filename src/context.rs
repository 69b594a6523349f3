use crate::{
    alert::{
        ALERT_DURATION,
        Alert,
        AlertController,
    },
    bridge::{
        BridgeState,
        EventListenerBridge,
        ResyncScheduler,
    },
    error::{
        Result,
        SessionError,
    },
    gateway::{
        CallOptions,
        ContractCall,
        ContractGateway,
        Receipt,
    },
    preferences::PreferenceStore,
    projector::GameStateProjector,
    types::{
        Account,
        GameView,
    },
    wallet_session::{
        Connected,
        ContractConnector,
        Reconciliation,
        Session,
        WalletNotification,
        WalletProvider,
        WalletSession,
    },
};
use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::RecvError,
        },
        watch,
    },
    task::JoinHandle,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextOptions {
    pub call_options: CallOptions,
    pub alert_duration: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            call_options: CallOptions::default(),
            alert_duration: ALERT_DURATION,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Confirmed(Receipt),
    /// The transaction settled after its session ended; nothing was applied.
    Discarded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(Account),
    /// A disconnect landed while the wallet was still answering.
    Superseded,
}

/// Everything a front end reads from or writes to. Built by `init`, torn
/// down by `shutdown`.
pub struct SessionContext<P, C>
where
    P: WalletProvider,
    C: ContractConnector<P::Signer>,
{
    wallet: WalletSession<P, C>,
    gateway: Arc<ContractGateway<C::Handle>>,
    bridge: EventListenerBridge,
    projector: GameStateProjector,
    alerts: AlertController,
    preferences: PreferenceStore,
    battleground: watch::Sender<String>,
    scheduler: ResyncScheduler,
    watcher: Mutex<Option<JoinHandle<()>>>,
    options: ContextOptions,
}

impl<P, C> SessionContext<P, C>
where
    P: WalletProvider,
    C: ContractConnector<P::Signer>,
{
    /// Loads preferences and starts the background workers. Must be called
    /// from within a tokio runtime.
    pub fn init(
        provider: P,
        connector: C,
        preferences: PreferenceStore,
        options: ContextOptions,
    ) -> Result<Arc<Self>> {
        let battleground = preferences.load_battleground()?;
        let notifications = provider.notifications();
        let gateway = Arc::new(ContractGateway::new());

        let context = Arc::new_cyclic(|weak: &Weak<Self>| {
            let scheduled = weak.clone();
            let scheduler = ResyncScheduler::start(move || {
                let context = scheduled.clone();
                async move {
                    if let Some(context) = context.upgrade() {
                        context.scheduled_resync().await;
                    }
                }
            });
            let (battleground, _) = watch::channel(battleground);
            Self {
                wallet: WalletSession::new(provider, connector, Arc::clone(&gateway)),
                gateway,
                bridge: EventListenerBridge::new(),
                projector: GameStateProjector::new(),
                alerts: AlertController::with_duration(options.alert_duration),
                preferences,
                battleground,
                scheduler,
                watcher: Mutex::new(None),
                options,
            }
        });

        let watcher = tokio::spawn(watch_wallet(Arc::downgrade(&context), notifications));
        *context
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        info!(battleground = %context.battleground(), "session context ready");
        Ok(context)
    }

    pub fn session(&self) -> Session<P::Signer> {
        self.wallet.snapshot()
    }

    pub fn watch_session(&self) -> watch::Receiver<Session<P::Signer>> {
        self.wallet.watch()
    }

    pub fn account(&self) -> Option<Account> {
        self.wallet.ticket().ok().map(|ticket| ticket.account)
    }

    pub fn game_view(&self) -> GameView {
        self.projector.current()
    }

    pub fn watch_game_view(&self) -> watch::Receiver<GameView> {
        self.projector.subscribe()
    }

    pub fn alert(&self) -> Alert {
        self.alerts.current()
    }

    pub fn watch_alert(&self) -> watch::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn battleground(&self) -> String {
        self.battleground.borrow().clone()
    }

    pub fn watch_battleground(&self) -> watch::Receiver<String> {
        self.battleground.subscribe()
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.bridge.state()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.gateway.live_subscriptions()
    }

    pub fn set_battleground(&self, battleground: &str) -> Result<()> {
        if let Err(err) = self.preferences.save_battleground(battleground) {
            self.alerts.show_error(&err);
            return Err(err);
        }
        self.battleground.send_replace(battleground.trim().to_owned());
        Ok(())
    }

    /// Connects the wallet. A fresh session arms the event bridge and loads
    /// the game view before returning.
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        let connected = match self.wallet.connect().await {
            Ok(connected) => connected,
            Err(SessionError::StaleSession) => {
                debug!("connect attempt superseded by a disconnect");
                return Ok(ConnectOutcome::Superseded);
            }
            Err(err) => {
                self.alerts.show_error(&err);
                return Err(err);
            }
        };
        if connected.fresh {
            self.on_established(&connected).await;
        }
        Ok(ConnectOutcome::Connected(connected.ticket.account))
    }

    /// Returns whether a session was live.
    pub fn disconnect(&self) -> bool {
        self.bridge.disarm(&self.gateway);
        let was_connected = self.wallet.disconnect();
        self.projector.clear();
        was_connected
    }

    pub async fn resync(&self) -> Result<GameView> {
        let ticket = self.wallet.ticket()?;
        self.projector
            .resync(&self.gateway, &ticket, self.wallet.generation())
            .await
    }

    /// Sends a state-changing call and waits for it to confirm. Failures are
    /// shown as the alert and returned; success shows a confirmation and
    /// refreshes the view.
    pub async fn submit(&self, call: ContractCall) -> Result<SubmitOutcome> {
        if let Err(err) = call.validate() {
            self.alerts.show_error(&err);
            return Err(err);
        }
        let ticket = match self.wallet.ticket() {
            Ok(ticket) => ticket,
            Err(err) => {
                self.alerts.show_error(&err);
                return Err(err);
            }
        };

        let confirmation = call.success_message();
        let outcome = self.gateway.call(call, self.options.call_options).await;
        if !self.wallet.generation().is_current(&ticket) {
            debug!(
                session_id = ticket.id,
                ?outcome,
                "transaction settled after its session ended"
            );
            return Ok(SubmitOutcome::Discarded);
        }

        match outcome {
            Ok(receipt) => {
                self.alerts.show(Alert::success(confirmation));
                match self
                    .projector
                    .resync(&self.gateway, &ticket, self.wallet.generation())
                    .await
                {
                    Ok(_) | Err(SessionError::StaleSession) => {}
                    Err(err) => warn!(?err, "resync after transaction failed"),
                }
                Ok(SubmitOutcome::Confirmed(receipt))
            }
            Err(err) => {
                self.alerts.show_error(&err);
                Err(err)
            }
        }
    }

    /// Re-derives the session after the wallet changed under us.
    pub async fn handle_wallet_notification(&self, notification: &WalletNotification) {
        match self.wallet.reconcile(notification).await {
            Ok(Reconciliation::Unchanged) => {}
            Ok(Reconciliation::Dropped) => {
                self.bridge.disarm(&self.gateway);
                self.projector.clear();
                self.alerts.show(Alert::info("Wallet disconnected"));
            }
            Ok(Reconciliation::Reestablished(connected)) => {
                self.projector.clear();
                self.on_established(&connected).await;
            }
            Err(err) => {
                self.bridge.disarm(&self.gateway);
                self.projector.clear();
                self.alerts.show_error(&err);
            }
        }
    }

    /// Stops background work and drops the session. Safe to call twice.
    pub fn shutdown(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.scheduler.stop();
        self.disconnect();
        self.alerts.teardown();
        info!("session context shut down");
    }

    async fn on_established(&self, connected: &Connected) {
        let ticket = &connected.ticket;
        if let Err(err) = self
            .bridge
            .arm(&self.gateway, ticket.id, self.scheduler.trigger())
            .await
        {
            warn!(?err, "could not subscribe to battle events");
        }
        match self
            .projector
            .resync(&self.gateway, ticket, self.wallet.generation())
            .await
        {
            Ok(_) | Err(SessionError::StaleSession) => {}
            Err(err) => {
                warn!(?err, "initial resync failed");
                self.alerts.show_error(&err);
            }
        }
    }

    async fn scheduled_resync(&self) {
        match self.resync().await {
            Ok(_) | Err(SessionError::StaleSession) | Err(SessionError::NotConnected) => {}
            Err(err) => warn!(?err, "event-driven resync failed"),
        }
    }
}

impl<P, C> Drop for SessionContext<P, C>
where
    P: WalletProvider,
    C: ContractConnector<P::Signer>,
{
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

async fn watch_wallet<P, C>(
    context: Weak<SessionContext<P, C>>,
    mut notifications: broadcast::Receiver<WalletNotification>,
) where
    P: WalletProvider,
    C: ContractConnector<P::Signer>,
{
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed wallet notifications; re-checking accounts");
                WalletNotification::AccountsChanged(Vec::new())
            }
            Err(RecvError::Closed) => break,
        };
        let Some(context) = context.upgrade() else {
            break;
        };
        debug!(?notification, "wallet notification");
        context.handle_wallet_notification(&notification).await;
    }
    debug!("wallet notification stream ended");
}
