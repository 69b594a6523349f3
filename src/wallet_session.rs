use crate::{
    error::{
        Result,
        SessionError,
    },
    gateway::{
        ChainError,
        ContractGateway,
        ContractHandle,
        USER_REJECTED_CODE,
    },
    types::Account,
};
use std::sync::{
    Arc,
    atomic::{
        AtomicU64,
        Ordering,
    },
};
use tokio::sync::{
    Mutex,
    broadcast,
    watch,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Out-of-band notifications from the wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletNotification {
    AccountsChanged(Vec<Account>),
    ChainChanged(u64),
}

/// The user's wallet: where accounts and signers come from.
pub trait WalletProvider: Send + Sync + 'static {
    type Signer: Clone + Send + Sync + 'static;

    /// Whether a wallet can be reached at all.
    fn is_available(&self) -> bool;

    /// Asks the user for account access. May prompt.
    fn request_accounts(
        &self,
    ) -> impl Future<Output = Result<Vec<Account>, ChainError>> + Send;

    /// Accounts already exposed to us, without prompting.
    fn accounts(&self) -> impl Future<Output = Result<Vec<Account>, ChainError>> + Send;

    fn signer(
        &self,
        account: &Account,
    ) -> impl Future<Output = Result<Self::Signer, ChainError>> + Send;

    fn notifications(&self) -> broadcast::Receiver<WalletNotification>;
}

/// Builds a contract handle bound to a signer.
pub trait ContractConnector<S>: Send + Sync + 'static {
    type Handle: ContractHandle;

    fn bind(&self, signer: &S) -> Result<Self::Handle, ChainError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub struct Session<S> {
    /// Monotonic id of the connect cycle this value belongs to.
    pub id: u64,
    pub address: Option<Account>,
    pub signer: Option<S>,
    pub state: ConnectionState,
}

impl<S> Session<S> {
    fn disconnected(id: u64) -> Self {
        Self {
            id,
            address: None,
            signer: None,
            state: ConnectionState::Disconnected,
        }
    }
}

/// Identifies the session an in-flight operation was started under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTicket {
    pub id: u64,
    pub account: Account,
}

/// Session id counter. Bumped on every connect and disconnect, so any
/// ticket issued before either is stale afterwards.
#[derive(Clone, Debug, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.current() == ticket.id
    }

    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connected {
    pub ticket: SessionTicket,
    /// False when `connect` found an existing session.
    pub fresh: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    Dropped,
    Reestablished(Connected),
}

pub struct WalletSession<P, C>
where
    P: WalletProvider,
    C: ContractConnector<P::Signer>,
{
    provider: P,
    connector: C,
    gateway: Arc<ContractGateway<C::Handle>>,
    session: watch::Sender<Session<P::Signer>>,
    generation: Generation,
    connecting: Mutex<()>,
}

impl<P, C> WalletSession<P, C>
where
    P: WalletProvider,
    C: ContractConnector<P::Signer>,
{
    pub fn new(provider: P, connector: C, gateway: Arc<ContractGateway<C::Handle>>) -> Self {
        let (session, _) = watch::channel(Session::disconnected(0));
        Self {
            provider,
            connector,
            gateway,
            session,
            generation: Generation::default(),
            connecting: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Session<P::Signer> {
        self.session.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Session<P::Signer>> {
        self.session.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.borrow().state
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn ticket(&self) -> Result<SessionTicket> {
        let session = self.session.borrow();
        match (&session.state, &session.address) {
            (ConnectionState::Connected, Some(account)) => Ok(SessionTicket {
                id: session.id,
                account: account.clone(),
            }),
            _ => Err(SessionError::NotConnected),
        }
    }

    pub async fn connect(&self) -> Result<Connected> {
        let _connecting = self.connecting.lock().await;
        if let Ok(ticket) = self.ticket() {
            return Ok(Connected {
                ticket,
                fresh: false,
            });
        }
        if !self.provider.is_available() {
            warn!("connect requested but no wallet provider is reachable");
            return Err(SessionError::ProviderUnavailable);
        }

        let started = self.generation.current();
        self.session.send_modify(|session| {
            *session = Session::disconnected(session.id);
            session.state = ConnectionState::Connecting;
        });

        match self.establish(started).await {
            Ok(connected) => Ok(connected),
            Err(err) => {
                // A disconnect during the attempt already reset the session.
                if self.generation.current() == started {
                    self.session
                        .send_replace(Session::disconnected(self.generation.current()));
                }
                warn!(?err, "wallet connection failed");
                Err(err)
            }
        }
    }

    async fn establish(&self, started: u64) -> Result<Connected> {
        let accounts = self
            .provider
            .request_accounts()
            .await
            .map_err(connection_failed)?;
        let account = accounts
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::ConnectionFailed {
                cause: "wallet exposed no accounts".to_owned(),
            })?;
        let signer = self
            .provider
            .signer(&account)
            .await
            .map_err(connection_failed)?;
        let handle = self.connector.bind(&signer).map_err(connection_failed)?;

        if self.generation.current() != started {
            debug!(%account, "session was torn down while connecting");
            return Err(SessionError::StaleSession);
        }

        let id = self.generation.advance();
        self.gateway.bind(handle);
        self.session.send_replace(Session {
            id,
            address: Some(account.clone()),
            signer: Some(signer),
            state: ConnectionState::Connected,
        });
        info!(%account, session_id = id, "wallet connected");
        Ok(Connected {
            ticket: SessionTicket { id, account },
            fresh: true,
        })
    }

    /// Returns whether a session was live.
    pub fn disconnect(&self) -> bool {
        let id = self.generation.advance();
        self.gateway.unbind();
        let previous = self.session.send_replace(Session::disconnected(id));
        let was_connected = previous.state == ConnectionState::Connected;
        if was_connected {
            info!(session_id = previous.id, "wallet disconnected");
        }
        was_connected
    }

    /// Re-checks the session after the wallet reported an external change.
    ///
    /// A chain switch always rebinds because the contract handle belongs to
    /// the old chain. An account switch rebinds only when the exposed
    /// account differs from the stored one.
    pub async fn reconcile(
        &self,
        notification: &WalletNotification,
    ) -> Result<Reconciliation> {
        let stored = {
            let session = self.session.borrow();
            if session.state != ConnectionState::Connected {
                return Ok(Reconciliation::Unchanged);
            }
            session.address.clone()
        };
        let current = match self.provider.accounts().await {
            Ok(accounts) => accounts.into_iter().next(),
            Err(err) => {
                warn!(?err, "could not re-read wallet accounts");
                None
            }
        };
        let chain_changed = matches!(notification, WalletNotification::ChainChanged(_));
        if !chain_changed && current == stored {
            return Ok(Reconciliation::Unchanged);
        }

        info!(?notification, "wallet changed outside the session; resetting");
        self.disconnect();
        if current.is_none() {
            return Ok(Reconciliation::Dropped);
        }
        self.connect().await.map(Reconciliation::Reestablished)
    }
}

fn connection_failed(err: ChainError) -> SessionError {
    if err.code == Some(USER_REJECTED_CODE) {
        return SessionError::ConnectionFailed {
            cause: "request was rejected in the wallet".to_owned(),
        };
    }
    SessionError::ConnectionFailed { cause: err.message }
}
