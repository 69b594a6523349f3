use crate::{
    error::{
        Result,
        SessionError,
    },
    gateway::{
        ContractGateway,
        ContractHandle,
    },
    types::{
        Account,
        Battle,
        GameView,
        Registration,
    },
    wallet_session::{
        Generation,
        SessionTicket,
    },
};
use tokio::sync::{
    Mutex,
    watch,
};
use tracing::{
    debug,
    warn,
};

/// Result of deriving the view from a raw battle list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    pub pending_battles: Vec<Battle>,
    pub active_battle: Option<Battle>,
    /// Ids of every battle the account looked active in. More than one
    /// means the chain data broke the one-active-battle rule.
    pub active_candidates: Vec<u64>,
    /// Entry 0 is reserved; this flags a list whose entry 0 has players.
    pub genesis_occupied: bool,
}

/// Derives pending battles and the account's active battle. Entry 0 is the
/// contract's reserved slot and never shows up in either.
pub fn project(battles: &[Battle], account: &Account) -> Projection {
    let genesis_occupied = battles
        .first()
        .is_some_and(|genesis| genesis.players.iter().any(|player| !player.is_null()));

    let mut pending_battles = Vec::new();
    let mut active: Vec<&Battle> = Vec::new();
    for battle in battles.iter().skip(1) {
        if battle.awaits_opponent() {
            pending_battles.push(battle.clone());
        }
        if battle.is_active_for(account) {
            active.push(battle);
        }
    }
    active.sort_by_key(|battle| battle.id);

    Projection {
        pending_battles,
        active_battle: active.first().map(|battle| (*battle).clone()),
        active_candidates: active.iter().map(|battle| battle.id).collect(),
        genesis_occupied,
    }
}

/// Owns the published `GameView` and keeps resyncs strictly sequential.
pub struct GameStateProjector {
    view: watch::Sender<GameView>,
    in_flight: Mutex<()>,
}

impl Default for GameStateProjector {
    fn default() -> Self {
        Self::new()
    }
}

impl GameStateProjector {
    pub fn new() -> Self {
        let (view, _) = watch::channel(GameView::default());
        Self {
            view,
            in_flight: Mutex::new(()),
        }
    }

    pub fn current(&self) -> GameView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GameView> {
        self.view.subscribe()
    }

    pub fn clear(&self) {
        self.view.send_replace(GameView::default());
    }

    /// Re-reads every battle and replaces the view. The result is dropped
    /// with `StaleSession` if the session changed while reading.
    pub async fn resync<H: ContractHandle>(
        &self,
        gateway: &ContractGateway<H>,
        ticket: &SessionTicket,
        generation: &Generation,
    ) -> Result<GameView> {
        let _running = self.in_flight.lock().await;
        if !generation.is_current(ticket) {
            return Err(SessionError::StaleSession);
        }

        let battles = gateway.all_battles().await?;
        let registration = match gateway.is_player(&ticket.account).await {
            Ok(true) => Registration::Registered,
            Ok(false) => Registration::Unregistered,
            Err(err) => {
                warn!(?err, account = %ticket.account, "could not read registration");
                Registration::Unknown
            }
        };

        let projection = project(&battles, &ticket.account);
        if projection.genesis_occupied {
            warn!("battle 0 has players; it is still treated as the reserved slot");
        }
        if projection.active_candidates.len() > 1 {
            warn!(
                account = %ticket.account,
                candidates = ?projection.active_candidates,
                "account is active in several battles; using the lowest id"
            );
        }

        let next = GameView {
            pending_battles: projection.pending_battles,
            active_battle: projection.active_battle,
            registration,
        };
        let mut stale = false;
        self.view.send_if_modified(|view| {
            if !generation.is_current(ticket) {
                stale = true;
                return false;
            }
            if *view == next {
                return false;
            }
            *view = next.clone();
            true
        });
        if stale {
            debug!(session_id = ticket.id, "dropping resync result for an old session");
            return Err(SessionError::StaleSession);
        }
        debug!(
            pending = next.pending_battles.len(),
            active = ?next.active_battle.as_ref().map(|battle| battle.id),
            "game view refreshed"
        );
        Ok(next)
    }
}
