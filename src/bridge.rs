use crate::{
    error::Result,
    gateway::{
        BattleEventKind,
        ContractEvent,
        ContractGateway,
        ContractHandle,
        SubscriptionId,
    },
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
};
use tracing::{
    debug,
    info,
};

/// Requests a resync. Pulses fired while a resync is running collapse into
/// a single trailing run.
#[derive(Clone, Debug, Default)]
pub struct ResyncTrigger {
    notify: Arc<Notify>,
}

impl ResyncTrigger {
    pub fn pulse(&self) {
        self.notify.notify_one();
    }
}

/// Runs resyncs one at a time on a background task.
pub struct ResyncScheduler {
    trigger: ResyncTrigger,
    worker: JoinHandle<()>,
}

impl ResyncScheduler {
    pub fn start<F, Fut>(mut resync: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let trigger = ResyncTrigger::default();
        let notify = Arc::clone(&trigger.notify);
        let worker = tokio::spawn(async move {
            loop {
                notify.notified().await;
                resync().await;
            }
        });
        Self { trigger, worker }
    }

    pub fn trigger(&self) -> ResyncTrigger {
        self.trigger.clone()
    }

    pub fn stop(&self) {
        self.worker.abort();
    }
}

impl Drop for ResyncScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Unarmed,
    Armed { session_id: u64 },
}

#[derive(Clone, Copy, Debug)]
enum Arming {
    Unarmed,
    Armed {
        session_id: u64,
        subscription: SubscriptionId,
    },
}

/// Turns contract events into resync pulses for the lifetime of one session.
pub struct EventListenerBridge {
    arming: Mutex<Arming>,
}

impl Default for EventListenerBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListenerBridge {
    pub fn new() -> Self {
        Self {
            arming: Mutex::new(Arming::Unarmed),
        }
    }

    pub fn state(&self) -> BridgeState {
        match *self.arming.lock().unwrap_or_else(PoisonError::into_inner) {
            Arming::Unarmed => BridgeState::Unarmed,
            Arming::Armed { session_id, .. } => BridgeState::Armed { session_id },
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state() != BridgeState::Unarmed
    }

    /// Subscribes to the battle lifecycle events for `session_id`. Returns
    /// false when the bridge is already armed for that session.
    pub async fn arm<H: ContractHandle>(
        &self,
        gateway: &ContractGateway<H>,
        session_id: u64,
        trigger: ResyncTrigger,
    ) -> Result<bool> {
        if self.state() == (BridgeState::Armed { session_id }) {
            return Ok(false);
        }
        self.disarm(gateway);

        let subscription = gateway
            .subscribe(
                &BattleEventKind::LIFECYCLE,
                Arc::new(move |event: &ContractEvent| {
                    debug!(kind = ?event.kind, block = ?event.block_number, "contract event");
                    trigger.pulse();
                }),
            )
            .await?;

        let mut arming = self.arming.lock().unwrap_or_else(PoisonError::into_inner);
        if let Arming::Armed {
            session_id: armed, ..
        } = *arming
            && armed == session_id
        {
            // Lost a race with a concurrent arm for the same session.
            gateway.unsubscribe(subscription);
            return Ok(false);
        }
        if let Arming::Armed {
            subscription: previous,
            ..
        } = *arming
        {
            gateway.unsubscribe(previous);
        }
        *arming = Arming::Armed {
            session_id,
            subscription,
        };
        info!(session_id, "listening for battle events");
        Ok(true)
    }

    /// Drops the event subscription. Returns whether one was live.
    pub fn disarm<H: ContractHandle>(&self, gateway: &ContractGateway<H>) -> bool {
        let previous = std::mem::replace(
            &mut *self.arming.lock().unwrap_or_else(PoisonError::into_inner),
            Arming::Unarmed,
        );
        match previous {
            Arming::Unarmed => false,
            Arming::Armed {
                session_id,
                subscription,
            } => {
                gateway.unsubscribe(subscription);
                info!(session_id, "stopped listening for battle events");
                true
            }
        }
    }
}
