use crate::error::SessionError;
use serde::Serialize;
use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time,
};
use tracing::debug;

pub const ALERT_DURATION: Duration = Duration::from_secs(5);
pub const REVERT_PREFIX: &str = "execution reverted: ";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    #[default]
    Info,
    Success,
    Failure,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub status: bool,
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    fn showing(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            status: true,
            kind,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::showing(AlertKind::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::showing(AlertKind::Success, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::showing(AlertKind::Failure, message)
    }
}

/// Pulls `<reason>` out of `"execution reverted: <reason>"`.
pub fn revert_reason(raw: &str) -> Option<&str> {
    let reason = raw.strip_prefix(REVERT_PREFIX)?.trim();
    (!reason.is_empty()).then_some(reason)
}

/// Turns a failure into the alert the user sees.
pub fn decode(err: &SessionError) -> Alert {
    if let SessionError::TransactionReverted { reason } = err
        && let Some(reason) = revert_reason(reason)
    {
        return Alert::failure(reason);
    }
    if let SessionError::InvalidInput(message) = err {
        return Alert::failure(message.as_str());
    }
    Alert::failure(err.to_string())
}

struct TimerSlot {
    epoch: u64,
    dismissal: Option<JoinHandle<()>>,
}

/// Single-slot alert with a fixed lifetime. A new alert replaces the
/// current one and restarts the dismissal timer.
pub struct AlertController {
    state: Arc<watch::Sender<Alert>>,
    slot: Arc<Mutex<TimerSlot>>,
    duration: Duration,
}

impl Default for AlertController {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertController {
    pub fn new() -> Self {
        Self::with_duration(ALERT_DURATION)
    }

    pub fn with_duration(duration: Duration) -> Self {
        let (state, _) = watch::channel(Alert::default());
        Self {
            state: Arc::new(state),
            slot: Arc::new(Mutex::new(TimerSlot {
                epoch: 0,
                dismissal: None,
            })),
            duration,
        }
    }

    pub fn current(&self) -> Alert {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Alert> {
        self.state.subscribe()
    }

    pub fn show(&self, alert: Alert) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.dismissal.take() {
            previous.abort();
        }
        slot.epoch += 1;
        let epoch = slot.epoch;
        debug!(kind = ?alert.kind, message = %alert.message, "showing alert");
        self.state.send_replace(alert);

        let state = Arc::clone(&self.state);
        let timer_slot = Arc::clone(&self.slot);
        let duration = self.duration;
        slot.dismissal = Some(tokio::spawn(async move {
            time::sleep(duration).await;
            let mut slot = timer_slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.epoch == epoch {
                state.send_replace(Alert::default());
                slot.dismissal = None;
            }
        }));
    }

    pub fn show_error(&self, err: &SessionError) {
        if err.is_user_visible() {
            self.show(decode(err));
        }
    }

    pub fn dismiss(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = slot.dismissal.take() {
            timer.abort();
        }
        slot.epoch += 1;
        self.state.send_replace(Alert::default());
    }

    /// Stops any pending dismissal without touching the visible alert.
    pub fn teardown(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = slot.dismissal.take() {
            timer.abort();
        }
        slot.epoch += 1;
    }
}

impl Drop for AlertController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn decode__extracts_revert_reason() {
        // given
        let err = SessionError::TransactionReverted {
            reason: "execution reverted: Not enough mana".into(),
        };

        // when
        let alert = decode(&err);

        // then
        assert_eq!(alert, Alert::failure("Not enough mana"));
    }

    #[test]
    fn decode__other_errors_become_generic_failures() {
        // given
        let err = SessionError::TransactionTimeout;

        // when
        let alert = decode(&err);

        // then
        assert_eq!(alert.kind, AlertKind::Failure);
        assert_eq!(alert.message, err.to_string());
    }

    #[test]
    fn decode__revert_without_reason_frame_is_not_parsed() {
        let err = SessionError::TransactionReverted {
            reason: "out of gas".into(),
        };

        let alert = decode(&err);

        assert_eq!(alert.message, "Transaction reverted: out of gas");
    }

    #[test]
    fn decode__invalid_input_shows_bare_message() {
        let err = SessionError::InvalidInput("Name cannot be empty".into());

        let alert = decode(&err);

        assert_eq!(alert, Alert::failure("Name cannot be empty"));
    }

    #[tokio::test(start_paused = true)]
    async fn show__clears_after_five_seconds() {
        // given
        let alerts = AlertController::new();

        // when
        alerts.show(Alert::info("hello"));
        time::sleep(Duration::from_millis(4_900)).await;
        let before = alerts.current();
        time::sleep(Duration::from_millis(200)).await;
        let after = alerts.current();

        // then
        assert_eq!(before, Alert::info("hello"));
        assert_eq!(after, Alert::default());
    }

    #[tokio::test(start_paused = true)]
    async fn show__superseding_alert_resets_deadline() {
        // given
        let alerts = AlertController::new();
        alerts.show(Alert::info("first"));
        time::sleep(Duration::from_secs(2)).await;

        // when
        alerts.show(Alert::failure("second"));
        time::sleep(Duration::from_millis(4_900)).await;
        let at_six_point_nine = alerts.current();
        time::sleep(Duration::from_millis(200)).await;

        // then
        assert_eq!(at_six_point_nine, Alert::failure("second"));
        assert_eq!(alerts.current(), Alert::default());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown__cancels_pending_dismissal() {
        // given
        let alerts = AlertController::new();
        alerts.show(Alert::success("done"));

        // when
        alerts.teardown();
        time::sleep(Duration::from_secs(10)).await;

        // then
        assert_eq!(alerts.current(), Alert::success("done"));
    }

    #[tokio::test]
    async fn show_error__ignores_stale_session() {
        // given
        let alerts = AlertController::new();

        // when
        alerts.show_error(&SessionError::StaleSession);

        // then
        assert_eq!(alerts.current(), Alert::default());
    }
}
