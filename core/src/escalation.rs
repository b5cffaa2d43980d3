//! The "graceful, then forced" half of the shutdown protocol: a cancelable
//! countdown that, on expiry, asks the user whether to keep waiting or to
//! terminate forcefully.
//!
//! Dev loops may run remote cleanup on interrupt, which can take
//! arbitrarily long; a blind force-kill after a fixed timeout risks
//! leaving remote state inconsistent, so the user decides.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use devloop_protocol::WorkspaceId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collab::EscalationChoice;
use crate::collab::UserPrompt;
use crate::error::DevLoopError;
use crate::error::Result;

/// Lifecycle of one escalation countdown. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Expired,
    Cancelled,
}

/// One countdown per stop request. Arming twice is rejected; `cancel` is
/// idempotent and also aborts an in-flight prompt wait.
#[derive(Debug)]
pub struct EscalationTimer {
    state: Arc<StdMutex<TimerState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EscalationTimer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(TimerState::Idle)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Starts the countdown. On expiry the user is prompted; "keep
    /// waiting" re-arms with the same duration (no backoff), "force now"
    /// delivers exactly one message on `force_tx` and lands in
    /// `Cancelled`. Dismissing the prompt re-arms as well: a dismissed
    /// dialog must not leave a stopping session unsupervised.
    pub fn arm(
        &mut self,
        workspace: WorkspaceId,
        duration: Duration,
        prompt: Arc<dyn UserPrompt>,
        force_tx: mpsc::Sender<()>,
    ) -> Result<()> {
        if self.task.is_some() {
            return Err(DevLoopError::TimerAlreadyArmed);
        }
        set_state(&self.state, TimerState::Armed);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(run_countdown(
            workspace, duration, prompt, force_tx, state, cancel,
        )));
        Ok(())
    }

    /// Safe to call from any state, any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
        set_state(&self.state, TimerState::Cancelled);
    }

    pub fn state(&self) -> TimerState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(TimerState::Cancelled)
    }
}

impl Default for EscalationTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EscalationTimer {
    fn drop(&mut self) {
        // No dangling countdowns: dropping the owning stop request cancels
        // any armed timer and its in-flight prompt.
        self.cancel.cancel();
        if let Some(task) = self.task.as_ref() {
            task.abort();
        }
    }
}

/// `Cancelled` is terminal; every other write goes through here so a
/// concurrent `cancel` cannot be overwritten by the countdown task.
fn set_state(state: &StdMutex<TimerState>, next: TimerState) {
    if let Ok(mut guard) = state.lock()
        && *guard != TimerState::Cancelled
    {
        *guard = next;
    }
}

async fn run_countdown(
    workspace: WorkspaceId,
    duration: Duration,
    prompt: Arc<dyn UserPrompt>,
    force_tx: mpsc::Sender<()>,
    state: Arc<StdMutex<TimerState>>,
    cancel: CancellationToken,
) {
    let mut waited = Duration::ZERO;
    loop {
        set_state(&state, TimerState::Armed);
        tokio::select! {
            _ = cancel.cancelled() => {
                set_state(&state, TimerState::Cancelled);
                return;
            }
            _ = sleep(duration) => {}
        }
        set_state(&state, TimerState::Expired);
        waited += duration;
        let waited_ms = waited.as_millis() as u64;
        debug!(%workspace, waited_ms, "shutdown grace period expired; prompting user");

        let choice = tokio::select! {
            _ = cancel.cancelled() => {
                set_state(&state, TimerState::Cancelled);
                return;
            }
            choice = prompt.escalate(&workspace, waited) => choice,
        };

        match choice {
            Some(EscalationChoice::ForceNow) => {
                set_state(&state, TimerState::Cancelled);
                if force_tx.send(()).await.is_err() {
                    // Supervision already tore down; nothing left to force.
                    debug!(%workspace, "force request dropped; session already finished");
                }
                return;
            }
            Some(EscalationChoice::KeepWaiting) | None => continue,
        }
    }
}
