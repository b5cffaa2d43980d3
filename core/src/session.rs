//! Authoritative record of one workspace's dev/debug/deploy status,
//! independent of how it is rendered. Mutated only by the controller;
//! everyone else observes through the registry's change stream.

use devloop_protocol::DebugState;
use devloop_protocol::DeployState;
use devloop_protocol::DevState;
use devloop_protocol::RunTarget;
use devloop_protocol::SessionStatus;
use devloop_protocol::WorkspaceId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::collab::ComponentDescriptor;
use crate::error::DevLoopError;
use crate::error::Result;
use crate::escalation::EscalationTimer;
use crate::escalation::TimerState;
use crate::process::ProcessHandle;

/// Resources owned while a stop request is in flight. Present iff the dev
/// state is `Stopping`.
#[derive(Debug)]
pub(crate) struct StopRequest {
    pub(crate) timer: EscalationTimer,
    /// Set once Abort has been sent; repeated force requests are no-ops.
    pub(crate) abort_sent: bool,
}

#[derive(Debug)]
pub struct DevSession {
    workspace: WorkspaceId,
    component: ComponentDescriptor,
    dev: DevState,
    debug: DebugState,
    deploy: DeployState,
    run_target: Option<RunTarget>,
    /// Present iff `dev != NotRunning`.
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) stop: Option<StopRequest>,
    /// Delivers force requests from the escalation prompt into this
    /// session's supervision loop. Present while `process` is.
    pub(crate) force_tx: Option<mpsc::Sender<()>>,
}

impl DevSession {
    pub(crate) fn new(workspace: WorkspaceId, component: ComponentDescriptor) -> Self {
        Self {
            workspace,
            component,
            dev: DevState::NotRunning,
            debug: DebugState::NotAttached,
            deploy: DeployState::NotDeployed,
            run_target: None,
            process: None,
            stop: None,
            force_tx: None,
        }
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    pub fn component(&self) -> &ComponentDescriptor {
        &self.component
    }

    pub fn dev_state(&self) -> DevState {
        self.dev
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            dev: self.dev,
            debug: self.debug,
            deploy: self.deploy,
            run_target: self.run_target,
        }
    }

    /// Label shown next to the component, derived purely from the current
    /// dev state and run target.
    pub fn label(&self) -> String {
        self.status().label(&self.component.name)
    }

    /// State of the armed escalation timer, if a stop is in flight.
    pub fn escalation_state(&self) -> Option<TimerState> {
        self.stop.as_ref().map(|stop| stop.timer.state())
    }

    /// Applies a dev-axis transition, rejecting anything outside the legal
    /// set. The match is exhaustive over the legal pairs so a new state
    /// cannot be wired in without revisiting it.
    pub(crate) fn advance(&mut self, next: DevState) -> Result<()> {
        let from = self.dev;
        let legal = matches!(
            (from, next),
            (DevState::NotRunning, DevState::Starting)
                | (DevState::Starting, DevState::Running)
                | (DevState::Starting, DevState::Stopping)
                | (DevState::Starting, DevState::NotRunning)
                | (DevState::Running, DevState::Stopping)
                | (DevState::Running, DevState::NotRunning)
                | (DevState::Stopping, DevState::NotRunning)
        );
        if !legal {
            return Err(DevLoopError::IllegalTransition { from, to: next });
        }
        debug!(workspace = %self.workspace, %from, to = %next, "dev state transition");
        self.dev = next;
        Ok(())
    }

    pub(crate) fn set_run_target(&mut self, run_target: Option<RunTarget>) {
        self.run_target = run_target;
    }

    pub(crate) fn set_debug(&mut self, debug: DebugState) {
        self.debug = debug;
    }

    pub(crate) fn set_deploy(&mut self, deploy: DeployState) {
        self.deploy = deploy;
    }

    /// Drops everything tied to the current run: cancels any armed timer,
    /// releases the process handle and force channel, clears the run
    /// target. Called once the process is gone (or is being abandoned at
    /// shutdown).
    pub(crate) fn clear_run_resources(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.timer.cancel();
        }
        self.process = None;
        self.force_tx = None;
        self.run_target = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn session() -> DevSession {
        let workspace = WorkspaceId::new("/work/projects/api");
        DevSession::new(
            workspace,
            ComponentDescriptor {
                name: "api".to_string(),
                supports_debug: false,
                supports_deploy: false,
                resource_name: Some("api".to_string()),
            },
        )
    }

    fn force_into(session: &mut DevSession, state: DevState) {
        // Walk a legal path to the requested state.
        match state {
            DevState::NotRunning => {}
            DevState::Starting => {
                session.advance(DevState::Starting).expect("to starting");
            }
            DevState::Running => {
                session.advance(DevState::Starting).expect("to starting");
                session.advance(DevState::Running).expect("to running");
            }
            DevState::Stopping => {
                session.advance(DevState::Starting).expect("to starting");
                session.advance(DevState::Running).expect("to running");
                session.advance(DevState::Stopping).expect("to stopping");
            }
        }
    }

    #[test]
    fn only_the_legal_transitions_are_accepted() {
        let all = [
            DevState::NotRunning,
            DevState::Starting,
            DevState::Running,
            DevState::Stopping,
        ];
        let legal = [
            (DevState::NotRunning, DevState::Starting),
            (DevState::Starting, DevState::Running),
            (DevState::Starting, DevState::Stopping),
            (DevState::Starting, DevState::NotRunning),
            (DevState::Running, DevState::Stopping),
            (DevState::Running, DevState::NotRunning),
            (DevState::Stopping, DevState::NotRunning),
        ];

        for from in all {
            for to in all {
                let mut session = session();
                force_into(&mut session, from);
                let accepted = session.advance(to).is_ok();
                assert_eq!(
                    accepted,
                    legal.contains(&(from, to)),
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn label_uses_the_component_name() {
        let mut session = session();
        assert_eq!(session.label(), "api");
        force_into(&mut session, DevState::Running);
        assert_eq!(session.label(), "api (dev running)");
    }
}
