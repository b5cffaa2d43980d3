//! Orchestrates the process handle, escalation timer, and session state
//! machine into the start / stop / force-stop verbs, and pipes dev-loop
//! output into the terminal sink.

use std::process::Stdio;
use std::sync::Arc;

use devloop_protocol::DebugState;
use devloop_protocol::DeployState;
use devloop_protocol::DevState;
use devloop_protocol::RunTarget;
use devloop_protocol::SessionStatus;
use devloop_protocol::WorkspaceId;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::collab::ComponentDescriptor;
use crate::collab::OutputSink;
use crate::collab::SinkProvider;
use crate::collab::UserPrompt;
use crate::config::DevLoopConfig;
use crate::config::ReadinessPolicy;
use crate::error::DevLoopError;
use crate::error::Result;
use crate::escalation::EscalationTimer;
use crate::process::OutputStream;
use crate::process::ProcessEvent;
use crate::process::ProcessHandle;
use crate::process::SignalKind;
use crate::registry::SessionRegistry;
use crate::session::DevSession;
use crate::session::StopRequest;

pub struct DevSessionController {
    registry: Arc<SessionRegistry>,
    config: DevLoopConfig,
    prompt: Arc<dyn UserPrompt>,
    sinks: Arc<dyn SinkProvider>,
}

impl DevSessionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: DevLoopConfig,
        prompt: Arc<dyn UserPrompt>,
        sinks: Arc<dyn SinkProvider>,
    ) -> Self {
        Self {
            registry,
            config,
            prompt,
            sinks,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Starts the dev loop for a workspace. A no-op returning the current
    /// status while the session is already live in any form; at most one
    /// dev process per workspace ever exists.
    ///
    /// The session lock is held across the whole critical section, so a
    /// racing second start waits and then observes Starting.
    pub async fn start(
        &self,
        workspace: &WorkspaceId,
        run_target: Option<RunTarget>,
    ) -> Result<SessionStatus> {
        let session = self.registry.get_or_create(workspace).await;
        let mut guard = session.lock().await;
        if guard.dev_state() != DevState::NotRunning {
            info!(%workspace, state = %guard.dev_state(), "start ignored; session already live");
            return Ok(guard.status());
        }

        // Alternate run targets provision nothing on the cluster, so there
        // is nothing to clean up for them.
        if run_target.is_none() {
            self.cleanup_previous_resources(workspace, guard.component())
                .await;
        }

        guard.set_run_target(run_target);
        guard.advance(DevState::Starting)?;
        self.registry.emit(workspace, guard.status());

        let (program, args) = self.config.dev_command(run_target);
        info!(%workspace, program = %program.display(), "starting dev loop");
        let spawned = ProcessHandle::spawn(&program, &args, workspace.path()).await;
        let (handle, events) = match spawned {
            Ok(pair) => pair,
            Err(err) => {
                // Terminal for this attempt; the state machine never rests
                // in Starting across the error return.
                warn!(%workspace, error = %err, "failed to spawn dev loop");
                guard.set_run_target(None);
                guard.advance(DevState::NotRunning)?;
                self.registry.emit(workspace, guard.status());
                return Err(err);
            }
        };

        let sink = self.sinks.open(workspace, &guard.label());
        let (force_tx, force_rx) = mpsc::channel(1);
        guard.process = Some(handle);
        guard.force_tx = Some(force_tx);

        let ctx = SupervisionContext {
            registry: Arc::clone(&self.registry),
            session: Arc::clone(&session),
            workspace: workspace.clone(),
            sink,
            readiness: self.config.readiness,
        };
        tokio::spawn(supervise_session(ctx, events, force_rx));

        Ok(guard.status())
    }

    /// Begins the two-stage shutdown: interrupt now, escalate after the
    /// configured grace period. Legal from Running, or from Starting as
    /// the cancel-before-ready case; a stop already in flight wins.
    pub async fn request_stop(&self, workspace: &WorkspaceId) -> Result<()> {
        let Some(session) = self.registry.get(workspace).await else {
            return Err(DevLoopError::StopUnavailable {
                state: DevState::NotRunning,
            });
        };
        let mut guard = session.lock().await;
        let state = guard.dev_state();
        if !matches!(state, DevState::Running | DevState::Starting) || guard.stop.is_some() {
            return Err(DevLoopError::StopUnavailable { state });
        }

        if let Some(process) = guard.process.as_ref() {
            info!(%workspace, pid = process.pid(), "requesting graceful dev loop shutdown");
            if let Err(err) = process.signal(SignalKind::Interrupt).await {
                // Raced with natural exit; the exit event settles the
                // session either way.
                debug!(%workspace, error = %err, "interrupt not delivered");
            }
        }

        guard.advance(DevState::Stopping)?;
        let mut timer = EscalationTimer::new();
        if let Some(force_tx) = guard.force_tx.clone() {
            timer.arm(
                workspace.clone(),
                self.config.grace_period(),
                Arc::clone(&self.prompt),
                force_tx,
            )?;
        } else {
            error!(%workspace, "stop requested without a supervision channel");
        }
        guard.stop = Some(StopRequest {
            timer,
            abort_sent: false,
        });
        self.registry.emit(workspace, guard.status());
        Ok(())
    }

    /// Immediate forceful termination. Valid only while a stop is in
    /// flight; repeated calls after the abort went out are no-ops.
    pub async fn force_stop(&self, workspace: &WorkspaceId) -> Result<()> {
        let Some(session) = self.registry.get(workspace).await else {
            return Err(DevLoopError::ForceUnavailable {
                state: DevState::NotRunning,
            });
        };
        let mut guard = session.lock().await;
        let state = guard.dev_state();
        if state != DevState::Stopping || guard.stop.is_none() {
            return Err(DevLoopError::ForceUnavailable { state });
        }
        send_abort(&mut guard, workspace).await;
        Ok(())
    }

    pub async fn status(&self, workspace: &WorkspaceId) -> SessionStatus {
        match self.registry.get(workspace).await {
            Some(session) => session.lock().await.status(),
            None => SessionStatus::default(),
        }
    }

    pub async fn session_label(&self, workspace: &WorkspaceId) -> String {
        match self.registry.get(workspace).await {
            Some(session) => session.lock().await.label(),
            None => workspace.dir_name(),
        }
    }

    /// Sink input callback target: an interrupt keystroke typed into the
    /// terminal is a stop request.
    pub async fn handle_terminal_interrupt(&self, workspace: &WorkspaceId) {
        match self.request_stop(workspace).await {
            Ok(()) => {}
            Err(DevLoopError::StopUnavailable { state }) => {
                debug!(%workspace, %state, "terminal interrupt ignored")
            }
            Err(err) => warn!(%workspace, error = %err, "terminal interrupt failed"),
        }
    }

    /// The terminal was closed while the process is alive; treat it as a
    /// stop request unless one is already in flight.
    pub async fn handle_terminal_closed(&self, workspace: &WorkspaceId) {
        match self.request_stop(workspace).await {
            Ok(()) => info!(%workspace, "terminal closed; stopping dev loop"),
            Err(DevLoopError::StopUnavailable { state }) => {
                debug!(%workspace, %state, "terminal close ignored")
            }
            Err(err) => warn!(%workspace, error = %err, "terminal close handling failed"),
        }
    }

    /// Debug axis, mutated here on behalf of the debug subsystem.
    pub async fn set_debug_attached(&self, workspace: &WorkspaceId, attached: bool) {
        let session = self.registry.get_or_create(workspace).await;
        let mut guard = session.lock().await;
        guard.set_debug(if attached {
            DebugState::Attached
        } else {
            DebugState::NotAttached
        });
        self.registry.emit(workspace, guard.status());
    }

    /// Deploy axis, independent of the dev loop.
    pub async fn set_deployed(&self, workspace: &WorkspaceId, deployed: bool) {
        let session = self.registry.get_or_create(workspace).await;
        let mut guard = session.lock().await;
        guard.set_deploy(if deployed {
            DeployState::Deployed
        } else {
            DeployState::NotDeployed
        });
        self.registry.emit(workspace, guard.status());
    }

    /// Deletes resources pushed by a previous run. Best effort: the dev
    /// loop reconciles remote state itself, so a failed cleanup is a
    /// warning, never a blocked start.
    async fn cleanup_previous_resources(
        &self,
        workspace: &WorkspaceId,
        component: &ComponentDescriptor,
    ) {
        let Some(resource) = component.resource_name.as_deref() else {
            return;
        };
        let (program, args) = self.config.cleanup_command(resource);
        debug!(%workspace, resource, "deleting previously pushed resources before start");
        let outcome = Command::new(&program)
            .args(&args)
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match outcome {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(%workspace, code = ?status.code(), "pre-start resource cleanup exited with failure")
            }
            Err(err) => warn!(%workspace, error = %err, "pre-start resource cleanup could not run"),
        }
    }
}

struct SupervisionContext {
    registry: Arc<SessionRegistry>,
    session: Arc<Mutex<DevSession>>,
    workspace: WorkspaceId,
    sink: Arc<dyn OutputSink>,
    readiness: ReadinessPolicy,
}

/// Funnels everything that can mutate one session (process events and
/// escalation force requests), so a single workspace sees exactly one
/// transition at a time, in arrival order.
async fn supervise_session(
    ctx: SupervisionContext,
    mut events: mpsc::Receiver<ProcessEvent>,
    mut force_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ProcessEvent::Spawned { pid }) => on_spawned(&ctx, pid).await,
                Some(ProcessEvent::Output { stream, chunk }) => {
                    on_output(&ctx, stream, &chunk).await
                }
                Some(ProcessEvent::Exited { code }) => {
                    on_exited(&ctx, code).await;
                    return;
                }
                None => {
                    error!(workspace = %ctx.workspace, "event channel closed without an exit event");
                    on_exited(&ctx, None).await;
                    return;
                }
            },
            Some(()) = force_rx.recv() => on_force(&ctx).await,
        }
    }
}

async fn on_spawned(ctx: &SupervisionContext, pid: u32) {
    debug!(workspace = %ctx.workspace, pid, "dev loop spawned");
    if ctx.readiness == ReadinessPolicy::SpawnSignal {
        mark_running(ctx).await;
    }
}

async fn on_output(ctx: &SupervisionContext, stream: OutputStream, chunk: &[u8]) {
    let text = normalize_line_endings(&String::from_utf8_lossy(chunk));
    ctx.sink.push_chunk(&text);
    if ctx.readiness == ReadinessPolicy::FirstOutput && stream == OutputStream::Stdout {
        mark_running(ctx).await;
    }
}

/// Sign of life observed; only meaningful while still Starting. A stop
/// that raced ahead wins.
async fn mark_running(ctx: &SupervisionContext) {
    let mut guard = ctx.session.lock().await;
    if guard.dev_state() != DevState::Starting {
        return;
    }
    match guard.advance(DevState::Running) {
        Ok(()) => ctx.registry.emit(&ctx.workspace, guard.status()),
        Err(err) => error!(workspace = %ctx.workspace, error = %err, "sign-of-life transition failed"),
    }
}

async fn on_exited(ctx: &SupervisionContext, code: Option<i32>) {
    let mut guard = ctx.session.lock().await;
    let state = guard.dev_state();
    info!(workspace = %ctx.workspace, ?code, %state, "dev loop exited");
    if state == DevState::Starting && code != Some(0) {
        warn!(workspace = %ctx.workspace, ?code, "dev loop exited before it was ready");
    }
    guard.clear_run_resources();
    if state != DevState::NotRunning
        && let Err(err) = guard.advance(DevState::NotRunning)
    {
        error!(workspace = %ctx.workspace, error = %err, "exit transition failed");
    }
    ctx.registry.emit(&ctx.workspace, guard.status());
}

/// The user chose "force now" at the escalation prompt.
async fn on_force(ctx: &SupervisionContext) {
    let mut guard = ctx.session.lock().await;
    if guard.dev_state() != DevState::Stopping {
        return;
    }
    send_abort(&mut guard, &ctx.workspace).await;
}

/// Sends Abort once per stop request; the timer is cancelled so no further
/// prompts appear while the kill takes effect.
async fn send_abort(guard: &mut DevSession, workspace: &WorkspaceId) {
    let Some(stop) = guard.stop.as_mut() else {
        return;
    };
    if stop.abort_sent {
        return;
    }
    stop.abort_sent = true;
    stop.timer.cancel();
    info!(%workspace, "force-terminating dev loop");
    if let Some(process) = guard.process.as_ref()
        && let Err(err) = process.signal(SignalKind::Abort).await
    {
        debug!(%workspace, error = %err, "abort raced with exit");
    }
}

/// Converts bare `\n` to the sink's `\r\n` convention without doubling
/// pairs that already carry a carriage return.
fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut prev_cr = false;
    for ch in text.chars() {
        if ch == '\n' && !prev_cr {
            out.push('\r');
        }
        prev_cr = ch == '\r';
        out.push(ch);
    }
    out
}
