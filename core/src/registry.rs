//! The concurrency boundary for multi-workspace operation: the only place
//! that creates or destroys session records, and the owner of the change
//! notification channel UI renderers subscribe to.

use std::collections::HashMap;
use std::sync::Arc;

use devloop_protocol::DevState;
use devloop_protocol::SessionChange;
use devloop_protocol::SessionStatus;
use devloop_protocol::WorkspaceId;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::collab::DescriptorSource;
use crate::error::DevLoopError;
use crate::error::Result;
use crate::process::SignalKind;
use crate::session::DevSession;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Lock order: the registry map is always taken before any session lock.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<WorkspaceId, Arc<Mutex<DevSession>>>>,
    changes: broadcast::Sender<SessionChange>,
    descriptors: Arc<dyn DescriptorSource>,
}

impl SessionRegistry {
    pub fn new(descriptors: Arc<dyn DescriptorSource>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            sessions: Mutex::new(HashMap::new()),
            changes,
            descriptors,
        }
    }

    /// Change notifications, keyed by workspace. UI renderers react to
    /// this stream and never poll.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    pub(crate) fn emit(&self, workspace: &WorkspaceId, status: SessionStatus) {
        let _ = self.changes.send(SessionChange {
            workspace: workspace.clone(),
            status,
        });
    }

    pub async fn get_or_create(&self, workspace: &WorkspaceId) -> Arc<Mutex<DevSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(workspace) {
            return Arc::clone(session);
        }
        let component = self.descriptors.describe(workspace);
        info!(%workspace, component = component.name, "creating dev session record");
        let session = Arc::new(Mutex::new(DevSession::new(workspace.clone(), component)));
        sessions.insert(workspace.clone(), Arc::clone(&session));
        session
    }

    pub async fn get(&self, workspace: &WorkspaceId) -> Option<Arc<Mutex<DevSession>>> {
        let sessions = self.sessions.lock().await;
        sessions.get(workspace).map(Arc::clone)
    }

    /// Discards a workspace's session record. Rejected while the record
    /// still backs a live OS process; removing an unknown workspace is a
    /// no-op.
    pub async fn remove(&self, workspace: &WorkspaceId) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(workspace) else {
            return Ok(());
        };
        let session = Arc::clone(session);
        let guard = session.lock().await;
        if guard.dev_state() != DevState::NotRunning {
            return Err(DevLoopError::SessionBusy {
                workspace: workspace.clone(),
            });
        }
        drop(guard);
        sessions.remove(workspace);
        debug!(%workspace, "dev session record removed");
        Ok(())
    }

    /// Drains every session at deactivation. Anything still alive is
    /// force-terminated and its timer cancelled before the record is
    /// discarded.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().collect()
        };
        for (workspace, session) in drained {
            let mut guard = session.lock().await;
            if let Some(process) = guard.process.as_ref() {
                warn!(%workspace, pid = process.pid(), "force-terminating live dev loop at shutdown");
                if let Err(err) = process.signal(SignalKind::Abort).await {
                    debug!(%workspace, error = %err, "abort raced with exit during shutdown");
                }
            }
            if guard.dev_state() != DevState::NotRunning
                && let Err(err) = guard.advance(DevState::NotRunning)
            {
                warn!(%workspace, error = %err, "failed to settle session state at shutdown");
            }
            guard.clear_run_resources();
        }
    }
}
