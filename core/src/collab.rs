//! Contracts of the collaborators this core consumes: the user-prompt
//! facility, the terminal-like output sink, and the project descriptor
//! source. Embedders implement these; the CLI front-end ships reference
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devloop_protocol::WorkspaceId;
use serde::Deserialize;
use serde::Serialize;

/// The user's answer to the shutdown escalation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationChoice {
    /// Give the dev loop the same grace period again.
    KeepWaiting,
    /// Terminate it forcefully now.
    ForceNow,
}

/// Prompt facility: offers a choice among named options and returns the
/// selection, or `None` when the prompt is dismissed.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// Asked each time the shutdown grace period expires. `waited` is the
    /// total time spent waiting so far.
    async fn escalate(&self, workspace: &WorkspaceId, waited: Duration)
    -> Option<EscalationChoice>;
}

/// Terminal-like sink for one session's dev-loop output.
pub trait OutputSink: Send + Sync {
    /// Accepts a text chunk already converted to the sink's line-ending
    /// convention. Must not block the caller.
    fn push_chunk(&self, text: &str);
}

/// Opens a sink when a session starts, one per workspace.
pub trait SinkProvider: Send + Sync {
    fn open(&self, workspace: &WorkspaceId, title: &str) -> Arc<dyn OutputSink>;
}

/// Component facts read from the project descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Display name used in labels and sink titles.
    pub name: String,
    pub supports_debug: bool,
    pub supports_deploy: bool,
    /// Resource name for the delete-previously-pushed-resources command
    /// line. `None` skips pre-start cleanup.
    pub resource_name: Option<String>,
}

pub trait DescriptorSource: Send + Sync {
    fn describe(&self, workspace: &WorkspaceId) -> ComponentDescriptor;
}

/// Descriptor source that uses the workspace directory name. Parsing the
/// descriptor format itself is out of scope for this crate.
#[derive(Debug, Default, Clone)]
pub struct DirNameDescriptors;

impl DescriptorSource for DirNameDescriptors {
    fn describe(&self, workspace: &WorkspaceId) -> ComponentDescriptor {
        let name = workspace.dir_name();
        ComponentDescriptor {
            resource_name: Some(name.clone()),
            name,
            supports_debug: false,
            supports_deploy: false,
        }
    }
}
