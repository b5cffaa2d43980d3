//! Shared vocabulary for the devloop workspace: workspace identity, the
//! per-session state axes, and the change-notification payload consumed by
//! UI renderers.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Opaque key for a project folder. The absolute path of the workspace is
/// the identity; it is stable for the lifetime of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(PathBuf);

impl WorkspaceId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Last path component, used as the fallback component display name.
    pub fn dir_name(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for WorkspaceId {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

/// Dev-loop axis of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevState {
    #[default]
    NotRunning,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for DevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevState::NotRunning => write!(f, "not running"),
            DevState::Starting => write!(f, "starting"),
            DevState::Running => write!(f, "running"),
            DevState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Debugger axis, queried by a debug subsystem external to this core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugState {
    #[default]
    NotAttached,
    Attached,
}

/// Deployment axis, independent of the dev loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    #[default]
    NotDeployed,
    Deployed,
}

/// Alternate execution backend for one running session. Absent means the
/// default cluster backend. Fixed for the lifetime of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTarget {
    /// Local container engine instead of the cluster.
    Container,
}

impl fmt::Display for RunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTarget::Container => write!(f, "container"),
        }
    }
}

/// Point-in-time snapshot of one session, returned by the status query and
/// carried in every change notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub dev: DevState,
    pub debug: DebugState,
    pub deploy: DeployState,
    pub run_target: Option<RunTarget>,
}

impl SessionStatus {
    /// Label shown next to the component name, derived purely from the dev
    /// state and run target.
    pub fn label(&self, component_name: &str) -> String {
        let target = match (self.dev, self.run_target) {
            (DevState::Running, Some(target)) => format!(" on {target}"),
            _ => String::new(),
        };
        match self.dev {
            DevState::NotRunning => component_name.to_string(),
            DevState::Starting => format!("{component_name} (dev starting)"),
            DevState::Running => format!("{component_name} (dev running{target})"),
            DevState::Stopping => format!("{component_name} (dev stopping)"),
        }
    }
}

/// Change notification emitted on every state transition, keyed by the
/// workspace it concerns. UI is purely reactive to this stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChange {
    pub workspace: WorkspaceId,
    pub status: SessionStatus,
}
