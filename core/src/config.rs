use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use devloop_protocol::RunTarget;
use serde::Deserialize;

use crate::error::DevLoopError;
use crate::error::Result;

const DEFAULT_GRACE_PERIOD_MS: u64 = 10_000;
const MIN_GRACE_PERIOD_MS: u64 = 500;
const MAX_GRACE_PERIOD_MS: u64 = 600_000; // 10 minutes

/// What counts as sign of life for the Starting -> Running transition.
///
/// Policy, not platform detection: hosts where the spawn signal is
/// unreliable opt into `FirstOutput` through configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// The OS reported the process as started.
    #[default]
    SpawnSignal,
    /// The first stdout chunk received while still starting.
    FirstOutput,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevLoopConfig {
    /// Component CLI executable that provides the dev loop and the remote
    /// resource cleanup.
    pub component_cli: PathBuf,
    /// Arguments that start the dev loop in the workspace directory.
    pub dev_args: Vec<String>,
    /// Extra arguments appended when the session targets a local container
    /// engine instead of the cluster.
    pub container_args: Vec<String>,
    /// Arguments that delete previously pushed resources. The component
    /// resource name is appended as the final argument.
    pub cleanup_args: Vec<String>,
    /// Grace period before the first escalation prompt, in milliseconds.
    pub grace_period_ms: u64,
    pub readiness: ReadinessPolicy,
}

impl Default for DevLoopConfig {
    fn default() -> Self {
        Self {
            component_cli: PathBuf::from("codev"),
            dev_args: vec!["dev".to_string()],
            container_args: vec!["--platform".to_string(), "container".to_string()],
            cleanup_args: vec![
                "delete".to_string(),
                "component".to_string(),
                "--force".to_string(),
                "--name".to_string(),
            ],
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            readiness: ReadinessPolicy::default(),
        }
    }
}

impl DevLoopConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| DevLoopError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| DevLoopError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(
            self.grace_period_ms
                .clamp(MIN_GRACE_PERIOD_MS, MAX_GRACE_PERIOD_MS),
        )
    }

    /// Command line that starts the dev loop for the given run target.
    pub fn dev_command(&self, run_target: Option<RunTarget>) -> (PathBuf, Vec<String>) {
        let mut args = self.dev_args.clone();
        if let Some(RunTarget::Container) = run_target {
            args.extend(self.container_args.iter().cloned());
        }
        (self.component_cli.clone(), args)
    }

    /// Command line that deletes resources pushed by a previous run.
    pub fn cleanup_command(&self, resource: &str) -> (PathBuf, Vec<String>) {
        let mut args = self.cleanup_args.clone();
        args.push(resource.to_string());
        (self.component_cli.clone(), args)
    }
}
