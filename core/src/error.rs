use std::io;
use std::path::PathBuf;

use devloop_protocol::DevState;
use devloop_protocol::WorkspaceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevLoopError {
    /// The dev-loop executable could not be located or launched. Fatal to
    /// the start attempt; the session reverts to not-running.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The caller tried to remove a session that still backs a live OS
    /// process. Rejected without any state change.
    #[error("workspace {workspace} still has a live dev process; stop it first")]
    SessionBusy { workspace: WorkspaceId },

    /// Interrupt/abort raced with process exit. Callers swallow this.
    #[error("process already exited; signal not delivered")]
    SignalDelivery,

    /// Stop requested in a state where no stop is possible, or while one is
    /// already in flight.
    #[error("stop is not available while the session is {state}")]
    StopUnavailable { state: DevState },

    /// Force stop requested without an in-flight stop request.
    #[error("force stop requires an in-flight stop request (session is {state})")]
    ForceUnavailable { state: DevState },

    /// A dev-state transition outside the legal set was attempted. This is
    /// a programming error, surfaced defensively instead of panicking.
    #[error("illegal dev state transition: {from} -> {to}")]
    IllegalTransition { from: DevState, to: DevState },

    /// A second arm of an escalation timer that is already armed.
    #[error("escalation timer is already armed")]
    TimerAlreadyArmed,

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl DevLoopError {
    pub(crate) fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DevLoopError>;
