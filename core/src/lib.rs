//! Supervision of long-running dev-loop child processes, one per project
//! workspace: start, sign-of-life detection, output piping into a
//! terminal-like sink, and a two-stage shutdown protocol (graceful
//! interrupt, then a timed, user-mediated escalation to a forceful kill).
//!
//! The public surface is the [`DevSessionController`] verbs plus the
//! [`SessionRegistry`] change stream; everything UI-facing is a
//! collaborator trait in [`collab`].

mod collab;
mod config;
mod controller;
mod error;
mod escalation;
mod process;
mod registry;
mod session;

pub use collab::ComponentDescriptor;
pub use collab::DescriptorSource;
pub use collab::DirNameDescriptors;
pub use collab::EscalationChoice;
pub use collab::OutputSink;
pub use collab::SinkProvider;
pub use collab::UserPrompt;
pub use config::DevLoopConfig;
pub use config::ReadinessPolicy;
pub use controller::DevSessionController;
pub use error::DevLoopError;
pub use error::Result;
pub use escalation::EscalationTimer;
pub use escalation::TimerState;
pub use process::OutputStream;
pub use process::ProcessEvent;
pub use process::ProcessHandle;
pub use process::SignalKind;
pub use registry::SessionRegistry;
pub use session::DevSession;
