//! Thin terminal front-end: runs one dev session in the foreground with
//! stdout as the sink, Ctrl-C wired to the graceful stop, and the
//! escalation prompt rendered interactively.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use devloop_core::DevLoopConfig;
use devloop_core::DevSessionController;
use devloop_core::DirNameDescriptors;
use devloop_core::EscalationChoice;
use devloop_core::OutputSink;
use devloop_core::SessionRegistry;
use devloop_core::SinkProvider;
use devloop_core::UserPrompt;
use devloop_protocol::DevState;
use devloop_protocol::RunTarget;
use devloop_protocol::WorkspaceId;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const KEEP_WAITING: &str = "Keep waiting";
const FORCE_NOW: &str = "Force terminate";

#[derive(Debug, Parser)]
#[command(
    name = "devloop",
    about = "Supervise a component dev loop in the current terminal"
)]
struct Cli {
    /// Workspace directory; defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    path: Option<PathBuf>,

    /// Run the dev loop on a local container engine instead of the cluster.
    #[arg(long)]
    container: bool,

    /// Config file with command lines and the shutdown grace period.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

struct StdoutSinks;

struct StdoutSink;

impl OutputSink for StdoutSink {
    fn push_chunk(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

impl SinkProvider for StdoutSinks {
    fn open(&self, _workspace: &WorkspaceId, _title: &str) -> Arc<dyn OutputSink> {
        Arc::new(StdoutSink)
    }
}

struct TerminalPrompt;

#[async_trait]
impl UserPrompt for TerminalPrompt {
    async fn escalate(&self, workspace: &WorkspaceId, waited: Duration) -> Option<EscalationChoice> {
        let message = format!(
            "{} is still shutting down after {}s",
            workspace.dir_name(),
            waited.as_secs()
        );
        // inquire blocks on terminal input; keep it off the runtime.
        tokio::task::spawn_blocking(move || {
            let selection = inquire::Select::new(&message, vec![KEEP_WAITING, FORCE_NOW]).prompt();
            match selection {
                Ok(FORCE_NOW) => Some(EscalationChoice::ForceNow),
                Ok(_) => Some(EscalationChoice::KeepWaiting),
                Err(_) => None,
            }
        })
        .await
        .ok()
        .flatten()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => DevLoopConfig::load(path)?,
        None => DevLoopConfig::default(),
    };

    let path = match cli.path {
        Some(path) => path,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let path = path
        .canonicalize()
        .with_context(|| format!("resolve workspace directory {}", path.display()))?;
    let workspace = WorkspaceId::new(path);

    let registry = Arc::new(SessionRegistry::new(Arc::new(DirNameDescriptors)));
    let controller = DevSessionController::new(
        Arc::clone(&registry),
        config,
        Arc::new(TerminalPrompt),
        Arc::new(StdoutSinks),
    );
    let mut changes = registry.subscribe();

    let run_target = cli.container.then_some(RunTarget::Container);
    let status = controller.start(&workspace, run_target).await?;
    tracing::info!(%workspace, state = %status.dev, "dev session started");

    loop {
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => {
                ctrl_c.context("listen for ctrl-c")?;
                // First Ctrl-C asks for a graceful stop; once a stop is in
                // flight another Ctrl-C escalates to a hard kill.
                if controller.status(&workspace).await.dev == DevState::Stopping {
                    let _ = controller.force_stop(&workspace).await;
                } else {
                    controller.handle_terminal_interrupt(&workspace).await;
                }
            }
            change = changes.recv() => match change {
                Ok(change)
                    if change.workspace == workspace
                        && change.status.dev == DevState::NotRunning =>
                {
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    registry.shutdown().await;
    Ok(())
}
