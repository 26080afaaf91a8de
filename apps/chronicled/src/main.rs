use std::path::PathBuf;

use anyhow::{Context, Result};
use chronicle_kernel::{ChronicleKernel, KernelBuilder};
use chronicle_protocol::{BranchName, CheckpointSource, ExecutionState, Message, ThreadId};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chronicled")]
#[command(about = "Chronicle durable-session demo daemon")]
struct Cli {
    #[arg(long, default_value = ".chronicle")]
    root: PathBuf,
    /// JSON file with a durable config (frequency, retention).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep everything in memory; the simulated restart then starts empty.
    #[arg(long)]
    in_memory: bool,
    #[arg(long)]
    json_logs: bool,
    #[arg(long, default_value = "demo session")]
    thread_name: String,
}

impl Cli {
    async fn kernel(&self) -> Result<ChronicleKernel> {
        let builder = if self.in_memory {
            KernelBuilder::in_memory()
        } else {
            KernelBuilder::new(&self.root)
        };
        let builder = match &self.config {
            Some(path) => builder.config_file(path).await?,
            None => builder,
        };
        Ok(builder.build())
    }
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let thread_id = run_until_crash(&cli).await?;
    resume_and_branch(&cli, &thread_id).await
}

/// First process lifetime: two turns, the second interrupted mid-iteration
/// after one tool call completed.
async fn run_until_crash(cli: &Cli) -> Result<ThreadId> {
    let kernel = cli.kernel().await?;
    let mut events = kernel.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let rendered = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
            info!(event = %rendered, "durability.event");
        }
    });

    let mut thread = kernel.create_thread(cli.thread_name.clone()).await?;
    info!(thread_id = %thread.thread_id, "thread created");

    thread.push_message(Message::system("You are a release assistant."));
    thread.push_message(Message::user("Cut release 1.4."));
    thread.push_message(Message::assistant("Release 1.4 tagged."));
    kernel.on_iteration(&thread, 1, true);
    kernel.mark_forkable(&thread).await?;

    thread.push_message(Message::user("Now publish the changelog and notify the team."));
    thread.execution_state = Some(ExecutionState::at_iteration(2));
    if kernel.on_iteration(&thread, 2, false).is_none() {
        kernel
            .durable()
            .save_checkpoint(&thread, CheckpointSource::Manual, 2);
    }
    kernel.durable().save_pending_write(
        &thread.thread_id,
        "publish-changelog",
        json!({"url": "https://example.invalid/changelog/1.4"}),
    );
    warn!("simulating a crash before the notify step completes");

    kernel.shutdown().await;
    event_task.abort();
    let _ = event_task.await;
    Ok(thread.thread_id)
}

/// Second process lifetime: resume, finish the interrupted turn, then fork
/// from the first turn and switch to the fork.
async fn resume_and_branch(cli: &Cli, thread_id: &ThreadId) -> Result<()> {
    let kernel = cli.kernel().await?;
    let Some(resume_point) = kernel.resume(thread_id, &CancellationToken::new()).await? else {
        info!(%thread_id, "nothing to resume; starting fresh");
        return Ok(());
    };
    info!(
        checkpoint_id = %resume_point.checkpoint.metadata.checkpoint_id,
        incomplete = resume_point.is_incomplete(),
        pending = resume_point.pending_writes.len(),
        "resume point found"
    );

    let mut thread = resume_point.begin(None)?;
    thread.push_message(Message::tool_result("publish-changelog", "changelog published"));
    thread.push_message(Message::assistant("Changelog published and team notified."));
    thread.execution_state = None;
    kernel.on_iteration(&thread, 3, true);

    let first_turn = kernel
        .store()
        .get_manifest(thread_id, Default::default())
        .await?
        .into_iter()
        .rev()
        .find(|entry| entry.is_snapshot)
        .context("first turn snapshot missing")?;
    let forked = kernel
        .fork(thread_id, &first_turn.checkpoint_id, BranchName::from("hotfix"))
        .await?;
    info!(messages = forked.message_count(), "forked hotfix branch from first turn");

    kernel.switch_branch(thread_id, &BranchName::from("hotfix")).await?;
    let tree = kernel.branch_tree(thread_id).await?;
    info!(tree = %serde_json::to_string(&tree)?, "branch tree");

    kernel.shutdown().await;
    Ok(())
}
