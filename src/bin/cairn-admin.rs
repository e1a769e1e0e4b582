//! Operational commands: schema setup and run inspection.

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use cairn::{PostgresQueue, PostgresStore, RunId, Store};

#[derive(Parser, Debug)]
#[command(name = "cairn-admin", about = "Administrative commands for a cairn deployment")]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "CAIRN_DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the runs/subtasks/transitions/jobs tables and indexes.
    InitSchema,
    /// Print a run's state, subtasks, and transition history.
    RunStatus {
        #[arg(long)]
        run_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = PostgresStore::connect(&cli.database_url).await?;

    match cli.command {
        Command::InitSchema => {
            store.init_schema().await?;
            let queue = PostgresQueue::new(store.pool().clone());
            queue.init_schema().await?;
            println!("schema initialized");
        }
        Command::RunStatus { run_id } => {
            let run_id = RunId(run_id);
            let Some(run) = store.get_run(run_id).await? else {
                println!("run {run_id} not found");
                return Ok(());
            };
            println!("run {run_id}");
            println!("  tenant:    {}", run.tenant);
            println!("  state:     {} (v{})", run.state, run.state_version);
            println!(
                "  progress:  {}/{} completed, {} failed, {} skipped, {} cancelled",
                run.progress.completed,
                run.progress.total,
                run.progress.failed,
                run.progress.skipped,
                run.progress.cancelled,
            );
            println!("  created:   {}", run.created_at);
            if let Some(deadline) = run.deadline_at {
                println!("  deadline:  {deadline}");
            }
            if let Some(completed) = run.completed_at {
                println!("  completed: {completed}");
            }
            if let Some(outcome) = &run.outcome {
                println!("  summary:   {}", outcome.summary);
                if !outcome.artifacts.is_empty() {
                    println!("  artifacts: {}", outcome.artifacts.join(", "));
                }
            }

            println!("\nsubtasks:");
            for subtask in store.list_subtasks(run_id).await? {
                println!(
                    "  [{}] {:<10} {:<9} attempts {}/{} worker {}",
                    subtask.index,
                    subtask.kind.as_str(),
                    subtask.state.as_str(),
                    subtask.attempt_count,
                    subtask.max_attempts,
                    subtask
                        .assigned_worker
                        .as_ref()
                        .map(|worker| worker.0.as_str())
                        .unwrap_or("-"),
                );
                for error in &subtask.errors {
                    println!(
                        "      error (attempt {}): {} {}",
                        error.attempt, error.code, error.message
                    );
                }
            }

            println!("\ntransitions:");
            for record in store.transitions_for_run(run_id).await? {
                println!(
                    "  {} {} {} -> {} (v{}, {})",
                    record.at, record.entity, record.from_state, record.to_state,
                    record.version, record.trigger,
                );
            }
        }
    }
    Ok(())
}
