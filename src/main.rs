use anyhow::Result;
use clap::Parser;

use devos_orchestrator::cli::{Cli, Commands};
use devos_orchestrator::config::{config, init_config};
use devos_orchestrator::orchestrator::Orchestrator;
use devos_orchestrator::telemetry::{init_telemetry, shutdown_telemetry};
use devos_orchestrator::{pipeline, queue, store};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = init_telemetry() {
        eprintln!("Warning: Failed to initialize telemetry: {e}");
    }
    init_config()?;

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve => {
            let orchestrator = Orchestrator::build(config()?.clone())?;
            orchestrator.serve().await
        }
        Commands::Recover => run_recover().await,
        Commands::Status => run_status().await,
    };

    shutdown_telemetry();
    result
}

async fn run_recover() -> Result<()> {
    let orchestrator = Orchestrator::build(config()?.clone())?;
    let actions = orchestrator.recover().await?;
    if actions.is_empty() {
        println!("Nothing to recover: every pipeline is idle or terminal.");
        return Ok(());
    }
    for action in actions {
        match action {
            pipeline::ResumeAction::Resume {
                project_id,
                agent_type,
                story_id,
                ..
            } => println!(
                "resumed project {project_id}: re-enqueued {agent_type} (story: {})",
                story_id.as_deref().unwrap_or("-")
            ),
            pipeline::ResumeAction::MarkedFailed { project_id, reason } => {
                println!("marked project {project_id} failed: {reason}")
            }
        }
    }
    Ok(())
}

async fn run_status() -> Result<()> {
    use store::{JobStore, PipelineStore};

    let cfg = config()?;
    let job_store = store::FileJobStore::new(
        cfg.job_queue_backend_url
            .strip_prefix("file://")
            .unwrap_or(&cfg.job_queue_backend_url),
    );
    let pipeline_store = store::FilePipelineStore::new(
        cfg.pipeline_state_backend_url
            .strip_prefix("file://")
            .unwrap_or(&cfg.pipeline_state_backend_url),
    );

    let jobs = job_store.all().await?;
    let (mut waiting, mut active, mut completed, mut failed) = (0, 0, 0, 0);
    for job in &jobs {
        match job.status {
            queue::JobStatus::Pending | queue::JobStatus::Retrying => waiting += 1,
            queue::JobStatus::Processing => active += 1,
            queue::JobStatus::Completed => completed += 1,
            queue::JobStatus::Failed => failed += 1,
        }
    }
    println!("jobs: {waiting} waiting, {active} active, {completed} completed, {failed} failed");

    let contexts = pipeline_store.load_all_contexts().await?;
    if contexts.is_empty() {
        println!("pipelines: none");
    } else {
        for context in contexts {
            println!(
                "pipeline {}: {} (story: {}, retries: {}/{})",
                context.project_id,
                context.current_state,
                context.current_story_id.as_deref().unwrap_or("-"),
                context.retry_count,
                context.max_retries,
            );
        }
    }
    Ok(())
}
