//! Command-line interface for the orchestrator binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "devos-orchestrator",
    about = "Autonomous pipeline orchestrator for the DevOS agent chain"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator: queue workers, pipeline recovery, and the
    /// HTTP control plane.
    Serve,
    /// Run startup recovery once and report what was resumed.
    Recover,
    /// Print queue stats and pipeline contexts from the durable stores.
    Status,
}
