use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata request engine tools",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the object ids each rank would mint
    Ids(IdsArgs),
    /// Print or validate a runtime configuration
    Config(ConfigArgs),
    /// Run a multi-rank workload against the in-memory service
    Simulate(SimulateArgs),
}

#[derive(Args)]
pub struct IdsArgs {
    #[arg(long, default_value = "2")]
    pub ranks: u32,
    #[arg(short = 'n', long, default_value = "4")]
    pub count: u64,
    #[arg(long, default_value = "kv")]
    pub class: String,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Configuration file to load; defaults are printed without one
    pub path: Option<PathBuf>,
    /// Only check the file, printing nothing on success
    #[arg(long)]
    pub check: bool,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long, default_value = "2")]
    pub ranks: u32,
    /// Groups each rank creates inside the transaction
    #[arg(long, default_value = "3")]
    pub objects: usize,
    /// Writes issued against each group
    #[arg(long, default_value = "4")]
    pub writes: usize,
    /// Shuffle seed for the service's execution order; random if omitted
    #[arg(long)]
    pub seed: Option<u64>,
    /// Base configuration for every rank
    #[arg(long)]
    pub config: Option<PathBuf>,
}
