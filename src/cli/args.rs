use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "chatflow",
    version,
    about = "Declarative conversation flow engine for a WhatsApp-first CRM"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load and lint every flow definition in a directory
    Validate(ValidateArgs),
    /// Print a flow definition as a Graphviz DOT graph
    Graph(GraphArgs),
    /// Drive a local conversation against in-memory collaborators
    Simulate(SimulateArgs),
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Flow definitions directory (default: [flows].dir from chatflow.toml)
    #[arg(value_name = "DIR")]
    pub flows_dir: Option<PathBuf>,

    /// Path to a config file (default: {cwd}/chatflow.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Treat lint warnings as errors
    #[arg(long)]
    pub strict: bool,
}

#[derive(Args)]
pub struct GraphArgs {
    /// Flow definition file (.json/.yaml/.yml)
    #[arg(value_name = "FILE")]
    pub flow_file: PathBuf,

    /// Write DOT output to a file instead of stdout
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Flow definitions directory (default: [flows].dir from chatflow.toml)
    #[arg(value_name = "DIR")]
    pub flows_dir: Option<PathBuf>,

    /// Contact id to simulate as
    #[arg(long, default_value = "local-contact")]
    pub contact: String,

    /// Path to a config file (default: {cwd}/chatflow.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
