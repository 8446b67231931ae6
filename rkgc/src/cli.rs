use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkgc", version, about = "RK8s garbage collector daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the garbage collector with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides the worker count from the config file
        #[arg(short, long)]
        workers: Option<usize>,
    },
}
