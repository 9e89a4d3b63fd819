use crate::core::BlockHash;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "relay-harness", about = "Block relay test harness")]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(
        name = "run",
        about = "Start regtest nodes and run the block relay scenario"
    )]
    Run {
        #[arg(long, default_value_t = 3, help = "Number of regtest nodes to start")]
        nodes: usize,
        #[arg(long, help = "Blocks to build by hand (overrides the config)")]
        blocks: Option<u64>,
    },
    #[command(
        name = "genesis",
        about = "Print the genesis block for the configured difficulty"
    )]
    Genesis,
    #[command(
        name = "build-block",
        about = "Build and solve one block on top of a parent"
    )]
    BuildBlock {
        #[arg(long, help = "Parent block hash (hex); defaults to genesis")]
        parent: Option<BlockHash>,
        #[arg(long, help = "Height of the new block")]
        height: u64,
        #[arg(long, help = "Block time in seconds; defaults to now")]
        time: Option<i64>,
    },
}
