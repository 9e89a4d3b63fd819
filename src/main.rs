// Entry point for the relay-harness CLI
use clap::Parser;
use log::{error, info, LevelFilter};
use relay_harness::{
    current_timestamp, start_network, BlockBuilder, BlockInfo, BlockRelayScenario, Command,
    HarnessConfig, Opt,
};
use std::process;

fn main() {
    // Info level shows every scenario stage without the per-frame noise
    env_logger::builder().filter_level(LevelFilter::Info).init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = HarnessConfig::load()?;

    match command {
        Command::Run { nodes, blocks } => {
            if let Some(blocks) = blocks {
                config.manual_blocks = blocks;
            }
            let (mut network, _nodes) = start_network(nodes, &config)?;
            let report = BlockRelayScenario::new(&mut network).run()?;
            info!(
                "Block relay verified: {} blocks on {} nodes",
                report.blocks.len(),
                report.heights.len()
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Genesis => {
            let genesis = BlockBuilder::genesis(config.difficulty)?;
            println!("{}", serde_json::to_string_pretty(&BlockInfo::from_block(&genesis))?);
        }
        Command::BuildBlock {
            parent,
            height,
            time,
        } => {
            let parent = match parent {
                Some(hash) => hash,
                None => BlockBuilder::genesis(config.difficulty)?.hash(),
            };
            let time = match time {
                Some(time) => time,
                None => current_timestamp()?,
            };
            let block = BlockBuilder::new(config.difficulty).build(parent, height, time)?;
            println!("{}", serde_json::to_string_pretty(&BlockInfo::from_block(&block))?);
        }
    }
    Ok(())
}
