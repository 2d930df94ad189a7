use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(name = "quilld", about = "quill consensus node")]
struct Args {
    /// Path to the node configuration file.
    #[arg(long, default_value = "quill.toml")]
    config: PathBuf,
    /// Override the configured network ("mainnet" or "testnet").
    #[arg(long)]
    network: Option<String>,
    /// Override the configured data directory.
    #[arg(long)]
    datadir: Option<PathBuf>,
    /// Override the bootstrap verification level (1..=7).
    #[arg(long)]
    checklevel: Option<u32>,
    /// Override how many recent blocks to re-verify (0 = all).
    #[arg(long)]
    checkblocks: Option<i32>,
    /// Print an example configuration and exit.
    #[arg(long)]
    print_example_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_example_config {
        let example = quill_config::QuillConfig::example();
        println!("{}", toml::to_string_pretty(&example)?);
        return Ok(());
    }
    let overrides = quill_node::Overrides {
        network: args.network,
        datadir: args.datadir,
        check_level: args.checklevel,
        check_blocks: args.checkblocks,
    };
    quill_node::run_node(args.config, overrides)
}
