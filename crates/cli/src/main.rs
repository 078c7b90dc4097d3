//! `charformer` executable.

use anyhow::Result;
use charformer_cli::cli::{run_cli, Cli};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
