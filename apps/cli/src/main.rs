//! Tramit CLI: research administrative procedures from the terminal.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = commands::Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
