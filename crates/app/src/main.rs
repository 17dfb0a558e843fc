mod cli;
mod detect;
mod html;

use clap::Parser;

use crate::cli::{AppConfig, Cli};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::try_from(cli.detect)?;
    detect::run(config)
}
