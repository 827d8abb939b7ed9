// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use clap::Parser;

use cli::{Cli, Commands};
use galvan_config::{init_logging, BridgeConfig, CommonConfig, DoctorConfig, FrankConfig, IgorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let common = CommonConfig::from_env();
    init_logging(&common.log_level, common.log_format);

    match cli.command {
        Commands::Bridge => galvan_bridge::run(BridgeConfig::from_env()).await,
        Commands::Doctor => galvan_doctor::run(DoctorConfig::from_env()).await,
        Commands::Igor { route } => galvan_igor::run(IgorConfig::from_env(route)).await,
        Commands::Frank => galvan_frank::run(FrankConfig::from_env()).await,
    }
}
