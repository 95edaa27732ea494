//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Result;
use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

mod build;
mod cli;
mod commands;
mod config;
mod coordinator;
mod db;
mod endpoint;
mod filestore;
mod intake;
mod job;
mod orchestrator;
mod proto;
mod util;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    human_panic::setup_panic!();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("XBFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli::cli().get_matches();
    match matches.subcommand() {
        Some(("coordinator", matches)) => commands::coordinator::run(matches).await,
        Some(("worker", matches)) => commands::worker::run(matches).await,
        Some(("ctl", matches)) => commands::ctl::run(matches).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}
