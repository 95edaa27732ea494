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
use clap::ArgMatches;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::coordinator::command_loop;
use crate::endpoint::worker_loop;
use crate::intake::intake_loop;
use crate::proto::net;

pub async fn run(matches: &ArgMatches) -> Result<()> {
    let cfg = crate::config::load_coordinator_config(
        crate::commands::config_override(matches).as_deref(),
    )?;
    let coordinator = Coordinator::create(&cfg)?;

    let intake_listener = net::bind(cfg.intake().bind()).await?;
    let worker_listener = net::bind(cfg.worker_endpoint()).await?;
    let command_listener = net::bind(cfg.command_endpoint().bind()).await?;

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let dumper = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                coordinator.dump_state().await;
            }
        })
    };

    info!("startup");
    let intake = tokio::spawn(intake_loop(coordinator.clone(), intake_listener));
    let router = tokio::spawn(worker_loop(coordinator.clone(), worker_listener));

    let result = tokio::select! {
        served = command_loop(coordinator.clone(), command_listener) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    };

    // running builds are killed; outstanding artifacts are not drained
    coordinator.shutdown().await;
    intake.abort();
    router.abort();
    dumper.abort();
    result
}
