//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use clap::ArgMatches;
use tokio_util::codec::Framed;

use crate::proto::Message;
use crate::proto::MultipartCodec;
use crate::proto::messages::BuildMessage;
use crate::proto::messages::StatusMessage;
use crate::proto::messages::pack_str;
use crate::proto::messages::unpack_str;
use crate::proto::net;

pub async fn run(matches: &ArgMatches) -> Result<()> {
    let endpoint = resolve_endpoint(matches)?;
    match matches.subcommand() {
        Some(("build", matches)) => build(&endpoint, matches).await,
        Some(("fail", matches)) => fail(&endpoint, matches).await,
        Some(("status", matches)) => status(&endpoint, matches).await,
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {}", other)),
        None => Err(anyhow!("No subcommand")),
    }
}

fn resolve_endpoint(matches: &ArgMatches) -> Result<String> {
    if let Some(endpoint) = matches.get_one::<String>("endpoint") {
        return Ok(endpoint.clone());
    }
    let cfg = crate::config::load_coordinator_config(
        crate::commands::config_override(matches).as_deref(),
    )
    .context("No --endpoint given and the coordinator configuration is unreadable")?;
    Ok(cfg.command_endpoint().connect().to_string())
}

async fn build(endpoint: &str, matches: &ArgMatches) -> Result<()> {
    let project = matches
        .get_one::<String>("project")
        .ok_or_else(|| anyhow!("Missing project"))?;
    let delay = matches
        .get_one::<String>("delay")
        .map(|d| humantime::parse_duration(d))
        .transpose()
        .context("Parsing --delay")?
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let incremental = matches.get_one::<bool>("incremental").copied();

    let message = BuildMessage {
        project: project.clone(),
        delay,
        incremental,
    };
    let (code, value) = exchange(endpoint, "build", message.pack()?).await?;
    report(code, &value, || {
        println!("build of {} scheduled", project);
    })
}

async fn fail(endpoint: &str, matches: &ArgMatches) -> Result<()> {
    let project = matches
        .get_one::<String>("project")
        .ok_or_else(|| anyhow!("Missing project"))?;
    let (code, value) = exchange(endpoint, "fail", pack_str(project)).await?;
    report(code, &value, || {
        println!("failed all waiting jobs of {}", project);
    })
}

async fn status(endpoint: &str, matches: &ArgMatches) -> Result<()> {
    let (code, value) = exchange(endpoint, "status", pack_str("")).await?;
    if code != 200 {
        return report(code, &value, || {});
    }
    let status = StatusMessage::unpack(&value)?;

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "coordinator on {} (pid {}), load {:.2} {:.2} {:.2}",
        status.hostname, status.pid, status.load.0, status.load.1, status.load.2
    );
    for (name, project) in &status.projects {
        println!(
            "  {} [{}] {} ({}){}",
            name,
            if project.running { "running" } else { "idle" },
            project.git,
            project.description,
            if project.classes.is_empty() {
                String::new()
            } else {
                format!(" classes: {}", project.classes.join(", "))
            }
        );
    }
    Ok(())
}

/// One request/reply exchange on the command socket.
async fn exchange(endpoint: &str, command: &str, arg: Vec<u8>) -> Result<(u16, Vec<u8>)> {
    let stream = net::connect(endpoint).await?;
    let mut framed = Framed::new(stream, MultipartCodec);
    framed
        .send(vec![Bytes::from(command.to_string()), Bytes::from(arg)])
        .await?;
    let frames = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("Connection closed before a reply"))??;
    let [code, value] = &frames[..] else {
        return Err(anyhow!("Malformed reply with {} frames", frames.len()));
    };
    let code: u16 = std::str::from_utf8(code)?.parse().context("Parsing status code")?;
    Ok((code, value.to_vec()))
}

fn report(code: u16, value: &[u8], on_success: impl FnOnce()) -> Result<()> {
    match code {
        200 | 204 => {
            on_success();
            Ok(())
        }
        _ => {
            let reason = unpack_str(value).unwrap_or_else(|_| String::from("unknown error"));
            Err(anyhow!("Coordinator replied {}: {}", code, reason))
        }
    }
}
