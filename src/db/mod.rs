//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use chrono::DateTime;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tracing::debug;
use tracing::trace;

use crate::job::ArtifactKind;

pub mod models;
pub mod schema;

/// Best-effort archive of every tool and package a deployment ever built,
/// keyed by (project, build timestamp, kind, name, version).
///
/// Failures here must never abort an artifact deposit; callers log and
/// move on.
pub struct ArtifactHistory {
    connection: Mutex<PgConnection>,
}

impl std::fmt::Debug for ArtifactHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArtifactHistory(postgres)")
    }
}

impl ArtifactHistory {
    pub fn connect(database_url: &str) -> Result<Self> {
        debug!("connecting to artifact history database");
        let connection = PgConnection::establish(database_url)
            .context("Establishing artifact history connection")?;
        Ok(ArtifactHistory {
            connection: Mutex::new(connection),
        })
    }

    pub fn record(
        &self,
        project: &str,
        build_date: DateTime<Utc>,
        kind: ArtifactKind,
        name: &str,
        version: &str,
        result_hash: &[u8],
    ) -> Result<()> {
        // files carry no version and are not worth archiving
        if kind == ArtifactKind::File {
            return Ok(());
        }

        let record = models::NewArtifactRecord {
            project_name: project,
            build_date,
            artifact_type: kind.as_str(),
            artifact_name: name,
            artifact_version: version,
            result_hash,
        };
        trace!("recording artifact {} {} into history", kind, name);

        let mut connection = self
            .connection
            .lock()
            .map_err(|_| anyhow!("Lock poisoned"))?;
        connection.transaction(|connection| {
            diesel::insert_into(schema::artifact_history::table)
                .values(&record)
                .execute(connection)
        })
        .context("Inserting artifact history record")?;
        Ok(())
    }
}
