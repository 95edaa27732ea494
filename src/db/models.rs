//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use chrono::DateTime;
use chrono::Utc;
use diesel::prelude::*;

use crate::db::schema::artifact_history;

#[derive(Debug, Insertable)]
#[diesel(table_name = artifact_history)]
pub struct NewArtifactRecord<'a> {
    pub project_name: &'a str,
    pub build_date: DateTime<Utc>,
    pub artifact_type: &'a str,
    pub artifact_name: &'a str,
    pub artifact_version: &'a str,
    pub result_hash: &'a [u8],
}
