//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

pub mod coordinator;
pub mod ctl;
pub mod worker;

use std::path::PathBuf;

use clap::ArgMatches;

/// The global `--config` override, if given.
pub(crate) fn config_override(matches: &ArgMatches) -> Option<PathBuf> {
    matches.get_one::<String>("config").map(PathBuf::from)
}
