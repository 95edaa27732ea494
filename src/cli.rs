//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use clap::Arg;
use clap::ArgAction;
use clap::Command;
use clap::crate_version;

pub fn cli() -> Command {
    Command::new("xbforge")
        .version(crate_version!())
        .about("Distributed build coordinator for OS bootstrap pipelines")
        .subcommand_required(true)
        .arg_required_else_help(true)

        .arg(Arg::new("config")
            .required(false)
            .short('c')
            .long("config")
            .value_name("PATH")
            .global(true)
            .help("Path to the configuration file (default: $XBFORGE_CFG_DIR/{coordinator,worker}.toml)")
        )

        .subcommand(Command::new("coordinator")
            .about("Run the build coordinator")
        )

        .subcommand(Command::new("worker")
            .about("Run a build worker")
        )

        .subcommand(Command::new("ctl")
            .about("Control a running coordinator")
            .subcommand_required(true)

            .arg(Arg::new("endpoint")
                .required(false)
                .short('e')
                .long("endpoint")
                .value_name("URL")
                .global(true)
                .help("Command endpoint of the coordinator (default: from the coordinator configuration)")
            )

            .subcommand(Command::new("build")
                .about("Schedule a build of a project")
                .arg(Arg::new("project")
                    .required(true)
                    .index(1)
                    .help("Name of the project to build")
                )
                .arg(Arg::new("delay")
                    .required(false)
                    .long("delay")
                    .value_name("DURATION")
                    .default_value("0s")
                    .help("Wait this long before fetching sources (e.g. \"90s\", \"5m\")")
                )
                .arg(Arg::new("incremental")
                    .required(false)
                    .long("incremental")
                    .value_name("BOOL")
                    .value_parser(clap::value_parser!(bool))
                    .help("Override the project's incremental setting")
                )
            )

            .subcommand(Command::new("fail")
                .about("Fail all jobs of the running build that were not started yet")
                .arg(Arg::new("project")
                    .required(true)
                    .index(1)
                    .help("Name of the project whose build to fail")
                )
            )

            .subcommand(Command::new("status")
                .about("Show coordinator and project status")
                .arg(Arg::new("json")
                    .required(false)
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print the raw status object as JSON")
                )
            )
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_ctl_build_args() {
        let matches = cli()
            .try_get_matches_from(["xbforge", "ctl", "build", "managarm", "--delay", "90s"])
            .unwrap();
        let ("ctl", ctl) = matches.subcommand().unwrap() else {
            panic!("expected ctl");
        };
        let ("build", build) = ctl.subcommand().unwrap() else {
            panic!("expected build");
        };
        assert_eq!(
            build.get_one::<String>("project").map(String::as_str),
            Some("managarm")
        );
        assert_eq!(
            build.get_one::<String>("delay").map(String::as_str),
            Some("90s")
        );
    }
}
