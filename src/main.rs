// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use memspread::config::ConfigError;
use memspread::host::{read_os_release, CgroupAccounting, Host, OS_RELEASE};
use memspread::libvirt::{TargetLifecycle, Virsh};
use memspread::topology::SysfsTopology;
use memspread::verifier::ResourceGroupAccounting;
use memspread::{Collaborators, Orchestrator, Outcome, RunReport, SpreadConfig};
use numa_spread::cli_print_error_chain;
use param_parser::ParamError;
use signal_hook::consts::{SIGINT, SIGTERM};
use thiserror::Error;

#[derive(Error, Debug)]
enum Error {
    #[error("Failed to read parameter file {0}")]
    ParamsFile(PathBuf, #[source] io::Error),
    #[error("Failed to parse parameter file {0}")]
    ParamsFileSyntax(PathBuf, #[source] ParamError),
    #[error("Failed to parse --params")]
    ParamsSyntax(#[source] ParamError),
    #[error("Invalid run configuration")]
    Config(#[source] ConfigError),
    #[error("Failed to install the signal handlers")]
    Signals(#[source] io::Error),
    #[error("Failed to write the run report")]
    Report(#[source] anyhow::Error),
}

fn create_app() -> Command {
    Command::new("numa-spread")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(
            "Check that the memory of a libvirt guest bound to one NUMA node \
             spreads to its neighbour once the node is exhausted.",
        )
        .arg(
            Arg::new("params")
                .long("params")
                .help(
                    "Run parameters \"main_vm=<domain>,limit_mb=<MB>,\
                     guest_password=<password>,memory_mode=strict|preferred,\
                     memory_nodeset=<node>,status_error=on|off,error_message=<text>,\
                     cgget_message=<text>,cgroup_check=auto|on|off,...\"",
                )
                .num_args(1),
        )
        .arg(
            Arg::new("params-file")
                .long("params-file")
                .help("File with one \"key = value\" run parameter per line")
                .num_args(1),
        )
        .arg(
            Arg::new("report-file")
                .long("report-file")
                .help("Write the JSON run report to this file instead of stdout")
                .num_args(1),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of debugging output"),
        )
}

fn load_config(matches: &ArgMatches) -> Result<SpreadConfig, Error> {
    let mut parser = SpreadConfig::parser();

    if let Some(path) = matches.get_one::<String>("params-file") {
        let path = PathBuf::from(path);
        let content =
            fs::read_to_string(&path).map_err(|e| Error::ParamsFile(path.clone(), e))?;
        // A parameter file may be shared by several test cases
        parser.ignore_unknown(true);
        parser
            .parse_file(&content)
            .map_err(|e| Error::ParamsFileSyntax(path, e))?;
        parser.ignore_unknown(false);
    }
    if let Some(params) = matches.get_one::<String>("params") {
        parser.parse(params).map_err(Error::ParamsSyntax)?;
    }

    SpreadConfig::from_parser(&parser).map_err(Error::Config)
}

fn write_report(report: &RunReport, path: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize the report")?;
    match path {
        Some(path) => fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write {}", path.display())),
        None => writeln!(io::stdout().lock(), "{json}").context("Failed to write to stdout"),
    }
}

fn start(matches: &ArgMatches) -> Result<bool, Error> {
    let config = load_config(matches)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupted)).map_err(Error::Signals)?;
    }

    let os_release = read_os_release(OS_RELEASE).unwrap_or_else(|e| {
        warn!("Host distribution unknown: {e}");
        String::new()
    });

    let host = Host;
    let topology = SysfsTopology::default();
    let cgroups = CgroupAccounting;
    let virsh = Virsh::new(&config.main_vm, config.guest_access());
    let resource_groups = config
        .accounting_key(&os_release)
        .map(|_| &cgroups as &dyn ResourceGroupAccounting);

    let result = Orchestrator::new(
        &config,
        Collaborators {
            topology: &topology,
            accounting: &host,
            swap: &host,
            config: &virsh,
            lifecycle: &virsh,
            resource_groups,
        },
    )
    .interrupted_by(interrupted)
    .run();

    if config.kill_vm && virsh.is_active().unwrap_or(false) {
        info!("Destroying {}", config.main_vm);
        if let Err(e) = virsh.stop() {
            warn!("Failed to destroy {}: {e}", config.main_vm);
        }
    }

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            cli_print_error_chain(&e, "numa-spread");
            *e.report
        }
    };

    let report_file = matches.get_one::<String>("report-file").map(Path::new);
    write_report(&report, report_file).map_err(Error::Report)?;

    Ok(report.outcome != Outcome::Failed)
}

fn main() {
    let matches = create_app().get_matches();

    let default_level = match matches.get_count("v") {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let exit_code = match start(&matches) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(top_error) => {
            cli_print_error_chain(&top_error, "numa-spread");
            1
        }
    };

    process::exit(exit_code);
}
