// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host side adapters built on the numactl, procps and libcgroup tools.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use test_infra::{exec_host_command_output, process_alive};

use crate::sampler::HostProcessAccounting;
use crate::verifier::ResourceGroupAccounting;
use crate::{Error, NodeId, Result};

pub const OS_RELEASE: &str = "/etc/os-release";

/// Run a host command, turning a non-zero exit into `Error::HostCommand`.
pub(crate) fn run_checked(command: &str) -> Result<String> {
    let output = exec_host_command_output(command)?;
    if !output.success() {
        return Err(Error::HostCommand {
            command: command.to_owned(),
            status: output.status.code(),
            stderr: output.stderr.trim().to_owned(),
        });
    }
    Ok(output.stdout)
}

/// Quote `s` for `bash -c`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Host-wide swap switch.
pub trait HostSwap {
    fn disable_swap(&self) -> Result<()>;
    fn enable_swap(&self) -> Result<()>;
}

/// The local host, queried through its command line tools.
#[derive(Default)]
pub struct Host;

impl HostProcessAccounting for Host {
    fn find_pids(&self, name: &str) -> Result<Vec<u32>> {
        let command = format!("pidof {}", shell_quote(name));
        let output = exec_host_command_output(&command)?;
        // pidof exits with 1 when nothing matches
        match output.status.code() {
            Some(0) | Some(1) => {}
            status => {
                return Err(Error::HostCommand {
                    command,
                    status,
                    stderr: output.stderr.trim().to_owned(),
                })
            }
        }

        output
            .stdout
            .split_whitespace()
            .map(|pid| {
                pid.parse().map_err(|_| Error::Parse {
                    what: "pidof output",
                    content: output.stdout.clone(),
                })
            })
            .collect()
    }

    fn node_usage(&self, pid: u32) -> Result<BTreeMap<NodeId, u64>> {
        let output = run_checked(&format!("numastat -p {pid}"))?;
        parse_numastat_total(&output)
    }

    fn process_alive(&self, pid: u32) -> Result<bool> {
        Ok(process_alive(pid))
    }
}

impl HostSwap for Host {
    fn disable_swap(&self) -> Result<()> {
        run_checked("swapoff -a").map(|_| ())
    }

    fn enable_swap(&self) -> Result<()> {
        run_checked("swapon -a").map(|_| ())
    }
}

/// Parse the `Total` row of `numastat -p`, in MB per node. Values are
/// truncated to whole MB.
///
/// ```text
///                            Node 0          Node 1           Total
///                   --------------- --------------- ---------------
/// Private                   2077.14          402.18         2479.32
/// ----------------  --------------- --------------- ---------------
/// Total                     2084.19          402.18         2486.37
/// ```
pub fn parse_numastat_total(output: &str) -> Result<BTreeMap<NodeId, u64>> {
    let parse_error = || Error::Parse {
        what: "numastat output",
        content: output.to_owned(),
    };

    let header = output
        .lines()
        .find(|l| l.trim_start().starts_with("Node "))
        .ok_or_else(parse_error)?;
    let mut nodes = Vec::new();
    let mut tokens = header.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "Node" {
            let id = tokens
                .next()
                .and_then(|n| n.parse::<NodeId>().ok())
                .ok_or_else(parse_error)?;
            nodes.push(id);
        }
    }

    let total = output
        .lines()
        .find(|l| l.split_whitespace().next() == Some("Total"))
        .ok_or_else(parse_error)?;
    let values = total
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<f64>().map_err(|_| parse_error()))
        .collect::<Result<Vec<f64>>>()?;
    if values.len() < nodes.len() {
        return Err(parse_error());
    }

    Ok(nodes
        .into_iter()
        .zip(values)
        .map(|(node, mb)| (node, mb as u64))
        .collect())
}

/// Accounting of the cpuset group libvirt puts the guests in.
#[derive(Default)]
pub struct CgroupAccounting;

impl ResourceGroupAccounting for CgroupAccounting {
    fn group_path(&self) -> Result<String> {
        let tree = run_checked("systemd-cgls cpuset")?;
        let scope = machine_scope(&tree).ok_or(Error::Parse {
            what: "systemd-cgls output",
            content: tree.clone(),
        })?;
        Ok(format!("/machine.slice/{scope}/libvirt"))
    }

    fn dump(&self, group: &str) -> Result<String> {
        run_checked(&format!("cgget -g cpuset {}", shell_quote(group)))
    }
}

/// First entry listed under `machine.slice` in a `systemd-cgls` tree,
/// without its tree drawing prefix.
pub fn machine_scope(tree: &str) -> Option<String> {
    let is_glyph = |c: char| matches!(c, '├' | '└' | '─' | '│' | '`' | '|' | '-');
    tree.split_whitespace()
        .skip_while(|t| !t.contains("machine.slice"))
        .skip(1)
        .map(|t| t.trim_start_matches(is_glyph))
        .find(|t| !t.is_empty())
        .map(str::to_owned)
}

/// Whether the cpuset accounting check is meaningful on this host: only
/// RHEL releases before 9 expose the expected group layout.
pub fn accounting_check_applies(os_release: &str) -> bool {
    let field = |key: &str| {
        os_release.lines().find_map(|l| {
            l.strip_prefix(key)
                .and_then(|v| v.strip_prefix('='))
                .map(|v| v.trim().trim_matches('"').to_owned())
        })
    };

    let is_rhel = field("ID").as_deref() == Some("rhel");
    let major = field("VERSION_ID")
        .and_then(|v| v.split('.').next().and_then(|m| m.parse::<u32>().ok()));
    debug!("Host distribution rhel={is_rhel} major={major:?}");

    is_rhel && major.is_some_and(|m| m < 9)
}

pub fn read_os_release<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|e| Error::HostRead(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUMASTAT: &str = "
Per-node process memory usage (in MBs) for PID 4242 (qemu-kvm)
                           Node 0          Node 1           Total
                  --------------- --------------- ---------------
Huge                         0.00            0.00            0.00
Heap                         7.02            0.00            7.02
Stack                        0.03            0.00            0.03
Private                   2077.14          402.98         2480.12
----------------  --------------- --------------- ---------------
Total                     2084.19          402.98         2487.17
";

    #[test]
    fn test_parse_numastat_total() {
        let usage = parse_numastat_total(NUMASTAT).unwrap();
        assert_eq!(usage, BTreeMap::from([(0, 2084), (1, 402)]));

        let sparse = "
                           Node 0          Node 2           Total
Total                       10.00           20.99           30.99
";
        assert_eq!(
            parse_numastat_total(sparse).unwrap(),
            BTreeMap::from([(0, 10), (2, 20)])
        );
    }

    #[test]
    fn test_parse_numastat_garbage() {
        assert!(parse_numastat_total("Can't read /proc/4242/numa_maps").is_err());
        assert!(parse_numastat_total(
            "      Node 0   Node 1   Total\nTotal    10.00\n"
        )
        .is_err());
        assert!(parse_numastat_total(
            "      Node 0   Node 1   Total\nTotal    10.00  abc  12.0\n"
        )
        .is_err());
    }

    #[test]
    fn test_machine_scope() {
        let tree = "Controller cpuset; Control group /:
├─1 /usr/lib/systemd/systemd --switched-root --system
├─machine.slice
│ └─machine-qemu\\x2d1\\x2dvm1.scope
│   └─libvirt
│     └─12345 /usr/libexec/qemu-kvm -name guest=vm1
└─user.slice
";
        assert_eq!(
            machine_scope(tree).as_deref(),
            Some("machine-qemu\\x2d1\\x2dvm1.scope")
        );
        assert_eq!(machine_scope("├─user.slice\n"), None);
    }

    #[test]
    fn test_accounting_check_applies() {
        assert!(accounting_check_applies(
            "NAME=\"Red Hat Enterprise Linux\"\nID=\"rhel\"\nVERSION_ID=\"8.6\"\n"
        ));
        assert!(!accounting_check_applies(
            "ID=\"rhel\"\nID_LIKE=\"fedora\"\nVERSION_ID=\"9.2\"\n"
        ));
        assert!(!accounting_check_applies("ID=fedora\nVERSION_ID=38\n"));
        assert!(!accounting_check_applies("ID=\"rhel\"\n"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a\\x2db"), "'a\\x2db'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_swap_command_failure_is_reported() {
        match run_checked("echo 'swapoff: /dev/dm-1: Device busy' >&2; exit 4") {
            Err(Error::HostCommand { status, stderr, .. }) => {
                assert_eq!(status, Some(4));
                assert_eq!(stderr, "swapoff: /dev/dm-1: Device busy");
            }
            r => panic!("unexpected result: {r:?}"),
        }
    }
}
