// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Verification that guest memory pressure spreads across host NUMA nodes.
//!
//! A run measures the host topology, sizes a guest so that it cannot fit in
//! its main node, makes the guest eat that memory while watching that it
//! stays alive, and checks that the neighbour node absorbed the overflow.

use std::path::PathBuf;
use std::time::Duration;

pub mod config;
pub mod host;
pub mod libvirt;
pub mod load;
pub mod orchestrator;
pub mod planner;
pub mod sampler;
pub mod topology;
pub mod verifier;
pub mod watchdog;

pub use config::SpreadConfig;
pub use orchestrator::{Collaborators, Orchestrator, Outcome, RunError, RunReport, State};

/// Host NUMA node number, as found in `/sys/devices/system/node/nodeN`.
pub type NodeId = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("At least two online NUMA nodes with memory are needed, found {found:?}")]
    InsufficientTopology { found: Vec<NodeId> },
    #[error("Node {0} is not an online NUMA node with memory")]
    UnknownNode(NodeId),
    #[error("No online NUMA node other than node {nodeset} has memory")]
    NoNeighbourAvailable { nodeset: NodeId },
    #[error("More than one process is named '{name}': {pids:?}")]
    AmbiguousProcess { name: String, pids: Vec<u32> },
    #[error("No process is named '{0}'")]
    ProcessNotFound(String),
    #[error("Node {node} is missing from the memory usage of process {pid}")]
    NodeNotSampled { node: NodeId, pid: u32 },
    #[error(
        "Guest free memory did not exceed {expected_kb} kB within {timeout:?} \
         (last seen: {last_seen_kb:?} kB)"
    )]
    MemoryNotAvailable {
        expected_kb: u64,
        last_seen_kb: Option<u64>,
        timeout: Duration,
    },
    #[error("The target ({target}) died while the memory load was running")]
    TargetCrashed { target: String },
    #[error("The memory load failed: {0}")]
    WorkloadFailed(String),
    #[error(
        "Memory taken on neighbour node {neighbour} grew by {actual_delta_mb} MB, \
         at least {limit_mb} MB was expected; the memory was probably not spread"
    )]
    Violation {
        neighbour: NodeId,
        actual_delta_mb: i64,
        limit_mb: u64,
    },
    #[error("'{expected}' not found in the accounting of resource group {group}")]
    AccountingMismatch { expected: String, group: String },
    #[error("Configuration change mismatch: expected {expected}, got {actual}")]
    ConfigRejected { expected: String, actual: String },
    #[error("Guest preparation failed: {0}")]
    GuestPreparation(String),
    #[error("Guest login did not succeed within {0:?}")]
    LoginTimeout(Duration),
    #[error("Interrupted by a signal")]
    Interrupted,
    #[error("Failed to access {0}")]
    HostRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse {what}: {content:?}")]
    Parse { what: &'static str, content: String },
    #[error("Host command '{command}' failed ({status:?}): {stderr}")]
    HostCommand {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Failed to spawn the {0} thread")]
    ThreadSpawn(&'static str, #[source] std::io::Error),
    #[error("Host command execution failed")]
    Infra(#[from] test_infra::Error),
    #[error("Guest command failed")]
    Guest(#[from] test_infra::SshCommandError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `error: cause: cause...` on a single line.
pub fn error_chain(e: &dyn std::error::Error) -> String {
    let mut s = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        s.push_str(": ");
        s.push_str(&cause.to_string());
        source = cause.source();
    }
    s
}
