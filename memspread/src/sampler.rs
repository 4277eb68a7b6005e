// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::time::SystemTime;

use log::debug;
use serde::Serialize;

use crate::{Error, NodeId, Result};

/// Host accounting of a process' memory and existence.
pub trait HostProcessAccounting {
    /// Pids of all processes named `name`.
    fn find_pids(&self, name: &str) -> Result<Vec<u32>>;
    /// Total memory, in MB, attributed to `pid` on each NUMA node.
    fn node_usage(&self, pid: u32) -> Result<BTreeMap<NodeId, u64>>;
    fn process_alive(&self, pid: u32) -> Result<bool>;
}

/// Per-node memory used by the target process at one point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub pid: u32,
    pub per_node_mb: BTreeMap<NodeId, u64>,
    pub taken_at: SystemTime,
}

impl MemorySample {
    pub fn node(&self, node: NodeId) -> Result<u64> {
        self.per_node_mb
            .get(&node)
            .copied()
            .ok_or(Error::NodeNotSampled {
                node,
                pid: self.pid,
            })
    }
}

pub struct NodeUsageSampler<'a> {
    accounting: &'a dyn HostProcessAccounting,
}

impl<'a> NodeUsageSampler<'a> {
    pub fn new(accounting: &'a dyn HostProcessAccounting) -> Self {
        NodeUsageSampler { accounting }
    }

    /// Resolve the single process named `name`.
    pub fn resolve(&self, name: &str) -> Result<u32> {
        let pids = self.accounting.find_pids(name)?;
        match pids.as_slice() {
            [] => Err(Error::ProcessNotFound(name.to_owned())),
            [pid] => Ok(*pid),
            _ => Err(Error::AmbiguousProcess {
                name: name.to_owned(),
                pids,
            }),
        }
    }

    /// Point-in-time read of the per-node memory of the process named
    /// `name`. There is no retry, the caller picks the moment.
    pub fn sample(&self, name: &str) -> Result<MemorySample> {
        let pid = self.resolve(name)?;
        let per_node_mb = self.accounting.node_usage(pid)?;
        for (node, mb) in per_node_mb.iter() {
            debug!("Process {pid} ({name}) takes {mb} MB on node {node}");
        }

        Ok(MemorySample {
            pid,
            per_node_mb,
            taken_at: SystemTime::now(),
        })
    }
}
