// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use param_parser::parse_integer_list;

use crate::{Error, NodeId, Result};

pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// Host view of NUMA nodes and their memory.
pub trait HostTopologyReader {
    /// Online nodes that have memory, in ascending order.
    fn online_nodes_with_memory(&self) -> Result<Vec<NodeId>>;
    /// `MemTotal` of a node, in kB.
    fn node_mem_total(&self, node: NodeId) -> Result<u64>;
}

/// Snapshot of the online, memory-bearing NUMA nodes of the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaTopology {
    mem_total_kb: BTreeMap<NodeId, u64>,
}

impl NumaTopology {
    pub fn new<I: IntoIterator<Item = (NodeId, u64)>>(nodes: I) -> Result<Self> {
        let mem_total_kb: BTreeMap<NodeId, u64> = nodes.into_iter().collect();
        if mem_total_kb.len() < 2 {
            return Err(Error::InsufficientTopology {
                found: mem_total_kb.keys().copied().collect(),
            });
        }

        Ok(NumaTopology { mem_total_kb })
    }

    /// Node ids in topology order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.mem_total_kb.keys().copied()
    }

    pub fn first_node(&self) -> NodeId {
        // Construction guarantees at least two nodes
        self.nodes().next().unwrap_or_default()
    }

    pub fn mem_total(&self, node: NodeId) -> Option<u64> {
        self.mem_total_kb.get(&node).copied()
    }
}

/// Take a topology snapshot. Fails with `InsufficientTopology` when fewer
/// than two online nodes have memory.
pub fn probe(reader: &dyn HostTopologyReader) -> Result<NumaTopology> {
    let online = reader.online_nodes_with_memory()?;
    if online.len() < 2 {
        return Err(Error::InsufficientTopology { found: online });
    }

    let mut nodes = Vec::with_capacity(online.len());
    for node in online {
        let total = reader.node_mem_total(node)?;
        debug!("Memory available on node {node} is {total} kB");
        nodes.push((node, total));
    }

    NumaTopology::new(nodes)
}

/// `HostTopologyReader` backed by the sysfs node directory.
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        SysfsTopology::new(SYSFS_NODE_ROOT)
    }
}

impl SysfsTopology {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        SysfsTopology {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn read(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).map_err(|e| Error::HostRead(path, e))
    }

    fn read_node_list(&self, relative: &str) -> Result<Vec<NodeId>> {
        let content = self.read(relative)?;
        parse_integer_list(&content)
            .map_err(|_| Error::Parse {
                what: "node list",
                content: content.clone(),
            })?
            .into_iter()
            .map(|n| {
                NodeId::try_from(n).map_err(|_| Error::Parse {
                    what: "node list",
                    content: content.clone(),
                })
            })
            .collect()
    }
}

impl HostTopologyReader for SysfsTopology {
    fn online_nodes_with_memory(&self) -> Result<Vec<NodeId>> {
        let online = self.read_node_list("online")?;
        let with_memory = self.read_node_list("has_memory")?;
        Ok(online
            .into_iter()
            .filter(|n| with_memory.contains(n))
            .collect())
    }

    fn node_mem_total(&self, node: NodeId) -> Result<u64> {
        let content = self.read(&format!("node{node}/meminfo"))?;
        parse_meminfo_field(&content, "MemTotal").ok_or(Error::Parse {
            what: "node meminfo",
            content,
        })
    }
}

/// Extract a field, in kB, from a `/proc/meminfo` or per-node `meminfo`
/// file. Per-node lines carry a `Node N` prefix:
/// `Node 0 MemTotal:       16310020 kB`.
pub fn parse_meminfo_field(content: &str, field: &str) -> Option<u64> {
    let key = format!("{field}:");
    content.lines().find_map(|line| {
        let mut tokens = line.split_whitespace().skip_while(|t| *t != key);
        tokens.next()?;
        tokens.next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn sysfs(online: &str, has_memory: &str, nodes: &[(NodeId, u64)]) -> TempDir {
        let tmp_dir = TempDir::new_with_prefix("/tmp/memspread").unwrap();
        let root = tmp_dir.as_path();
        fs::write(root.join("online"), online).unwrap();
        fs::write(root.join("has_memory"), has_memory).unwrap();
        for (node, total) in nodes {
            let dir = root.join(format!("node{node}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("meminfo"),
                format!(
                    "Node {node} MemTotal:       {total} kB\n\
                     Node {node} MemFree:        1024 kB\n\
                     Node {node} MemUsed:        2048 kB\n"
                ),
            )
            .unwrap();
        }
        tmp_dir
    }

    #[test]
    fn test_parse_meminfo_field() {
        let node = "Node 1 MemTotal:       4000000 kB\nNode 1 MemFree:    10 kB\n";
        assert_eq!(parse_meminfo_field(node, "MemTotal"), Some(4_000_000));
        assert_eq!(parse_meminfo_field(node, "MemFree"), Some(10));
        assert_eq!(parse_meminfo_field(node, "MemUsed"), None);

        let proc = "MemTotal:        8039208 kB\nMemFree:         6712304 kB\n";
        assert_eq!(parse_meminfo_field(proc, "MemFree"), Some(6_712_304));
    }

    #[test]
    fn test_probe_sysfs() {
        let tmp_dir = sysfs(
            "0-2\n",
            "0,2\n",
            &[(0, 8_000_000), (1, 0), (2, 4_000_000)],
        );
        let reader = SysfsTopology::new(tmp_dir.as_path());

        let topology = probe(&reader).unwrap();
        assert_eq!(topology.nodes().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(topology.first_node(), 0);
        assert_eq!(topology.mem_total(0), Some(8_000_000));
        assert_eq!(topology.mem_total(2), Some(4_000_000));
        assert_eq!(topology.mem_total(1), None);

        // Nothing changed on the host, nothing changes in the snapshot
        assert_eq!(probe(&reader).unwrap(), topology);
    }

    #[test]
    fn test_probe_single_node() {
        let tmp_dir = sysfs("0-1\n", "0\n", &[(0, 8_000_000)]);
        let reader = SysfsTopology::new(tmp_dir.as_path());

        match probe(&reader) {
            Err(Error::InsufficientTopology { found }) => assert_eq!(found, vec![0]),
            r => panic!("unexpected probe result: {r:?}"),
        }
    }

    #[test]
    fn test_probe_broken_meminfo() {
        let tmp_dir = sysfs("0-1\n", "0-1\n", &[(0, 8_000_000)]);
        fs::create_dir_all(tmp_dir.as_path().join("node1")).unwrap();
        fs::write(tmp_dir.as_path().join("node1/meminfo"), "garbage\n").unwrap();
        let reader = SysfsTopology::new(tmp_dir.as_path());

        assert!(matches!(
            probe(&reader),
            Err(Error::Parse {
                what: "node meminfo",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_sysfs() {
        let reader = SysfsTopology::new("/nonexistent/memspread/node");
        assert!(matches!(probe(&reader), Err(Error::HostRead(..))));
    }
}
