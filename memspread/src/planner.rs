// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use log::debug;
use serde::Serialize;

use crate::topology::NumaTopology;
use crate::{Error, NodeId, Result};

/// Guest sizing derived from the host topology. All sizes are in kB.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SizingPlan {
    /// Node the guest memory is bound to.
    pub nodeset: NodeId,
    /// First other node with memory, where the overflow should land.
    pub neighbour: NodeId,
    /// Main node plus half of the neighbour: guest maximum memory.
    pub oversize: u64,
    /// A quarter of the main node: guest memory at boot.
    pub undersize: u64,
    /// Main node plus a tenth of the neighbour: what the load allocates.
    pub memory_to_eat: u64,
    /// Nodeset used when moving the live guest onto both nodes.
    pub nodeset_string: String,
}

/// Size a guest for `topology`, binding it to `explicit_nodeset` or, when
/// not given, to the first online node.
///
/// Fractions are applied with integer division, i.e. truncated toward
/// zero, never rounded.
pub fn plan(topology: &NumaTopology, explicit_nodeset: Option<NodeId>) -> Result<SizingPlan> {
    let nodeset = explicit_nodeset.unwrap_or_else(|| topology.first_node());
    let nodeset_size = topology.mem_total(nodeset).ok_or(Error::UnknownNode(nodeset))?;

    let neighbour = topology
        .nodes()
        .find(|n| *n != nodeset)
        .ok_or(Error::NoNeighbourAvailable { nodeset })?;
    // Both nodes come from the same snapshot
    let neighbour_size = topology.mem_total(neighbour).unwrap_or_default();

    debug!("Main node {nodeset} has {nodeset_size} kB, neighbour node {neighbour} has {neighbour_size} kB");

    Ok(SizingPlan {
        nodeset,
        neighbour,
        oversize: nodeset_size + neighbour_size / 2,
        undersize: nodeset_size / 4,
        memory_to_eat: nodeset_size + neighbour_size / 10,
        nodeset_string: format!("{nodeset},{neighbour}"),
    })
}
