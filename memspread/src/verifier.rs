// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use log::{debug, info};
use serde::Serialize;

use crate::sampler::MemorySample;
use crate::{Error, NodeId, Result};

/// Minimum growth, in MB, expected on the neighbour node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ThresholdPolicy {
    pub limit_mb: u64,
}

/// Host-side accounting of the resource group the target runs in.
pub trait ResourceGroupAccounting {
    /// Path of the group holding the target.
    fn group_path(&self) -> Result<String>;
    /// Textual dump of the group settings.
    fn dump(&self, group: &str) -> Result<String>;
}

pub struct DistributionVerifier {
    policy: ThresholdPolicy,
}

impl DistributionVerifier {
    pub fn new(policy: ThresholdPolicy) -> Self {
        DistributionVerifier { policy }
    }

    /// Check that `neighbour` grew by at least the policy limit between the
    /// two samples. Returns the growth in MB, which may be negative.
    pub fn verify(
        &self,
        before: &MemorySample,
        after: &MemorySample,
        neighbour: NodeId,
    ) -> Result<i64> {
        let was = before.node(neighbour)?;
        let is = after.node(neighbour)?;
        let delta = is as i64 - was as i64;
        debug!("Neighbour node {neighbour}: {was} MB before, {is} MB after");

        if i128::from(delta) < i128::from(self.policy.limit_mb) {
            return Err(Error::Violation {
                neighbour,
                actual_delta_mb: delta,
                limit_mb: self.policy.limit_mb,
            });
        }

        info!(
            "Memory on node {neighbour} grew by {delta} MB (limit {} MB)",
            self.policy.limit_mb
        );
        Ok(delta)
    }
}

/// Check that the dump of the target resource group mentions `expected`.
/// Returns the group that was checked.
pub fn verify_accounting(
    accounting: &dyn ResourceGroupAccounting,
    expected: &str,
) -> Result<String> {
    let group = accounting.group_path()?;
    let dump = accounting.dump(&group)?;
    debug!("Resource group {group}: {dump}");

    if !dump.contains(expected) {
        return Err(Error::AccountingMismatch {
            expected: expected.to_owned(),
            group,
        });
    }

    Ok(group)
}
