// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::load::{LoadHandle, LoadOutcome};
use crate::sampler::HostProcessAccounting;
use crate::{Error, Result};

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Alive,
    Dead,
}

pub trait TargetLiveness {
    fn verdict(&self) -> Result<WatchdogVerdict>;
}

/// Liveness of the host process backing the target.
pub struct PidLiveness<'a> {
    accounting: &'a dyn HostProcessAccounting,
    pid: u32,
}

impl<'a> PidLiveness<'a> {
    pub fn new(accounting: &'a dyn HostProcessAccounting, pid: u32) -> Self {
        PidLiveness { accounting, pid }
    }
}

impl TargetLiveness for PidLiveness<'_> {
    fn verdict(&self) -> Result<WatchdogVerdict> {
        Ok(if self.accounting.process_alive(self.pid)? {
            WatchdogVerdict::Alive
        } else {
            WatchdogVerdict::Dead
        })
    }
}

/// Polls the target while a load runs against it.
pub struct LivenessWatchdog<'a> {
    liveness: &'a dyn TargetLiveness,
    target: String,
    interval: Duration,
    interrupted: Option<Arc<AtomicBool>>,
}

impl<'a> LivenessWatchdog<'a> {
    pub fn new(liveness: &'a dyn TargetLiveness, target: &str, interval: Duration) -> Self {
        LivenessWatchdog {
            liveness,
            target: target.to_owned(),
            interval,
            interrupted: None,
        }
    }

    /// Give up with `Error::Interrupted` once `flag` is raised.
    pub fn interrupted_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }

    /// Wait for `load` to publish its outcome while checking the target.
    ///
    /// A finished load always wins over a dead target: the outcome is looked
    /// at before and after each liveness check. A dead target ends the race
    /// right away with `TargetCrashed`, and a load outliving its timeout
    /// with `WorkloadFailed`. The load thread is then left detached.
    pub fn race(&self, load: LoadHandle) -> Result<()> {
        let mut polls: u64 = 0;
        loop {
            if self
                .interrupted
                .as_ref()
                .is_some_and(|f| f.load(Ordering::SeqCst))
            {
                warn!("Interrupted while the memory load was running");
                return Err(Error::Interrupted);
            }

            if load.poll().is_some() {
                break;
            }

            if load.expired() {
                error!("Memory load on {} outlived {:?}", self.target, load.timeout());
                return Err(Error::WorkloadFailed(format!(
                    "memory load did not finish within {:?}",
                    load.timeout()
                )));
            }

            if self.liveness.verdict()? == WatchdogVerdict::Dead {
                // The load may have published while the target was checked
                if load.poll().is_some() {
                    break;
                }
                error!("Target {} is dead, abandoning the memory load", self.target);
                return Err(Error::TargetCrashed {
                    target: self.target.clone(),
                });
            }

            polls += 1;
            thread::sleep(self.interval);
        }

        debug!("Target {} stayed alive over {polls} checks", self.target);
        match load.join() {
            LoadOutcome::Completed => {
                info!("Memory load completed");
                Ok(())
            }
            LoadOutcome::Failed(reason) => Err(Error::WorkloadFailed(reason)),
        }
    }
}
