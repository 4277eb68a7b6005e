// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::{error_chain, Error, Result};

/// A logged-in shell inside the target.
pub trait TargetSession: Send + Sync {
    /// Run `command`, failing if it exits non-zero or outlives `timeout`.
    fn run(&self, command: &str, timeout: Duration) -> Result<String>;
}

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(1200);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Completed,
    Failed(String),
}

/// Handle on a running load. The outcome is published exactly once by the
/// load thread; readers only ever observe it.
pub struct LoadHandle {
    outcome: Arc<OnceLock<LoadOutcome>>,
    thread: JoinHandle<()>,
    timeout: Duration,
    deadline: Instant,
}

impl LoadHandle {
    fn new(outcome: Arc<OnceLock<LoadOutcome>>, thread: JoinHandle<()>, timeout: Duration) -> Self {
        LoadHandle {
            outcome,
            thread,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// `None` while the load is still running.
    pub fn poll(&self) -> Option<&LoadOutcome> {
        self.outcome.get()
    }

    /// The time the load was given in total.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the load has outlived its timeout without an outcome.
    pub fn expired(&self) -> bool {
        self.poll().is_none() && Instant::now() >= self.deadline
    }

    pub fn join(self) -> LoadOutcome {
        let joined = self.thread.join();
        match self.outcome.get() {
            Some(outcome) => outcome.clone(),
            None if joined.is_err() => LoadOutcome::Failed("load thread panicked".to_owned()),
            None => LoadOutcome::Failed("load thread exited without an outcome".to_owned()),
        }
    }
}

pub struct LoadGenerator {
    timeout: Duration,
}

impl Default for LoadGenerator {
    fn default() -> Self {
        LoadGenerator::new(DEFAULT_LOAD_TIMEOUT)
    }
}

impl LoadGenerator {
    pub fn new(timeout: Duration) -> Self {
        LoadGenerator { timeout }
    }

    /// Allocate and touch `memory` kB once, with `memhog` from numactl.
    pub fn command(memory: u64) -> String {
        format!("memhog -r1 {memory}k")
    }

    /// Start eating `memory` kB inside the target on a dedicated thread.
    ///
    /// Whatever happens while the workload runs, including a panic, ends up
    /// as the published `LoadOutcome`; nothing crosses back into the caller.
    /// Dropping the handle detaches the thread, the workload itself is left
    /// to the target teardown.
    pub fn start(&self, session: Arc<dyn TargetSession>, memory: u64) -> Result<LoadHandle> {
        let outcome = Arc::new(OnceLock::new());
        let published = Arc::clone(&outcome);
        let timeout = self.timeout;
        let command = Self::command(memory);

        info!("Starting memory load '{command}'");
        let thread = thread::Builder::new()
            .name("memory_load".to_string())
            .spawn(move || {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| session.run(&command, timeout)));
                let outcome = match result {
                    Ok(Ok(_)) => LoadOutcome::Completed,
                    Ok(Err(e)) => LoadOutcome::Failed(error_chain(&e)),
                    Err(_) => LoadOutcome::Failed(format!("'{command}' panicked")),
                };
                debug!("Memory load finished: {outcome:?}");
                let _ = published.set(outcome);
            })
            .map_err(|e| Error::ThreadSpawn("memory_load", e))?;

        Ok(LoadHandle::new(outcome, thread, timeout))
    }
}
