// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use test_infra::wait_until;
use thiserror::Error;

use crate::config::{Expectation, SpreadConfig};
use crate::host::HostSwap;
use crate::libvirt::{
    ChangeOutcome, ConfigDocument, MemoryLayout, NumaTuning, TargetConfig, TargetLifecycle,
};
use crate::load::{LoadGenerator, TargetSession};
use crate::planner::{self, SizingPlan};
use crate::sampler::{HostProcessAccounting, MemorySample, NodeUsageSampler};
use crate::topology::{self, parse_meminfo_field, HostTopologyReader};
use crate::verifier::{
    verify_accounting, DistributionVerifier, ResourceGroupAccounting, ThresholdPolicy,
};
use crate::watchdog::{LivenessWatchdog, PidLiveness};
use crate::{error_chain, Error, Result};

const GUEST_MEMINFO: &str = "cat /proc/meminfo";
const GUEST_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const GUEST_SWAPOFF_TIMEOUT: Duration = Duration::from_secs(10);
const GUEST_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const TUNING_STEP: Duration = Duration::from_secs(1);
const INSTALL_MEMHOG: &str = "command -v memhog || dnf -y install numactl \
                              || yum -y install numactl || apt-get -y install numactl";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Planning,
    Configuring,
    Tuning,
    LoadTesting,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Planning => "Planning",
            State::Configuring => "Configuring",
            State::Tuning => "Tuning",
            State::LoadTesting => "LoadTesting",
            State::Verifying => "Verifying",
            State::Done => "Done",
            State::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// The tuning change was refused the way the run expected.
    NegativePassed { message: String },
    Failed,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub vm: String,
    pub outcome: Outcome,
    /// Last state entered, `Failed` included.
    pub state: State,
    pub transitions: Vec<State>,
    pub plan: Option<SizingPlan>,
    pub before: Option<MemorySample>,
    pub after: Option<MemorySample>,
    pub neighbour_delta_mb: Option<i64>,
    pub accounting_group: Option<String>,
    pub error: Option<String>,
}

impl RunReport {
    fn new(vm: &str) -> Self {
        RunReport {
            vm: vm.to_owned(),
            outcome: Outcome::Failed,
            state: State::Planning,
            transitions: Vec::new(),
            plan: None,
            before: None,
            after: None,
            neighbour_delta_mb: None,
            accounting_group: None,
            error: None,
        }
    }

    fn enter(&mut self, state: State) {
        info!("{}: entering {state}", self.vm);
        self.state = state;
        self.transitions.push(state);
    }
}

/// A failed run: the state it failed in, why, and what was measured.
#[derive(Error, Debug)]
#[error("Run failed in state {state}")]
pub struct RunError {
    pub state: State,
    #[source]
    pub error: Error,
    pub report: Box<RunReport>,
}

/// Everything a run talks to on the host and in the guest.
pub struct Collaborators<'a> {
    pub topology: &'a dyn HostTopologyReader,
    pub accounting: &'a dyn HostProcessAccounting,
    pub swap: &'a dyn HostSwap,
    pub config: &'a dyn TargetConfig,
    pub lifecycle: &'a dyn TargetLifecycle,
    /// Set only when the secondary accounting check applies to this host.
    pub resource_groups: Option<&'a dyn ResourceGroupAccounting>,
}

/// Undoes host and guest changes of a run, exactly once.
struct Rollback<'a> {
    config: &'a dyn TargetConfig,
    swap: &'a dyn HostSwap,
    backup: Option<ConfigDocument>,
    done: bool,
}

impl<'a> Rollback<'a> {
    fn new(config: &'a dyn TargetConfig, swap: &'a dyn HostSwap) -> Self {
        Rollback {
            config,
            swap,
            backup: None,
            done: false,
        }
    }

    /// Best effort: failures are logged, never returned.
    fn run(&mut self) {
        if self.done {
            debug!("Rollback already done");
            return;
        }
        self.done = true;

        info!("Rolling back");
        if let Some(backup) = self.backup.take() {
            if let Err(e) = self.config.restore(&backup) {
                warn!("Failed to restore the guest definition: {}", error_chain(&e));
            }
        }
        if let Err(e) = self.swap.enable_swap() {
            warn!("Failed to enable host swap: {}", error_chain(&e));
        }
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        self.run();
    }
}

enum Configured {
    Ready(Arc<dyn TargetSession>, ThresholdPolicy),
    Rejected(String),
}

pub struct Orchestrator<'a> {
    config: &'a SpreadConfig,
    collaborators: Collaborators<'a>,
    interrupted: Arc<AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a SpreadConfig, collaborators: Collaborators<'a>) -> Self {
        Orchestrator {
            config,
            collaborators,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort the waits of the run once `flag` is raised.
    pub fn interrupted_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Run the whole memory spread check. Rollback has always happened by
    /// the time this returns.
    pub fn run(&self) -> std::result::Result<RunReport, RunError> {
        let mut report = RunReport::new(&self.config.main_vm);
        let mut rollback = Rollback::new(self.collaborators.config, self.collaborators.swap);

        let result = self.execute(&mut report, &mut rollback);
        rollback.run();

        match result {
            Ok(outcome) => {
                report.outcome = outcome;
                report.enter(State::Done);
                Ok(report)
            }
            Err(error) => {
                let state = report.state;
                error!("{} failed in state {state}: {}", report.vm, error_chain(&error));
                report.error = Some(error_chain(&error));
                report.enter(State::Failed);
                Err(RunError {
                    state,
                    error,
                    report: Box::new(report),
                })
            }
        }
    }

    fn execute(&self, report: &mut RunReport, rollback: &mut Rollback) -> Result<Outcome> {
        let c = &self.collaborators;

        report.enter(State::Planning);
        rollback.backup = Some(c.config.backup()?);
        let topology = topology::probe(c.topology)?;
        let plan = planner::plan(&topology, self.config.memory_nodeset)?;
        info!(
            "Guest bound to node {} with {} kB maximum, {} kB at boot, {} kB to eat; neighbour node {}",
            plan.nodeset, plan.oversize, plan.undersize, plan.memory_to_eat, plan.neighbour
        );
        report.plan = Some(plan.clone());
        c.swap.disable_swap()?;

        report.enter(State::Configuring);
        let (session, policy) = match self.configure(&plan)? {
            Configured::Ready(session, policy) => (session, policy),
            Configured::Rejected(message) => {
                return Ok(Outcome::NegativePassed { message });
            }
        };

        report.enter(State::Tuning);
        self.tune(session.as_ref(), &plan)?;

        report.enter(State::LoadTesting);
        let sampler = NodeUsageSampler::new(c.accounting);
        let before = sampler.sample(&self.config.process_name)?;
        report.before = Some(before.clone());
        self.load(session, &plan, before.pid)?;
        let after = sampler.sample(&self.config.process_name)?;
        report.after = Some(after.clone());
        if after.pid != before.pid {
            // Same name, different process: the guest went down in between
            return Err(Error::TargetCrashed {
                target: c.lifecycle.name().to_owned(),
            });
        }

        report.enter(State::Verifying);
        let delta = DistributionVerifier::new(policy).verify(&before, &after, plan.neighbour)?;
        report.neighbour_delta_mb = Some(delta);
        if let (Some(groups), Some(key)) = (c.resource_groups, self.config.cgget_message.as_deref())
        {
            report.accounting_group = Some(verify_accounting(groups, key)?);
        }

        Ok(Outcome::Passed)
    }

    fn configure(&self, plan: &SizingPlan) -> Result<Configured> {
        let c = &self.collaborators;

        if c.lifecycle.is_active()? {
            c.lifecycle.stop()?;
        }
        c.config.apply_memory(&MemoryLayout {
            max_kb: plan.oversize,
            current_kb: plan.undersize,
            tuning: NumaTuning {
                mode: self.config.memory_mode,
                nodeset: plan.nodeset.to_string(),
            },
        })?;
        c.lifecycle.start()?;
        let session = c.lifecycle.login()?;

        let current = c.config.query_numatune()?;
        debug!("Current numatune of {}: {current}", c.lifecycle.name());

        let tuning = NumaTuning {
            mode: self.config.memory_mode,
            nodeset: plan.nodeset_string.clone(),
        };
        let change = c.config.set_live_numatune(&tuning)?;
        match (&self.config.expectation, change) {
            (Expectation::Spread(policy), ChangeOutcome::Applied) => {
                info!("Live numatune changed to {} {}", tuning.mode, tuning.nodeset);
                Ok(Configured::Ready(session, *policy))
            }
            (Expectation::Spread(_), ChangeOutcome::Rejected(stderr)) => Err(Error::ConfigRejected {
                expected: format!("numatune {} {} applied", tuning.mode, tuning.nodeset),
                actual: stderr,
            }),
            (Expectation::Rejection { message }, ChangeOutcome::Rejected(stderr))
                if stderr.contains(message.as_str()) =>
            {
                info!("Live numatune rejected as expected: {stderr}");
                Ok(Configured::Rejected(stderr))
            }
            (Expectation::Rejection { message }, ChangeOutcome::Rejected(stderr)) => {
                Err(Error::ConfigRejected {
                    expected: format!("rejection containing '{message}'"),
                    actual: stderr,
                })
            }
            (Expectation::Rejection { message }, ChangeOutcome::Applied) => {
                Err(Error::ConfigRejected {
                    expected: format!("rejection containing '{message}'"),
                    actual: format!("numatune {} {} applied", tuning.mode, tuning.nodeset),
                })
            }
        }
    }

    fn tune(&self, session: &dyn TargetSession, plan: &SizingPlan) -> Result<()> {
        let c = &self.collaborators;
        let timeouts = &self.config.timeouts;

        c.config.set_live_memory(plan.oversize)?;

        let mut last_seen_kb = None;
        let available = wait_until(timeouts.tuning, timeouts.tuning_first, TUNING_STEP, || {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }
            let meminfo = session.run(GUEST_MEMINFO, GUEST_COMMAND_TIMEOUT)?;
            let free = parse_meminfo_field(&meminfo, "MemFree").ok_or_else(|| Error::Parse {
                what: "guest meminfo",
                content: meminfo.clone(),
            })?;
            debug!("Guest free memory is {free} kB");
            last_seen_kb = Some(free);
            Ok(free > plan.memory_to_eat)
        })?;
        if !available {
            return Err(Error::MemoryNotAvailable {
                expected_kb: plan.memory_to_eat,
                last_seen_kb,
                timeout: timeouts.tuning,
            });
        }

        if let Err(e) = session.run("swapoff -a", GUEST_SWAPOFF_TIMEOUT) {
            warn!("Failed to turn the guest swap off: {}", error_chain(&e));
        }
        session
            .run(INSTALL_MEMHOG, GUEST_INSTALL_TIMEOUT)
            .map_err(|e| Error::GuestPreparation(format!("numactl install: {}", error_chain(&e))))?;

        Ok(())
    }

    fn load(&self, session: Arc<dyn TargetSession>, plan: &SizingPlan, pid: u32) -> Result<()> {
        let c = &self.collaborators;
        let timeouts = &self.config.timeouts;

        let handle = LoadGenerator::new(timeouts.memhog).start(session, plan.memory_to_eat)?;
        let liveness = PidLiveness::new(c.accounting, pid);
        LivenessWatchdog::new(&liveness, c.lifecycle.name(), timeouts.watchdog_interval)
            .interrupted_by(Arc::clone(&self.interrupted))
            .race(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;

    use super::*;
    use crate::sampler::tests::FakeAccounting;
    use crate::verifier::tests::FakeGroups;
    use crate::NodeId;

    const REJECTION: &str = "error: Unable to write to \
        '/sys/fs/cgroup/cpuset/machine.slice/machine-qemu\\x2d1\\x2dvm1.scope/emulator/cpuset.mems': \
        Device or resource busy";

    struct FakeTopology;

    impl HostTopologyReader for FakeTopology {
        fn online_nodes_with_memory(&self) -> Result<Vec<NodeId>> {
            Ok(vec![0, 1])
        }

        fn node_mem_total(&self, node: NodeId) -> Result<u64> {
            Ok(if node == 0 { 8_000_000 } else { 4_000_000 })
        }
    }

    #[derive(Default)]
    struct FakeSwap {
        disabled: Cell<u32>,
        enabled: Cell<u32>,
    }

    impl HostSwap for FakeSwap {
        fn disable_swap(&self) -> Result<()> {
            self.disabled.set(self.disabled.get() + 1);
            Ok(())
        }

        fn enable_swap(&self) -> Result<()> {
            self.enabled.set(self.enabled.get() + 1);
            Ok(())
        }
    }

    struct FakeSession {
        free_kb: u64,
        // When set, memhog blocks until the sender is dropped
        memhog_gate: Mutex<Option<Receiver<()>>>,
        memhog_fails: bool,
        commands: Mutex<Vec<String>>,
    }

    impl TargetSession for FakeSession {
        fn run(&self, command: &str, _timeout: Duration) -> Result<String> {
            self.commands.lock().unwrap().push(command.to_owned());
            if command == GUEST_MEMINFO {
                return Ok(format!(
                    "MemTotal:       10000000 kB\nMemFree:        {} kB\n",
                    self.free_kb
                ));
            }
            if command.starts_with("memhog") {
                if let Some(gate) = self.memhog_gate.lock().unwrap().as_ref() {
                    let _ = gate.recv();
                }
                if self.memhog_fails {
                    return Err(Error::GuestPreparation("memhog killed".to_owned()));
                }
            }
            Ok(String::new())
        }
    }

    struct FakeTarget {
        numatune: ChangeOutcome,
        active: Cell<bool>,
        restored: Cell<u32>,
        restore_fails: bool,
        calls: RefCell<Vec<String>>,
        session: Arc<FakeSession>,
    }

    impl FakeTarget {
        fn new(numatune: ChangeOutcome, free_kb: u64) -> Self {
            FakeTarget {
                numatune,
                active: Cell::new(true),
                restored: Cell::new(0),
                restore_fails: false,
                calls: RefCell::new(Vec::new()),
                session: Arc::new(FakeSession {
                    free_kb,
                    memhog_gate: Mutex::new(None),
                    memhog_fails: false,
                    commands: Mutex::new(Vec::new()),
                }),
            }
        }

        fn gate_memhog(&mut self) -> Sender<()> {
            let (tx, rx) = channel();
            self.session = Arc::new(FakeSession {
                free_kb: self.session.free_kb,
                memhog_gate: Mutex::new(Some(rx)),
                memhog_fails: true,
                commands: Mutex::new(Vec::new()),
            });
            tx
        }

        fn call(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl TargetConfig for FakeTarget {
        fn backup(&self) -> Result<ConfigDocument> {
            Ok(ConfigDocument("<domain type='kvm'/>".to_owned()))
        }

        fn restore(&self, document: &ConfigDocument) -> Result<()> {
            assert_eq!(document.0, "<domain type='kvm'/>");
            self.restored.set(self.restored.get() + 1);
            if self.restore_fails {
                return Err(Error::HostCommand {
                    command: "virsh define".to_owned(),
                    status: Some(1),
                    stderr: "error: failed to define domain".to_owned(),
                });
            }
            Ok(())
        }

        fn apply_memory(&self, layout: &MemoryLayout) -> Result<()> {
            self.call(format!(
                "apply {} {} {} {}",
                layout.max_kb, layout.current_kb, layout.tuning.mode, layout.tuning.nodeset
            ));
            Ok(())
        }

        fn query_numatune(&self) -> Result<String> {
            Ok("numa_mode      : strict\nnuma_nodeset   : 0\n".to_owned())
        }

        fn set_live_numatune(&self, tuning: &NumaTuning) -> Result<ChangeOutcome> {
            self.call(format!("numatune {} {}", tuning.mode, tuning.nodeset));
            Ok(self.numatune.clone())
        }

        fn set_live_memory(&self, kb: u64) -> Result<()> {
            self.call(format!("setmem {kb}"));
            Ok(())
        }
    }

    impl TargetLifecycle for FakeTarget {
        fn name(&self) -> &str {
            "vm1"
        }

        fn is_active(&self) -> Result<bool> {
            Ok(self.active.get())
        }

        fn start(&self) -> Result<()> {
            self.call("start".to_owned());
            self.active.set(true);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.call("stop".to_owned());
            self.active.set(false);
            Ok(())
        }

        fn login(&self) -> Result<Arc<dyn TargetSession>> {
            Ok(self.session.clone())
        }
    }

    fn config(extra: &str) -> SpreadConfig {
        SpreadConfig::parse(&format!(
            "main_vm=vm1,guest_password=x,tuning_first=0,tuning_timeout=1,\
             watchdog_interval_ms=1,{extra}"
        ))
        .unwrap()
    }

    fn sampled(after: &[(NodeId, u64)]) -> FakeAccounting {
        FakeAccounting {
            pids: vec![4242],
            usages: RefCell::new(vec![
                BTreeMap::from([(0, 2000), (1, 10)]),
                after.iter().copied().collect(),
            ]),
            ..Default::default()
        }
    }

    fn run(
        config: &SpreadConfig,
        accounting: &FakeAccounting,
        swap: &FakeSwap,
        target: &FakeTarget,
        groups: Option<&dyn ResourceGroupAccounting>,
    ) -> std::result::Result<RunReport, RunError> {
        Orchestrator::new(
            config,
            Collaborators {
                topology: &FakeTopology,
                accounting,
                swap,
                config: target,
                lifecycle: target,
                resource_groups: groups,
            },
        )
        .run()
    }

    fn assert_rolled_back(swap: &FakeSwap, target: &FakeTarget) {
        assert_eq!(target.restored.get(), 1);
        assert_eq!(swap.enabled.get(), 1);
    }

    #[test]
    fn test_memory_spreads() {
        let config = config("limit_mb=300");
        let accounting = sampled(&[(0, 8000), (1, 410)]);
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);

        let report = run(&config, &accounting, &swap, &target, None).unwrap();
        assert_eq!(report.outcome, Outcome::Passed);
        assert_eq!(report.state, State::Done);
        assert_eq!(
            report.transitions,
            vec![
                State::Planning,
                State::Configuring,
                State::Tuning,
                State::LoadTesting,
                State::Verifying,
                State::Done
            ]
        );
        assert_eq!(report.neighbour_delta_mb, Some(400));
        assert_eq!(report.accounting_group, None);
        assert_eq!(report.plan.as_ref().unwrap().memory_to_eat, 8_400_000);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "passed");
        assert_eq!(json["state"], "done");
        assert_eq!(json["transitions"][3], "load_testing");
        assert_eq!(json["plan"]["nodeset_string"], "0,1");
        assert_eq!(json["after"]["per_node_mb"]["1"], 410);

        assert_eq!(
            *target.calls.borrow(),
            vec![
                "stop",
                "apply 10000000 2000000 strict 0",
                "start",
                "numatune strict 0,1",
                "setmem 10000000",
            ]
        );
        let commands = target.session.commands.lock().unwrap();
        assert_eq!(commands.first().map(String::as_str), Some(GUEST_MEMINFO));
        assert_eq!(commands.last().map(String::as_str), Some("memhog -r1 8400000k"));
        assert!(commands.iter().any(|c| c == "swapoff -a"));

        assert_eq!(swap.disabled.get(), 1);
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_violation() {
        let config = config("limit_mb=300");
        let accounting = sampled(&[(0, 9000), (1, 100)]);
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::Verifying);
        assert!(matches!(
            e.error,
            Error::Violation {
                neighbour: 1,
                actual_delta_mb: 90,
                limit_mb: 300
            }
        ));
        assert_eq!(e.report.state, State::Failed);
        assert!(e.report.after.is_some());
        assert!(e.report.error.as_deref().unwrap().contains("90 MB"));
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_target_dies_during_load() {
        let config = config("limit_mb=300");
        let accounting = sampled(&[(0, 8000), (1, 410)]);
        *accounting.alive.borrow_mut() = vec![true, true, false];
        let swap = FakeSwap::default();
        let mut target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);
        // memhog never finishes on its own
        let _gate = target.gate_memhog();

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::LoadTesting);
        assert!(matches!(e.error, Error::TargetCrashed { ref target } if target == "vm1"));
        assert!(!e.report.transitions.contains(&State::Verifying));
        assert!(e.report.after.is_none());
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_load_fails() {
        let config = config("limit_mb=300");
        let accounting = sampled(&[(0, 8000), (1, 410)]);
        let swap = FakeSwap::default();
        let mut target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);
        drop(target.gate_memhog());

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::LoadTesting);
        assert!(matches!(e.error, Error::WorkloadFailed(ref r) if r.contains("memhog killed")));
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_expected_rejection() {
        let config = config("status_error=yes,error_message=\"Unable to write to\"");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Rejected(REJECTION.to_owned()), 9_000_000);

        let report = run(&config, &accounting, &swap, &target, None).unwrap();
        assert_eq!(
            report.outcome,
            Outcome::NegativePassed {
                message: REJECTION.to_owned()
            }
        );
        assert_eq!(
            report.transitions,
            vec![State::Planning, State::Configuring, State::Done]
        );
        assert!(report.before.is_none());
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_unexpected_rejection_message() {
        let config = config("status_error=yes,error_message=\"Unable to write to\"");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(
            ChangeOutcome::Rejected("error: invalid nodeset".to_owned()),
            9_000_000,
        );

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::Configuring);
        match e.error {
            Error::ConfigRejected { expected, actual } => {
                assert!(expected.contains("Unable to write to"));
                assert_eq!(actual, "error: invalid nodeset");
            }
            e => panic!("unexpected error: {e:?}"),
        }
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_rejection_expected_but_applied() {
        let config = config("status_error=yes,error_message=\"Unable to write to\"");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::Configuring);
        assert!(matches!(e.error, Error::ConfigRejected { .. }));
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_rejected_positive_run() {
        let config = config("limit_mb=300");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Rejected(REJECTION.to_owned()), 9_000_000);

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::Configuring);
        assert!(matches!(e.error, Error::ConfigRejected { ref actual, .. } if actual == REJECTION));
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_memory_not_available() {
        let config = config("limit_mb=300");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 1_000_000);

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::Tuning);
        assert!(matches!(
            e.error,
            Error::MemoryNotAvailable {
                expected_kb: 8_400_000,
                last_seen_kb: Some(1_000_000),
                ..
            }
        ));
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_interrupted() {
        let config = config("limit_mb=300");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);

        let e = Orchestrator::new(
            &config,
            Collaborators {
                topology: &FakeTopology,
                accounting: &accounting,
                swap: &swap,
                config: &target,
                lifecycle: &target,
                resource_groups: None,
            },
        )
        .interrupted_by(Arc::new(AtomicBool::new(true)))
        .run()
        .unwrap_err();
        assert_eq!(e.state, State::Tuning);
        assert!(matches!(e.error, Error::Interrupted));
        assert_rolled_back(&swap, &target);
    }

    #[test]
    fn test_unknown_nodeset() {
        let config = config("limit_mb=300,memory_nodeset=3");
        let accounting = FakeAccounting::default();
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);

        let e = run(&config, &accounting, &swap, &target, None).unwrap_err();
        assert_eq!(e.state, State::Planning);
        assert!(matches!(e.error, Error::UnknownNode(3)));
        // Swap was never disabled, it is still switched back on
        assert_eq!(swap.disabled.get(), 0);
        assert_rolled_back(&swap, &target);
        assert!(target.calls.borrow().is_empty());
    }

    #[test]
    fn test_accounting_check() {
        let config = config("limit_mb=300,cgget_message=\"cpuset.mems: 0-1\"");
        let swap = FakeSwap::default();
        let target = FakeTarget::new(ChangeOutcome::Applied, 9_000_000);
        let group = "/machine.slice/machine-qemu\\x2d1\\x2dvm1.scope/libvirt".to_owned();

        let groups = FakeGroups {
            group: group.clone(),
            dump: "cpuset.mems: 0-1\n".to_owned(),
        };
        let accounting = sampled(&[(0, 8000), (1, 410)]);
        let report = run(&config, &accounting, &swap, &target, Some(&groups)).unwrap();
        assert_eq!(report.accounting_group, Some(group.clone()));

        let groups = FakeGroups {
            group,
            dump: "cpuset.mems: 0\n".to_owned(),
        };
        let accounting = sampled(&[(0, 8000), (1, 410)]);
        let e = run(&config, &accounting, &swap, &target, Some(&groups)).unwrap_err();
        assert_eq!(e.state, State::Verifying);
        assert!(matches!(e.error, Error::AccountingMismatch { .. }));
    }

    #[test]
    fn test_rollback_runs_once() {
        let swap = FakeSwap::default();
        let mut target = FakeTarget::new(ChangeOutcome::Applied, 0);
        target.restore_fails = true;

        {
            let mut rollback = Rollback::new(&target, &swap);
            rollback.backup = Some(target.backup().unwrap());
            // A failing restore does not stop the swap from coming back
            rollback.run();
            rollback.run();
        }
        assert_rolled_back(&swap, &target);

        let swap = FakeSwap::default();
        drop(Rollback::new(&target, &swap));
        assert_eq!(swap.enabled.get(), 1);
    }
}
