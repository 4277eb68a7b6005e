// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest control through `virsh`.

use std::fmt;
use std::fs;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use test_infra::{exec_host_command_output, wait_until, GuestSession, PasswordAuth};
use thiserror::Error;
use vmm_sys_util::tempfile::TempFile;

use crate::host::{run_checked, shell_quote};
use crate::load::TargetSession;
use crate::{Error, Result};

const DEFINITION_PREFIX: &str = "/tmp/memspread-domain";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaMode {
    Strict,
    Preferred,
}

impl fmt::Display for NumaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumaMode::Strict => write!(f, "strict"),
            NumaMode::Preferred => write!(f, "preferred"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid NUMA mode: {0}")]
pub struct NumaModeParseError(String);

impl FromStr for NumaMode {
    type Err = NumaModeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(NumaMode::Strict),
            "preferred" => Ok(NumaMode::Preferred),
            _ => Err(NumaModeParseError(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaTuning {
    pub mode: NumaMode,
    pub nodeset: String,
}

/// Memory settings written to the persistent guest definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    pub max_kb: u64,
    pub current_kb: u64,
    pub tuning: NumaTuning,
}

/// The persistent guest definition, as dumped by libvirt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigDocument(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    /// Refused by the management layer, with its error output.
    Rejected(String),
}

/// Configuration of one guest, persistent and live.
pub trait TargetConfig {
    fn backup(&self) -> Result<ConfigDocument>;
    fn restore(&self, document: &ConfigDocument) -> Result<()>;
    /// Write `layout` to the persistent definition. Either every field is
    /// applied or the definition is left as it was.
    fn apply_memory(&self, layout: &MemoryLayout) -> Result<()>;
    fn query_numatune(&self) -> Result<String>;
    fn set_live_numatune(&self, tuning: &NumaTuning) -> Result<ChangeOutcome>;
    fn set_live_memory(&self, kb: u64) -> Result<()>;
}

pub trait TargetLifecycle {
    fn name(&self) -> &str;
    fn is_active(&self) -> Result<bool>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    /// Wait for the guest to accept a login and hand out a session.
    fn login(&self) -> Result<Arc<dyn TargetSession>>;
}

/// Guest credentials and address.
#[derive(Clone, Debug)]
pub struct GuestAccess {
    /// Discovered from the DHCP leases when not set.
    pub ip: Option<String>,
    pub auth: PasswordAuth,
    pub login_timeout: Duration,
}

/// One libvirt domain driven through `virsh`.
pub struct Virsh {
    domain: String,
    quoted: String,
    access: GuestAccess,
}

impl Virsh {
    pub fn new(domain: &str, access: GuestAccess) -> Self {
        Virsh {
            domain: domain.to_owned(),
            quoted: shell_quote(domain),
            access,
        }
    }

    fn virsh(&self, subcommand: &str, args: &str) -> Result<String> {
        run_checked(&format!("virsh {subcommand} {} {args}", self.quoted))
    }

    fn apply_layout(&self, layout: &MemoryLayout) -> Result<()> {
        self.virsh("setmaxmem", &format!("{} --config", layout.max_kb))?;
        self.virsh("setmem", &format!("{} --config", layout.current_kb))?;
        self.virsh(
            "numatune",
            &format!(
                "--mode {} --nodeset {} --config",
                layout.tuning.mode,
                shell_quote(&layout.tuning.nodeset)
            ),
        )?;
        Ok(())
    }

    fn guest_ip(&self) -> Result<Option<String>> {
        if let Some(ip) = &self.access.ip {
            return Ok(Some(ip.clone()));
        }
        // No lease yet is not an error, the guest may still be booting
        match self.virsh("domifaddr", "") {
            Ok(out) => Ok(parse_domifaddr(&out)),
            Err(Error::HostCommand { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl TargetConfig for Virsh {
    fn backup(&self) -> Result<ConfigDocument> {
        self.virsh("dumpxml", "--inactive").map(ConfigDocument)
    }

    fn restore(&self, document: &ConfigDocument) -> Result<()> {
        let file = TempFile::new_with_prefix(DEFINITION_PREFIX).map_err(|e| {
            Error::HostRead(
                DEFINITION_PREFIX.into(),
                io::Error::from_raw_os_error(e.errno()),
            )
        })?;
        fs::write(file.as_path(), &document.0)
            .map_err(|e| Error::HostRead(file.as_path().to_path_buf(), e))?;

        let path = file.as_path().to_string_lossy().into_owned();
        run_checked(&format!("virsh define {}", shell_quote(&path)))?;
        info!("Definition of {} restored", self.domain);
        Ok(())
    }

    fn apply_memory(&self, layout: &MemoryLayout) -> Result<()> {
        let original = self.backup()?;
        debug!("Applying {layout:?} to {}", self.domain);
        if let Err(e) = self.apply_layout(layout) {
            if let Err(restore) = self.restore(&original) {
                warn!(
                    "Failed to undo a partial update of {}: {restore}",
                    self.domain
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn query_numatune(&self) -> Result<String> {
        self.virsh("numatune", "")
    }

    fn set_live_numatune(&self, tuning: &NumaTuning) -> Result<ChangeOutcome> {
        let command = format!(
            "virsh numatune {} --mode {} --nodeset {} --live",
            self.quoted,
            tuning.mode,
            shell_quote(&tuning.nodeset)
        );
        let output = exec_host_command_output(&command)?;
        if output.success() {
            Ok(ChangeOutcome::Applied)
        } else {
            Ok(ChangeOutcome::Rejected(output.stderr.trim().to_owned()))
        }
    }

    fn set_live_memory(&self, kb: u64) -> Result<()> {
        self.virsh("setmem", &format!("{kb} --live")).map(|_| ())
    }
}

impl TargetLifecycle for Virsh {
    fn name(&self) -> &str {
        &self.domain
    }

    fn is_active(&self) -> Result<bool> {
        Ok(self.virsh("domstate", "")?.trim() == "running")
    }

    fn start(&self) -> Result<()> {
        self.virsh("start", "").map(|_| ())
    }

    fn stop(&self) -> Result<()> {
        self.virsh("destroy", "").map(|_| ())
    }

    fn login(&self) -> Result<Arc<dyn TargetSession>> {
        let timeout = self.access.login_timeout;
        let start = Instant::now();

        let mut ip = None;
        let found = wait_until(timeout, Duration::ZERO, Duration::from_secs(2), || {
            ip = self.guest_ip()?;
            Ok::<bool, Error>(ip.is_some())
        })?;
        let ip = match ip {
            Some(ip) if found => ip,
            _ => return Err(Error::LoginTimeout(timeout)),
        };
        debug!("Guest {} is reachable at {ip}", self.domain);

        let session = GuestSession::new(&ip, self.access.auth.clone());
        if !session.wait_for_login(timeout.saturating_sub(start.elapsed()))? {
            return Err(Error::LoginTimeout(timeout));
        }
        info!("Logged into {} ({ip})", self.domain);

        Ok(Arc::new(SshSession(session)))
    }
}

/// `TargetSession` over ssh.
pub struct SshSession(pub GuestSession);

impl TargetSession for SshSession {
    fn run(&self, command: &str, timeout: Duration) -> Result<String> {
        Ok(self.0.ssh_command_timeout(command, timeout)?)
    }
}

/// First IPv4 address listed by `virsh domifaddr`, without its prefix
/// length.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------------------
///  vnet0      52:54:00:6b:29:7e    ipv4         192.168.122.83/24
/// ```
pub fn parse_domifaddr(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace().skip_while(|t| *t != "ipv4");
        tokens.next()?;
        let address = tokens.next()?;
        Some(address.split('/').next().unwrap_or(address).to_owned())
    })
}
