// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::str::FromStr;
use std::time::Duration;

use param_parser::{ParamError, ParamParser, Toggle};
use serde::Serialize;
use test_infra::PasswordAuth;
use thiserror::Error;

use crate::host::accounting_check_applies;
use crate::libvirt::{GuestAccess, NumaMode};
use crate::load::DEFAULT_LOAD_TIMEOUT;
use crate::verifier::ThresholdPolicy;
use crate::watchdog::DEFAULT_WATCHDOG_INTERVAL;
use crate::NodeId;

pub const DEFAULT_PROCESS_NAME: &str = "qemu-kvm";
pub const DEFAULT_GUEST_USER: &str = "root";
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(240);
pub const DEFAULT_TUNING_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_TUNING_FIRST: Duration = Duration::from_secs(5);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Error parsing run parameters")]
    Parse(#[source] ParamError),
    #[error("status_error=yes needs an error_message to match the rejection against")]
    MissingErrorMessage,
    #[error("limit_mb is needed unless the run expects a rejection")]
    MissingLimit,
    #[error("cgroup_check=on needs a cgget_message to look for")]
    MissingAccountingKey,
}

impl From<ParamError> for ConfigError {
    fn from(e: ParamError) -> Self {
        ConfigError::Parse(e)
    }
}

/// What a run is expected to end with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// Memory spreads onto the neighbour node.
    Spread(ThresholdPolicy),
    /// The live NUMA tuning change is refused with `message` in its error.
    Rejection { message: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountingCheck {
    /// Only on hosts known to expose the cpuset group layout.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid accounting check: {0}")]
pub struct AccountingCheckParseError(String);

impl FromStr for AccountingCheck {
    type Err = AccountingCheckParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AccountingCheck::Auto),
            "on" | "yes" => Ok(AccountingCheck::On),
            "off" | "no" => Ok(AccountingCheck::Off),
            _ => Err(AccountingCheckParseError(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GuestConfig {
    pub ip: Option<String>,
    pub user: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub login: Duration,
    pub memhog: Duration,
    pub tuning: Duration,
    pub tuning_first: Duration,
    pub watchdog_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            login: DEFAULT_LOGIN_TIMEOUT,
            memhog: DEFAULT_LOAD_TIMEOUT,
            tuning: DEFAULT_TUNING_TIMEOUT,
            tuning_first: DEFAULT_TUNING_FIRST,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
        }
    }
}

/// Everything a memory spread run is parameterized by.
#[derive(Clone, Debug)]
pub struct SpreadConfig {
    pub main_vm: String,
    pub memory_mode: NumaMode,
    pub memory_nodeset: Option<NodeId>,
    pub expectation: Expectation,
    pub cgget_message: Option<String>,
    pub accounting_check: AccountingCheck,
    pub process_name: String,
    pub guest: GuestConfig,
    pub timeouts: Timeouts,
    pub kill_vm: bool,
}

impl SpreadConfig {
    /// Parser knowing every run parameter.
    pub fn parser() -> ParamParser {
        let mut parser = ParamParser::new();
        parser
            .add("main_vm")
            .add("memory_mode")
            .add("memory_nodeset")
            .add("limit_mb")
            .add("status_error")
            .add("error_message")
            .add("cgget_message")
            .add("cgroup_check")
            .add("process_name")
            .add("guest_ip")
            .add("guest_user")
            .add("guest_password")
            .add("login_timeout")
            .add("memhog_timeout")
            .add("tuning_timeout")
            .add("tuning_first")
            .add("watchdog_interval_ms")
            .add("kill_vm");
        parser
    }

    pub fn parse(params: &str) -> Result<Self, ConfigError> {
        let mut parser = Self::parser();
        parser.parse(params)?;
        Self::from_parser(&parser)
    }

    pub fn from_parser(parser: &ParamParser) -> Result<Self, ConfigError> {
        let seconds = |key: &str, default: Duration| -> Result<Duration, ParamError> {
            Ok(parser
                .convert::<u64>(key)?
                .map_or(default, Duration::from_secs))
        };

        let negative = parser
            .convert::<Toggle>("status_error")?
            .is_some_and(|t| t.0);
        let expectation = if negative {
            Expectation::Rejection {
                message: parser
                    .get("error_message")
                    .ok_or(ConfigError::MissingErrorMessage)?,
            }
        } else {
            Expectation::Spread(ThresholdPolicy {
                limit_mb: parser
                    .convert::<u64>("limit_mb")?
                    .ok_or(ConfigError::MissingLimit)?,
            })
        };

        let cgget_message = parser.get("cgget_message");
        let accounting_check = parser
            .convert::<AccountingCheck>("cgroup_check")?
            .unwrap_or_default();
        if accounting_check == AccountingCheck::On && cgget_message.is_none() {
            return Err(ConfigError::MissingAccountingKey);
        }

        Ok(SpreadConfig {
            main_vm: parser.require("main_vm")?,
            memory_mode: parser
                .convert::<NumaMode>("memory_mode")?
                .unwrap_or(NumaMode::Strict),
            memory_nodeset: parser.convert::<NodeId>("memory_nodeset")?,
            expectation,
            cgget_message,
            accounting_check,
            process_name: parser
                .get("process_name")
                .unwrap_or_else(|| DEFAULT_PROCESS_NAME.to_owned()),
            guest: GuestConfig {
                ip: parser.get("guest_ip"),
                user: parser
                    .get("guest_user")
                    .unwrap_or_else(|| DEFAULT_GUEST_USER.to_owned()),
                password: parser.require("guest_password")?,
            },
            timeouts: Timeouts {
                login: seconds("login_timeout", DEFAULT_LOGIN_TIMEOUT)?,
                memhog: seconds("memhog_timeout", DEFAULT_LOAD_TIMEOUT)?,
                tuning: seconds("tuning_timeout", DEFAULT_TUNING_TIMEOUT)?,
                tuning_first: seconds("tuning_first", DEFAULT_TUNING_FIRST)?,
                watchdog_interval: parser
                    .convert::<u64>("watchdog_interval_ms")?
                    .map_or(DEFAULT_WATCHDOG_INTERVAL, Duration::from_millis),
            },
            kill_vm: parser.convert::<Toggle>("kill_vm")?.map_or(true, |t| t.0),
        })
    }

    /// The accounting key to look for, when the secondary check runs on a
    /// host described by `os_release`.
    pub fn accounting_key(&self, os_release: &str) -> Option<&str> {
        let enabled = match self.accounting_check {
            AccountingCheck::On => true,
            AccountingCheck::Off => false,
            AccountingCheck::Auto => accounting_check_applies(os_release),
        };
        self.cgget_message.as_deref().filter(|_| enabled)
    }

    pub fn guest_access(&self) -> GuestAccess {
        GuestAccess {
            ip: self.guest.ip.clone(),
            auth: PasswordAuth {
                username: self.guest.user.clone(),
                password: self.guest.password.clone(),
            },
            login_timeout: self.timeouts.login,
        }
    }
}
