// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host and guest plumbing shared by the NUMA test harness: bounded host
//! shell commands, ssh commands into a guest, polling helpers and host
//! process liveness.

#![allow(clippy::undocumented_unsafe_blocks)]

use std::io::{self, Read};
use std::net::TcpStream;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};
use std::{fmt, thread};

use log::{debug, warn};
use ssh2::Session;
use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum WaitTimeoutError {
    #[error("timeout")]
    Timedout,
    #[error("general failure")]
    General(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("spawning '{0}' failed")]
    Spawn(String, #[source] std::io::Error),
    #[error("waiting for '{0}' failed")]
    WaitTimeout(String, #[source] WaitTimeoutError),
    #[error("collecting the output of '{0}' failed")]
    Output(String, #[source] std::io::Error),
}

/// Default ceiling for a single host command (virsh, numastat, cgget...).
pub const DEFAULT_HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Output of a host command, with stdout/stderr already decoded.
pub struct HostOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl HostOutput {
    fn from_output(output: Output) -> Self {
        HostOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl fmt::Debug for HostOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status = {}\n---stdout---\n{}\n---stderr---\n{}",
            self.status, self.stdout, self.stderr
        )
    }
}

/// Drain `pipe` on its own thread so the child never blocks on a full pipe.
fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    pipe: Option<R>,
) -> io::Result<thread::JoinHandle<io::Result<Vec<u8>>>> {
    thread::Builder::new().name(name.to_owned()).spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_reader(reader: thread::JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    reader
        .join()
        .map_err(|_| io::Error::other("output reader panicked"))?
}

pub fn kill_child(child: &mut Child) {
    let r = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        warn!("Failed to kill child with SIGTERM: {e:?}");
    }

    // The grace period elapsed without the child exiting
    if !matches!(child.wait_timeout(Duration::new(10, 0)), Ok(Some(_))) {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Run `command` through `bash -c`, killing it if it does not finish
/// within `timeout`. A non-zero exit status is not an error here, callers
/// decide what a failure means for them.
pub fn exec_host_command_timeout(command: &str, timeout: Duration) -> Result<HostOutput, Error> {
    debug!("host command: {command}");

    let mut child = Command::new("bash")
        .args(["-c", command])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn(command.to_owned(), e))?;

    let readers = spawn_reader("host_cmd_stdout", child.stdout.take()).and_then(|stdout| {
        spawn_reader("host_cmd_stderr", child.stderr.take()).map(|stderr| (stdout, stderr))
    });
    let (stdout, stderr) = match readers {
        Ok(readers) => readers,
        Err(e) => {
            kill_child(&mut child);
            return Err(Error::Output(command.to_owned(), e));
        }
    };

    // On timeout the readers are left detached: a grandchild may still hold
    // the pipes open.
    let status = match child.wait_timeout(timeout) {
        Err(e) => {
            kill_child(&mut child);
            return Err(Error::WaitTimeout(
                command.to_owned(),
                WaitTimeoutError::General(e),
            ));
        }
        Ok(None) => {
            kill_child(&mut child);
            return Err(Error::WaitTimeout(
                command.to_owned(),
                WaitTimeoutError::Timedout,
            ));
        }
        Ok(Some(status)) => status,
    };

    let output = HostOutput::from_output(Output {
        status,
        stdout: join_reader(stdout).map_err(|e| Error::Output(command.to_owned(), e))?,
        stderr: join_reader(stderr).map_err(|e| Error::Output(command.to_owned(), e))?,
    });

    if !output.success() {
        debug!(
            "\n\n==== Start 'exec_host_command' failed ==== \
            \n\ncommand = {command}\n{output:?} \
            \n\n==== End 'exec_host_command' failed ====",
        );
    }

    Ok(output)
}

pub fn exec_host_command_output(command: &str) -> Result<HostOutput, Error> {
    exec_host_command_timeout(command, DEFAULT_HOST_COMMAND_TIMEOUT)
}

/// Whether a host process still exists. A process we are not allowed to
/// signal (`EPERM`) is alive as far as we are concerned.
pub fn process_alive(pid: u32) -> bool {
    let r = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if r == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Poll `check` until it returns `true` or `timeout` elapses.
///
/// The first check happens after `first`, then every `step`. Errors from
/// `check` abort the wait immediately. Returns `Ok(false)` on timeout.
pub fn wait_until<F, E>(timeout: Duration, first: Duration, step: Duration, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();
    thread::sleep(first);

    loop {
        if check()? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        thread::sleep(step.min(timeout.saturating_sub(start.elapsed())));
    }
}

#[derive(Clone)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_SSH_RETRIES: u8 = 6;
pub const DEFAULT_SSH_TIMEOUT: u8 = 10;

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("ssh connection failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh session creation failed")]
    Session(#[source] ssh2::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("ssh command failed")]
    Command(#[source] ssh2::Error),
    #[error("reading ssh command output failed")]
    Read(#[source] std::io::Error),
    #[error("retrieving exit status from ssh command failed")]
    ExitStatus(#[source] ssh2::Error),
    #[error("the exit code indicates failure: {status}, output: {output}")]
    NonZeroExitStatus { status: i32, output: String },
    #[error("ssh command did not finish within {0:?}")]
    Timeout(Duration),
}

impl SshCommandError {
    // Only failures to reach the guest are worth another attempt, the
    // command itself must never run twice.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            SshCommandError::Connection(_)
                | SshCommandError::Handshake(_)
                | SshCommandError::Authentication(_)
        )
    }
}

fn connect(ip: &str, auth: &PasswordAuth) -> Result<Session, SshCommandError> {
    let tcp = TcpStream::connect(format!("{ip}:22")).map_err(SshCommandError::Connection)?;
    let mut sess = Session::new().map_err(SshCommandError::Session)?;
    sess.set_tcp_stream(tcp);
    sess.handshake().map_err(SshCommandError::Handshake)?;
    sess.userauth_password(&auth.username, &auth.password)
        .map_err(SshCommandError::Authentication)?;
    Ok(sess)
}

/// Time left before `deadline`, as a libssh2 timeout. Zero means the
/// deadline has passed, since libssh2 reads a zero timeout as "wait forever".
fn ssh_timeout_ms(deadline: Instant) -> u32 {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return 0;
    }
    left.as_millis().clamp(1, u32::MAX as u128) as u32
}

fn run_channel(
    sess: &Session,
    command: &str,
    command_timeout: Option<Duration>,
    output: &mut String,
) -> Result<(), SshCommandError> {
    let deadline = command_timeout.map(|t| (t, Instant::now() + t));
    let mut channel = sess
        .channel_session()
        .map_err(SshCommandError::ChannelSession)?;
    channel.exec(command).map_err(SshCommandError::Command)?;

    // A command printing progress would reset a per call timeout forever,
    // so every read only gets what is left of the whole budget.
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        if let Some((timeout, deadline)) = deadline {
            match ssh_timeout_ms(deadline) {
                0 => {
                    *output = String::from_utf8_lossy(&raw).into_owned();
                    return Err(SshCommandError::Timeout(timeout));
                }
                ms => sess.set_timeout(ms),
            }
        }
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                *output = String::from_utf8_lossy(&raw).into_owned();
                return Err(match deadline {
                    Some((timeout, deadline)) if Instant::now() >= deadline => {
                        SshCommandError::Timeout(timeout)
                    }
                    _ => SshCommandError::Read(e),
                });
            }
        }
    }
    *output = String::from_utf8_lossy(&raw).into_owned();

    // Intentionally ignore these results here as their failure
    // does not change the outcome of the command
    let _ = channel.close();
    let _ = channel.wait_close();

    let status = channel.exit_status().map_err(SshCommandError::ExitStatus)?;
    if status != 0 {
        return Err(SshCommandError::NonZeroExitStatus {
            status,
            output: output.clone(),
        });
    }

    Ok(())
}

/// Run `command` on the guest at `ip`. Connection level failures are
/// retried up to `retries` times with a growing back-off; a command that ran
/// and failed is reported right away. `command_timeout` bounds the whole
/// command once connected (`None` waits forever).
pub fn ssh_command_ip_with_auth(
    command: &str,
    auth: &PasswordAuth,
    ip: &str,
    retries: u8,
    timeout: u8,
    command_timeout: Option<Duration>,
) -> Result<String, SshCommandError> {
    let mut counter = 0;
    loop {
        let mut s = String::new();
        let result = connect(ip, auth).and_then(|sess| {
            let ms = command_timeout.map_or(0, |t| t.as_millis().clamp(1, u32::MAX as u128) as u32);
            sess.set_timeout(ms);
            run_channel(&sess, command, command_timeout, &mut s)
        });

        match result {
            Ok(()) => return Ok(s),
            Err(e) => {
                counter += 1;
                if !e.is_transient() || counter >= retries {
                    debug!(
                        "\n\n==== Start ssh command output (FAILED) ====\n\n\
                         command=\"{command}\"\n\
                         auth=\"{auth:?}\"\n\
                         ip=\"{ip}\"\n\
                         output=\"{s}\"\n\
                         error=\"{e:?}\"\n\
                         \n==== End ssh command output ====\n\n"
                    );

                    return Err(e);
                }
            }
        };
        thread::sleep(Duration::new((timeout as u64) * (counter as u64), 0));
    }
}

/// A login to a guest, the way the harness drives commands inside it.
#[derive(Clone, Debug)]
pub struct GuestSession {
    pub ip: String,
    pub auth: PasswordAuth,
    pub retries: u8,
    pub timeout: u8,
}

impl GuestSession {
    pub fn new(ip: &str, auth: PasswordAuth) -> Self {
        GuestSession {
            ip: ip.to_owned(),
            auth,
            retries: DEFAULT_SSH_RETRIES,
            timeout: DEFAULT_SSH_TIMEOUT,
        }
    }

    pub fn ssh_command(&self, command: &str) -> Result<String, SshCommandError> {
        ssh_command_ip_with_auth(command, &self.auth, &self.ip, self.retries, self.timeout, None)
    }

    pub fn ssh_command_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, SshCommandError> {
        ssh_command_ip_with_auth(
            command,
            &self.auth,
            &self.ip,
            self.retries,
            self.timeout,
            Some(timeout),
        )
    }

    /// Wait until a trivial command succeeds on the guest.
    pub fn wait_for_login(&self, timeout: Duration) -> Result<bool, SshCommandError> {
        wait_until(timeout, Duration::ZERO, Duration::from_secs(2), || {
            match ssh_command_ip_with_auth("true", &self.auth, &self.ip, 1, 0, Some(Duration::from_secs(10))) {
                Ok(_) => Ok(true),
                Err(e) if e.is_transient() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }
}
