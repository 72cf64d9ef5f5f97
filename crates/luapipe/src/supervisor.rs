//! Worker process lifecycle: spawn, pipes, termination, exit status.
//!
//! [`WorkerSpawner`] is the extension point for spawn strategies. [`CommandSpawner`] runs an
//! external program; `worker::ThreadSpawner` runs the worker loop in-process for tests.

use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};
use crate::value::InstanceId;

/// Interval between exit-status polls while waiting for the worker to die.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a worker may ignore SIGTERM before it is killed outright.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

/// Exit status normalized across platforms and spawn strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub signaled: bool,
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            signaled: false,
            signal: None,
            exit_code: Some(code),
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            signaled: true,
            signal: Some(signal),
            exit_code: None,
        }
    }

    pub fn from_std(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::signaled(signal);
            }
        }
        Self::exited(status.code().unwrap_or(-1))
    }

    /// A shell reports a child killed by signal N as exit code 128+N. Undo that.
    ///
    /// Ambiguous by nature: a worker that exits with 137 on its own reads as SIGKILL.
    pub fn correct_for_shell(self) -> Self {
        match self.exit_code {
            Some(code) if !self.signaled && code >= 128 => Self::signaled(code - 128),
            _ => self,
        }
    }
}

/// Where the worker's stderr goes. The protocol never reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StderrTarget {
    #[default]
    Null,
    Inherit,
    /// Append to a file, creating it if needed.
    AppendFile(PathBuf),
}

impl StderrTarget {
    fn to_stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            Self::Null => Stdio::null(),
            Self::Inherit => Stdio::inherit(),
            Self::AppendFile(path) => OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)?
                .into(),
        })
    }
}

/// What a spawner knows about the interpreter it is spawning for.
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub instance: InstanceId,
}

/// A running worker: two pipe ends and a way to end it.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// The pipe into the worker.
    fn writer(&mut self) -> io::Result<&mut dyn Write>;

    /// The pipe out of the worker.
    fn reader(&mut self) -> io::Result<&mut dyn Read>;

    fn is_running(&mut self) -> bool;

    /// Signal the worker, wait for it to exit, and reap it.
    ///
    /// `None` when the status could not be obtained.
    fn force_kill_and_wait(&mut self) -> Option<ExitStatus>;

    /// Close both pipes and wait for the worker to exit on its own.
    fn close_and_wait(&mut self) -> Option<ExitStatus>;

    /// End the worker without reporting how it went.
    fn terminate(&mut self);
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, ctx: &SpawnContext) -> Result<Box<dyn WorkerProcess>>;
}

#[derive(Debug, Clone)]
enum CommandArg {
    Literal(OsString),
    InstanceId,
}

/// Spawns the worker as an external program with stdin/stdout as the protocol pipes.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<CommandArg>,
    stderr: StderrTarget,
    via_shell: bool,
    kill_grace: Duration,
}

impl CommandSpawner {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            stderr: StderrTarget::default(),
            via_shell: false,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(CommandArg::Literal(arg.as_ref().to_owned()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Pass the interpreter's instance id as the next argument.
    pub fn instance_arg(mut self) -> Self {
        self.args.push(CommandArg::InstanceId);
        self
    }

    pub fn stderr(mut self, target: StderrTarget) -> Self {
        self.stderr = target;
        self
    }

    /// The program is a shell wrapping the worker; exit codes of 128 and above are read
    /// as signal deaths.
    pub fn via_shell(mut self, via_shell: bool) -> Self {
        self.via_shell = via_shell;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn command(&self, ctx: &SpawnContext) -> Command {
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            match arg {
                CommandArg::Literal(arg) => command.arg(arg),
                CommandArg::InstanceId => command.arg(ctx.instance.to_string()),
            };
        }
        command
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, ctx: &SpawnContext) -> Result<Box<dyn WorkerProcess>> {
        let supervisor = Supervisor::start(
            self.command(ctx),
            &self.stderr,
            SupervisorOptions {
                via_shell: self.via_shell,
                kill_grace: self.kill_grace,
            },
        )?;
        Ok(Box::new(supervisor))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub via_shell: bool,
    pub kill_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            via_shell: false,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Owns one OS child process and its pipes.
#[derive(Debug)]
pub struct Supervisor {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    options: SupervisorOptions,
    status: Option<ExitStatus>,
}

impl Supervisor {
    pub fn start(
        mut command: Command,
        stderr: &StderrTarget,
        options: SupervisorOptions,
    ) -> Result<Self> {
        let stderr = stderr
            .to_stdio()
            .map_err(|e| BridgeError::SpawnFailed(Some(format!("cannot open stderr sink: {e}"))))?;

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::Unsupported => BridgeError::SpawnUnavailable,
                _ => BridgeError::SpawnFailed(Some(e.to_string())),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::SpawnFailed(None));
        };

        tracing::debug!(pid = child.id(), program = ?command.get_program(), "Spawned worker");
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            options,
            status: None,
        })
    }

    fn close_pipes(&mut self) {
        self.stdin = None;
        self.stdout = None;
    }

    #[cfg(unix)]
    fn send_term(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.child.id()) else {
            let _ = self.child.kill();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            tracing::debug!(pid = raw, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn send_term(&mut self) {
        let _ = self.child.kill();
    }

    /// Poll until the child has exited, killing it once the grace period runs out.
    fn wait_polling(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.status {
            return Some(status);
        }

        let pid = self.child.id();
        let started = Instant::now();
        let mut killed = false;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    let mut status = ExitStatus::from_std(status);
                    if self.options.via_shell {
                        status = status.correct_for_shell();
                    }
                    tracing::debug!(pid, ?status, "Worker exited");
                    self.status = Some(status);
                    return Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Lost track of worker status");
                    return None;
                }
            }

            if !killed && started.elapsed() >= self.options.kill_grace {
                tracing::warn!(pid, "Worker still running after grace period, killing");
                let _ = self.child.kill();
                killed = true;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl WorkerProcess for Supervisor {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn writer(&mut self) -> io::Result<&mut dyn Write> {
        match self.stdin.as_mut() {
            Some(stdin) => Ok(stdin),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed")),
        }
    }

    fn reader(&mut self) -> io::Result<&mut dyn Read> {
        match self.stdout.as_mut() {
            Some(stdout) => Ok(stdout),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker stdout is closed")),
        }
    }

    fn is_running(&mut self) -> bool {
        self.status.is_none() && matches!(self.child.try_wait(), Ok(None))
    }

    fn force_kill_and_wait(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            self.send_term();
        }
        let status = self.wait_polling();
        self.close_pipes();
        status
    }

    fn close_and_wait(&mut self) -> Option<ExitStatus> {
        self.close_pipes();
        self.wait_polling()
    }

    fn terminate(&mut self) {
        if self.status.is_none() {
            self.force_kill_and_wait();
        }
        self.close_pipes();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_correction_maps_high_codes_to_signals() {
        assert_eq!(ExitStatus::exited(137).correct_for_shell(), ExitStatus::signaled(9));
        assert_eq!(ExitStatus::exited(128).correct_for_shell(), ExitStatus::signaled(0));
        assert_eq!(ExitStatus::exited(127).correct_for_shell(), ExitStatus::exited(127));
        assert_eq!(ExitStatus::signaled(15).correct_for_shell(), ExitStatus::signaled(15));
    }

    #[test]
    fn builder_substitutes_instance_id() {
        let spawner = CommandSpawner::new("lua")
            .arg("mw_main.lua")
            .args(["/srv/lua"])
            .instance_arg()
            .arg("8");
        let command = spawner.command(&SpawnContext {
            instance: InstanceId::new(42),
        });
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["mw_main.lua", "/srv/lua", "42", "8"]);
        assert_eq!(command.get_program(), "lua");
    }

    #[test]
    fn defaults() {
        let spawner = CommandSpawner::new("lua");
        assert_eq!(spawner.stderr, StderrTarget::Null);
        assert!(!spawner.via_shell);
        assert_eq!(spawner.kill_grace, DEFAULT_KILL_GRACE);
    }

    #[cfg(unix)]
    #[test]
    fn std_status_signal_is_preserved() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(9);
        assert_eq!(ExitStatus::from_std(status), ExitStatus::signaled(9));
        let status = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(ExitStatus::from_std(status), ExitStatus::exited(3));
    }

    #[cfg(unix)]
    #[test]
    fn force_kill_reports_sigterm() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut supervisor =
            Supervisor::start(command, &StderrTarget::Null, SupervisorOptions::default()).unwrap();
        assert!(supervisor.is_running());
        assert_eq!(supervisor.force_kill_and_wait(), Some(ExitStatus::signaled(15)));
        assert!(!supervisor.is_running());
        assert!(supervisor.writer().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_is_escalated_after_grace() {
        let mut command = Command::new("sh");
        command.args(["-c", "trap '' TERM; while :; do sleep 1; done"]);
        let options = SupervisorOptions {
            via_shell: false,
            kill_grace: Duration::from_millis(200),
        };
        let mut supervisor = Supervisor::start(command, &StderrTarget::Null, options).unwrap();
        // Let the shell install its trap before signalling.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(supervisor.force_kill_and_wait(), Some(ExitStatus::signaled(9)));
    }

    #[test]
    fn missing_program_is_spawn_failed() {
        let err = Supervisor::start(
            Command::new("/nonexistent/luapipe-worker"),
            &StderrTarget::Null,
            SupervisorOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::SpawnFailed(Some(_))), "{err:?}");
    }
}
