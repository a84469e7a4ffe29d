use serde::Serialize;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    Normal,
    SegmentationFault,
    BoundsError,
    UnalignedAccess,
    StackOverflow,
    Other,
}

impl TerminationReason {
    pub fn is_abnormal(self) -> bool {
        self != TerminationReason::Normal
    }

    pub fn describe(self) -> &'static str {
        match self {
            TerminationReason::Normal => "normal",
            TerminationReason::SegmentationFault => "access violation",
            TerminationReason::BoundsError => "array bounds exceeded",
            TerminationReason::UnalignedAccess => "misaligned data access",
            TerminationReason::StackOverflow => "stack overflow",
            TerminationReason::Other => "unknown",
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("no target command configured")]
    NoCommand,
    #[error("failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        source: std::io::Error,
    },
    #[error("error waiting for target: {0}")]
    Wait(std::io::Error),
    #[error("failed to kill target: {0}")]
    Kill(std::io::Error),
}

/// Launches and controls the process under test.
pub trait ApplicationExecuter {
    /// Starts a new instance. A still-running previous instance is killed
    /// first.
    fn launch(&mut self) -> Result<(), ExecutorError>;

    /// Kills the target if it is still running.
    fn terminate(&mut self) -> Result<(), ExecutorError>;

    /// Waits for the target to exit, forever when `timeout` is `None`.
    ///
    /// # Returns
    /// `true` if the target has exited.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, ExecutorError>;

    fn is_alive(&mut self) -> bool;

    /// Exit code and classification of the last run, once it has exited.
    fn status_code(&self) -> Option<(i32, TerminationReason)>;

    /// Extra arguments appended to the configured command, split on
    /// whitespace.
    fn set_command_line(&mut self, arguments: &str);
}

pub struct ProcessExecuterConfig {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// `ApplicationExecuter` over `std::process`.
pub struct ProcessExecuter {
    config: ProcessExecuterConfig,
    arguments: Vec<String>,
    child: Option<Child>,
    status: Option<ExitStatus>,
    killed_by_us: bool,
}

impl ProcessExecuter {
    pub fn new(config: ProcessExecuterConfig) -> Self {
        Self {
            config,
            arguments: Vec::new(),
            child: None,
            status: None,
            killed_by_us: false,
        }
    }

    pub fn command(&self) -> &[String] {
        &self.config.command
    }

    /// Polls the child once, recording its exit status.
    fn poll(&mut self) -> Result<bool, ExecutorError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(true);
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "target exited");
                self.status = Some(status);
                self.child = None;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(ExecutorError::Wait(e)),
        }
    }
}

impl ApplicationExecuter for ProcessExecuter {
    fn launch(&mut self) -> Result<(), ExecutorError> {
        if self.child.is_some() {
            self.terminate()?;
            self.wait(None)?;
        }

        let (program, fixed_args) = self
            .config
            .command
            .split_first()
            .ok_or(ExecutorError::NoCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(fixed_args).args(&self.arguments);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;
        debug!(pid = child.id(), "target launched");
        self.child = Some(child);
        self.status = None;
        self.killed_by_us = false;
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), ExecutorError> {
        if self.poll()? {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                warn!("Failed to kill target: {e}");
                return Err(ExecutorError::Kill(e));
            }
            self.killed_by_us = true;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, ExecutorError> {
        let start_time = Instant::now();
        loop {
            if self.poll()? {
                return Ok(true);
            }
            if let Some(timeout) = timeout {
                if start_time.elapsed() >= timeout {
                    return Ok(false);
                }
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.poll(), Ok(false))
    }

    fn status_code(&self) -> Option<(i32, TerminationReason)> {
        let status = self.status?;
        Some(classify(status, self.killed_by_us))
    }

    fn set_command_line(&mut self, arguments: &str) {
        self.arguments = arguments.split_whitespace().map(str::to_string).collect();
    }
}

impl Drop for ProcessExecuter {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Exit code (128 + signal for signalled processes) and reason. A kill the
/// controller asked for is a normal end of the run.
fn classify(status: ExitStatus, killed_by_us: bool) -> (i32, TerminationReason) {
    if let Some(code) = status.code() {
        return (code, TerminationReason::Normal);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let reason = if killed_by_us {
                TerminationReason::Normal
            } else {
                signal_reason(signal)
            };
            return (128 + signal, reason);
        }
    }

    let reason = if killed_by_us {
        TerminationReason::Normal
    } else {
        TerminationReason::Other
    };
    (-1, reason)
}

#[cfg(unix)]
fn signal_reason(signal: i32) -> TerminationReason {
    const SIGSEGV: i32 = 11;
    const SIGBUS: i32 = if cfg!(target_os = "linux") { 7 } else { 10 };
    match signal {
        SIGSEGV => TerminationReason::SegmentationFault,
        SIGBUS => TerminationReason::UnalignedAccess,
        _ => TerminationReason::Other,
    }
}
