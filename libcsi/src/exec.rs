//! Local command execution.
//!
//! The iSCSI session manager and the Linux mounter drive external tools
//! (`iscsiadm`, `mount`, `mkfs.*`, ...).  They never spawn processes directly;
//! instead they go through an [`Executor`] so tests can script the outcome of
//! each invocation with a [`FakeExecutor`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound for a single external command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit status and combined stdout/stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// stdout followed by stderr, lossily decoded.
    pub output: String,
}

impl Output {
    /// A successful run with the given output.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    /// A failed run with the given exit code and output.
    pub fn failure(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to start [{command}]: {err}")]
    Start {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("[{command}] did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("[{command}] exited with code {}: {output}", display_code(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_owned())
}

impl ExecutionError {
    /// Exit code of a command that ran to completion and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

/// Renders a command line for logs and error messages, masking credentials.
pub fn command_to_string(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_owned());
    parts.extend(args.iter().map(|arg| redact(arg)));
    parts.join(" ")
}

fn redact(arg: &str) -> String {
    if !arg.contains("password=") {
        return arg.to_owned();
    }
    arg.split(',')
        .map(|opt| {
            if opt.starts_with("password=") {
                "password=***"
            } else {
                opt
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Runs external commands and reports their outcome.
///
/// - In production this is a [`HostExecutor`].
/// - Under test a [`FakeExecutor`] returns scripted results.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `program` with `args` to completion.  A non-zero exit is returned
    /// as [`ExecutionError::Failed`] carrying the combined output.
    async fn execute(&self, program: &str, args: &[&str]) -> Result<Output, ExecutionError>;
}

pub type BoxedExecutor = Arc<dyn Executor>;

/// Executes commands on the host with a bounded timeout.
pub struct HostExecutor {
    timeout: Duration,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(COMMAND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let command = command_to_string(program, args);
        debug!(id, %command, "running command");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(ExecutionError::Start { command, err }),
            Err(_) => {
                warn!(id, %command, timeout = ?self.timeout, "command timed out");
                return Err(ExecutionError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let output = Output {
            code: output.status.code(),
            output: combined,
        };
        debug!(id, code = ?output.code, output = %output.output.trim(), "command finished");

        if !output.is_success() {
            return Err(ExecutionError::Failed {
                command,
                code: output.code,
                output: output.output.trim().to_owned(),
            });
        }
        Ok(output)
    }
}

/// Handler deciding the outcome of a faked command.
pub type FakeHandler = Box<dyn Fn(&str, &[&str]) -> Output + Send + Sync>;

/// An executor which records every invocation and answers from a handler.
pub struct FakeExecutor {
    handler: Mutex<FakeHandler>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeExecutor {
    /// A fake where every command succeeds with empty output.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(|_, _| Output::success(""))),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Replace the handler used for subsequent commands.
    pub fn set_handler(&self, handler: FakeHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    /// Every command run so far, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Commands run so far, rendered as single strings.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.join(" ")).collect()
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<Output, ExecutionError> {
        let mut call = vec![program.to_owned()];
        call.extend(args.iter().map(|a| (*a).to_owned()));
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);

        let output = {
            let handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());
            (*handler)(program, args)
        };
        if !output.is_success() {
            return Err(ExecutionError::Failed {
                command: command_to_string(program, args),
                code: output.code,
                output: output.output.trim().to_owned(),
            });
        }
        Ok(output)
    }
}
