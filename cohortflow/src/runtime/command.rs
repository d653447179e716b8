use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::artifact::Artifact;
use crate::task::ToolInvocation;

use super::resources::ResourceProfile;
use super::runner::{ExecStatus, ToolExecutor};

/// `EX_TEMPFAIL` from sysexits.h.
pub const EXIT_TEMPFAIL: i32 = 75;

const STDERR_TAIL_LINES: usize = 20;

/// Runs invocations as local child processes.
///
/// Exit codes listed in `transient_exit_codes` are retried under the
/// transient budget. A child killed by `SIGTERM` or `SIGKILL` is treated as
/// preempted. Any other non-zero exit is permanent.
#[derive(Clone, Debug)]
pub struct CommandToolExecutor {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    transient_exit_codes: Vec<i32>,
    set_java_heap: bool,
}

impl Default for CommandToolExecutor {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: Vec::new(),
            transient_exit_codes: vec![EXIT_TEMPFAIL],
            set_java_heap: true,
        }
    }
}

impl CommandToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }

    /// Pass the profile's heap size to the JVM through `JAVA_TOOL_OPTIONS`.
    pub fn with_java_heap(mut self, enabled: bool) -> Self {
        self.set_java_heap = enabled;
        self
    }

    fn command(&self, invocation: &ToolInvocation, profile: &ResourceProfile) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if self.set_java_heap {
            cmd.env("JAVA_TOOL_OPTIONS", format!("-Xmx{}m", profile.java_heap_mb()));
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl ToolExecutor for CommandToolExecutor {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        profile: &ResourceProfile,
        attempt: u32,
    ) -> ExecStatus {
        let missing_inputs: Vec<PathBuf> = invocation
            .inputs
            .iter()
            .flat_map(Artifact::missing_files)
            .collect();
        if !missing_inputs.is_empty() {
            return ExecStatus::PermanentFailure {
                error: format!("missing input files: {missing_inputs:?}"),
            };
        }

        for output in &invocation.outputs {
            if let Some(parent) = output.primary.parent()
                && !parent.as_os_str().is_empty()
                && let Err(err) = tokio::fs::create_dir_all(parent).await
            {
                return ExecStatus::TransientFailure {
                    error: format!("cannot create {}: {err}", parent.display()),
                };
            }
        }

        tracing::debug!(
            task = %invocation.label(),
            attempt,
            program = %invocation.program,
            "spawning tool"
        );

        let output = match self.command(invocation, profile).output().await {
            Ok(output) => output,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ExecStatus::PermanentFailure {
                    error: format!("program `{}` not found", invocation.program),
                };
            }
            Err(err) => {
                return ExecStatus::TransientFailure {
                    error: format!("failed to spawn `{}`: {err}", invocation.program),
                };
            }
        };

        let stderr = stderr_tail(&output.stderr);
        if output.status.success() {
            let produced = invocation
                .outputs
                .iter()
                .filter(|artifact| artifact.missing_files().is_empty())
                .cloned()
                .collect();
            return ExecStatus::Success { produced };
        }

        if let Some(code) = output.status.code() {
            let error = format!("exited with status {code}: {stderr}");
            if self.transient_exit_codes.contains(&code) {
                return ExecStatus::TransientFailure { error };
            }
            return ExecStatus::PermanentFailure { error };
        }

        killed_status(output.status, stderr)
    }
}

#[cfg(unix)]
fn killed_status(status: std::process::ExitStatus, stderr: String) -> ExecStatus {
    use std::os::unix::process::ExitStatusExt;

    const SIGKILL: i32 = 9;
    const SIGTERM: i32 = 15;

    match status.signal() {
        Some(signal @ (SIGKILL | SIGTERM)) => ExecStatus::Preempted {
            error: format!("killed by signal {signal}: {stderr}"),
        },
        Some(signal) => ExecStatus::PermanentFailure {
            error: format!("terminated by signal {signal}: {stderr}"),
        },
        None => ExecStatus::PermanentFailure {
            error: format!("terminated abnormally: {stderr}"),
        },
    }
}

#[cfg(not(unix))]
fn killed_status(_status: std::process::ExitStatus, stderr: String) -> ExecStatus {
    ExecStatus::PermanentFailure {
        error: format!("terminated abnormally: {stderr}"),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
