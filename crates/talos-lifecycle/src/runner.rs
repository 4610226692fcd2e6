//! Lifecycle script execution.
//!
//! The executor drives phases through a [`ScriptRunner`], which hides how
//! scripts actually run. [`ProcessScriptRunner`] executes them as shell
//! subprocesses with per-phase timeouts; [`InstantScriptRunner`] completes
//! every phase immediately and is used by the integration harness.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;

use talos_core::{LifecyclePhase, RunWith, ScriptSpec};

use crate::error::{LifecycleError, Result};

/// Everything a runner needs to execute one phase.
#[derive(Debug)]
pub struct PhaseContext<'a> {
    /// Component name.
    pub component: &'a str,

    /// The phase being executed.
    pub phase: LifecyclePhase,

    /// The script to run.
    pub script: &'a ScriptSpec,

    /// Environment injected by the engine (auth token, paths), merged over
    /// the script's own environment.
    pub environment: &'a BTreeMap<String, String>,

    /// Identity/limits the service runs with.
    pub run_with: Option<&'a RunWith>,
}

/// Result of a bounded phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The script exited successfully.
    Success,

    /// The script exited with a failure.
    Failed {
        /// Exit code, when the process exited normally.
        exit_code: Option<i32>,
    },

    /// The phase timeout elapsed; the process was killed.
    TimedOut,
}

/// Handle to a spawned long-running service process.
#[derive(Debug)]
pub enum ServiceHandle {
    /// A real child process.
    Process(tokio::process::Child),

    /// A virtual service with no process (instant runner).
    Virtual,
}

/// Executes lifecycle scripts.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Runs a bounded phase (install, startup, shutdown, recover) to
    /// completion.
    async fn run_phase(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutcome>;

    /// Spawns the long-running `run` phase and returns a handle to it.
    async fn spawn_run(&self, ctx: PhaseContext<'_>) -> Result<ServiceHandle>;

    /// Stops a spawned service.
    async fn stop(&self, component: &str, handle: &mut ServiceHandle) -> Result<()>;
}

/// Runs scripts as `sh -c` subprocesses.
#[derive(Debug, Default, Clone)]
pub struct ProcessScriptRunner;

impl ProcessScriptRunner {
    /// Creates a process runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn command(ctx: &PhaseContext<'_>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&ctx.script.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &ctx.script.environment {
            cmd.env(key, value);
        }
        for (key, value) in ctx.environment {
            cmd.env(key, value);
        }

        if let Some(run_with) = ctx.run_with {
            if let Some(user) = &run_with.posix_user {
                // Identity switching is delegated to the script wrapper; the
                // requested user is surfaced in the environment.
                cmd.env("TALOS_RUN_AS", user);
            }
        }
        cmd
    }
}

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run_phase(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutcome> {
        let timeout = ctx.script.timeout;
        tracing::debug!(
            component = %ctx.component,
            phase = %ctx.phase,
            timeout_secs = timeout.as_secs(),
            privileged = ctx.script.requires_privilege,
            "running lifecycle phase"
        );

        let mut child = Self::command(&ctx)
            .spawn()
            .map_err(|e| LifecycleError::Script {
                component: ctx.component.to_string(),
                phase: ctx.phase.to_string(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(PhaseOutcome::Success),
            Ok(Ok(status)) => Ok(PhaseOutcome::Failed {
                exit_code: status.code(),
            }),
            Ok(Err(e)) => Err(LifecycleError::Script {
                component: ctx.component.to_string(),
                phase: ctx.phase.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                let _ = child.kill().await;
                Ok(PhaseOutcome::TimedOut)
            }
        }
    }

    async fn spawn_run(&self, ctx: PhaseContext<'_>) -> Result<ServiceHandle> {
        tracing::debug!(component = %ctx.component, "spawning run phase");
        let child = Self::command(&ctx)
            .spawn()
            .map_err(|e| LifecycleError::Script {
                component: ctx.component.to_string(),
                phase: ctx.phase.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ServiceHandle::Process(child))
    }

    async fn stop(&self, component: &str, handle: &mut ServiceHandle) -> Result<()> {
        if let ServiceHandle::Process(child) = handle {
            tracing::debug!(component = %component, "stopping service process");
            child.kill().await.map_err(|e| LifecycleError::Script {
                component: component.to_string(),
                phase: LifecyclePhase::Shutdown.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// A runner whose phases all complete instantly; test harness only.
#[derive(Debug, Default)]
pub struct InstantScriptRunner {
    failures: std::sync::Mutex<BTreeMap<String, LifecyclePhase>>,
}

impl InstantScriptRunner {
    /// Creates a runner where every phase succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future execution of `phase` for `component` fail.
    pub fn fail_phase(&self, component: &str, phase: LifecyclePhase) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(component.to_string(), phase);
        }
    }

    /// Clears a scripted failure.
    pub fn clear_failure(&self, component: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(component);
        }
    }

    fn should_fail(&self, component: &str, phase: LifecyclePhase) -> bool {
        self.failures
            .lock()
            .map(|failures| failures.get(component) == Some(&phase))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ScriptRunner for InstantScriptRunner {
    async fn run_phase(&self, ctx: PhaseContext<'_>) -> Result<PhaseOutcome> {
        if self.should_fail(ctx.component, ctx.phase) {
            return Ok(PhaseOutcome::Failed { exit_code: Some(1) });
        }
        Ok(PhaseOutcome::Success)
    }

    async fn spawn_run(&self, ctx: PhaseContext<'_>) -> Result<ServiceHandle> {
        if self.should_fail(ctx.component, ctx.phase) {
            return Err(LifecycleError::Script {
                component: ctx.component.to_string(),
                phase: ctx.phase.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(ServiceHandle::Virtual)
    }

    async fn stop(&self, _component: &str, _handle: &mut ServiceHandle) -> Result<()> {
        Ok(())
    }
}
