//! Bounded recovery: actions that try to bring a service back, and the
//! per-component state machine that decides when another attempt is
//! allowed.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// A corrective action for one unhealthy component.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn describe(&self) -> String;

    async fn recover(&self) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn RecoveryAction) {}
};

/// Spawn a start command (e.g. `ollama serve`) and give it `settle` to
/// come up. The child is left running.
#[derive(Debug, Clone)]
pub struct CommandRecovery {
    command: String,
    args: Vec<String>,
    settle: Duration,
}

impl CommandRecovery {
    pub fn new(command: impl Into<String>, args: Vec<String>, settle: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            settle,
        }
    }
}

#[async_trait]
impl RecoveryAction for CommandRecovery {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            format!("run {}", self.command)
        } else {
            format!("run {} {}", self.command, self.args.join(" "))
        }
    }

    async fn recover(&self) -> Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command))?;

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .with_context(|| format!("failed to wait for {}", self.command))?;
                if !status.success() {
                    bail!("{} exited with {}", self.command, status);
                }
            }
            _ = tokio::time::sleep(self.settle) => {}
        }
        Ok(())
    }
}

/// Where a component's recovery stands at a given cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// An attempt may run this cycle.
    Ready,
    /// Waiting until `next_cycle` after a failed attempt.
    BackingOff { next_cycle: u64 },
    /// `max_attempts` consecutive attempts failed.
    GaveUp,
}

/// Consecutive-failure counter with exponential backoff across cycles.
///
/// After the n-th consecutive failure at cycle `c` the next attempt is
/// allowed at `c + 2^(n-1)`. A healthy observation resets everything.
#[derive(Debug, Clone)]
pub struct RecoveryTracker {
    max_attempts: u32,
    consecutive_failures: u32,
    next_cycle: u64,
}

impl RecoveryTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            consecutive_failures: 0,
            next_cycle: 0,
        }
    }

    pub fn state(&self, cycle: u64) -> RecoveryState {
        if self.consecutive_failures >= self.max_attempts {
            RecoveryState::GaveUp
        } else if cycle < self.next_cycle {
            RecoveryState::BackingOff {
                next_cycle: self.next_cycle,
            }
        } else {
            RecoveryState::Ready
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_failure(&mut self, cycle: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let exponent = self.consecutive_failures.saturating_sub(1).min(32);
        self.next_cycle = cycle.saturating_add(1u64 << exponent);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_cycle = 0;
    }
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECOVERY_ATTEMPTS)
    }
}
