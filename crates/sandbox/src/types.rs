use std::time::Duration;

use serde::Serialize;

/// Exit code reported for a run killed at its deadline (128 + SIGKILL).
pub const TIMEOUT_EXIT_CODE: i64 = 137;

/// Exit code reported when the runtime could not tell us one.
pub const UNKNOWN_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    Failure,
    TimedOut,
}

impl Classification {
    pub fn from_exit_code(code: i64) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Outcome of one program run. A timeout is a result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub classification: Classification,
    pub duration: Duration,
    /// Output past the per-stream capture limit was dropped.
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn timed_out(&self) -> bool {
        self.classification == Classification::TimedOut
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
