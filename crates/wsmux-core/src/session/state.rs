//! Session lifecycle state and descriptor types.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Session lifecycle state.
///
/// `idle` covers both "created but deferred" and "runner stopped after
/// interrupt"; in both cases the shell may be alive but no command is
/// executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not yet executing its command.
    Idle,
    /// Process started (for runners: command issued).
    Running,
    /// Exited with code 0.
    Succeeded,
    /// Nonzero or abnormal exit.
    Failed,
}

impl SessionState {
    /// Check if the session is currently executing.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Check if the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Runner-specific metadata.
///
/// Advisory only: the expected port is a hint for the UI while discovery is
/// pending, and the display order sorts runner lists. Neither affects
/// lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerMeta {
    /// Port the runner is expected to bind, if known ahead of time.
    pub port_hint: Option<u16>,
    /// Sort weight for display; lower appears first.
    pub display_order: i32,
}

/// What a session should execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Display title.
    pub title: String,
    /// Working directory for the child process.
    pub working_dir: PathBuf,
    /// Shell or executable path. `None` resolves to `$SHELL` then `/bin/sh`
    /// at spawn time.
    pub shell: Option<String>,
    /// Command issued to the session once it is running.
    pub initial_command: Option<String>,
    /// Run `shell -c command` to completion instead of an interactive shell.
    pub run_as_command: bool,
    /// Stay `idle` after attach until explicitly started.
    pub deferred: bool,
    /// Present only for runner sessions.
    pub runner: Option<RunnerMeta>,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            title: String::new(),
            working_dir: PathBuf::from("."),
            shell: None,
            initial_command: None,
            run_as_command: false,
            deferred: false,
            runner: None,
        }
    }
}

/// Point-in-time snapshot of a session, safe to hand to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identity.
    pub id: SessionId,
    /// Display title.
    pub title: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Listening ports discovered in the session's process tree.
    pub ports: BTreeSet<u16>,
    /// Root child pid while a process is attached.
    pub pid: Option<i32>,
    /// Runner metadata, if this is a runner session.
    pub runner: Option<RunnerMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_helpers() {
        assert!(SessionState::Running.is_running());
        assert!(!SessionState::Idle.is_running());
        assert!(!SessionState::Succeeded.is_running());

        assert!(SessionState::Succeeded.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }

    #[test]
    fn state_display_matches_serde() {
        for state in [
            SessionState::Idle,
            SessionState::Running,
            SessionState::Succeeded,
            SessionState::Failed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }

    #[test]
    fn spec_default_is_interactive() {
        let spec = SessionSpec::default();
        assert!(!spec.run_as_command);
        assert!(!spec.deferred);
        assert!(spec.shell.is_none());
        assert!(spec.runner.is_none());
    }

    #[test]
    fn info_serde_round_trip() {
        let info = SessionInfo {
            id: SessionId::runner("ws", "dev"),
            title: "dev server".into(),
            state: SessionState::Running,
            ports: BTreeSet::from([5173]),
            pid: Some(4242),
            runner: Some(RunnerMeta {
                port_hint: Some(5173),
                display_order: 1,
            }),
        };

        let json = serde_json::to_string(&info).unwrap();
        let back: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
