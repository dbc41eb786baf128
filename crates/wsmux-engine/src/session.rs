//! Registry-internal session bookkeeping.

use std::collections::BTreeSet;

use wsmux_core::session::{SessionId, SessionInfo, SessionKind, SessionSpec, SessionState};

use crate::controller::PtyController;
use crate::pty::{build_child_env, PtyCommand};

/// One registry entry: the [`SessionSpec`] the session was created from,
/// its lifecycle state, and the live controller while a surface is
/// attached.
pub(crate) struct SessionRecord {
    pub id: SessionId,
    pub spec: SessionSpec,
    pub state: SessionState,
    pub ports: BTreeSet<u16>,
    pub controller: Option<PtyController>,
    /// Monotonic creation stamp; removal picks the successor active
    /// session by the highest stamp.
    pub created_seq: u64,
    /// Bumped on every lifecycle transition. A scheduled restart
    /// completion is valid only for the generation it was scheduled
    /// under.
    pub generation: u64,
}

impl SessionRecord {
    pub fn new(id: SessionId, spec: SessionSpec, created_seq: u64) -> Self {
        Self {
            id,
            spec,
            state: SessionState::Idle,
            ports: BTreeSet::new(),
            controller: None,
            created_seq,
            generation: 0,
        }
    }

    /// Shape the exec for this session's category. Setup entries run
    /// their command to completion (`shell -c cmd`); tabs and runners get
    /// an interactive shell and receive commands as typed input.
    pub fn pty_command(&self) -> PtyCommand {
        let one_shot = if self.spec.run_as_command {
            self.spec.initial_command.clone()
        } else {
            None
        };
        PtyCommand {
            shell: self.spec.shell.clone(),
            one_shot,
            working_dir: self.spec.working_dir.clone(),
            env: build_child_env(&self.id),
        }
    }

    /// Apply a child exit: zero maps to `succeeded`, everything else
    /// (nonzero, signal death, unreapable) to `failed`. Ports are cleared
    /// and the controller is torn down.
    pub fn apply_exit(&mut self, code: Option<i32>) {
        if let Some(controller) = self.controller.take() {
            controller.terminate();
        }
        self.state = if code == Some(0) {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        };
        self.ports.clear();
    }

    /// Tear down the controller without touching lifecycle state; used on
    /// removal where the record is about to be dropped anyway.
    pub fn teardown(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.terminate();
        }
    }

    /// Whether this session keeps the port-scan timer alive.
    pub fn is_running_runner(&self) -> bool {
        self.id.kind() == SessionKind::Runner
            && self.state.is_running()
            && self.controller.is_some()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            title: self.spec.title.clone(),
            state: self.state,
            ports: self.ports.clone(),
            pid: self.controller.as_ref().map(|c| c.pid()),
            runner: self.spec.runner,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
