//! Session registry: the single owner of all session state.
//!
//! Every mutation, from creation through exit handling to removal, runs
//! on one task that owns the session map outright; public operations are
//! marshaled onto it as commands with oneshot replies. PTY I/O stays on
//! the per-session controller tasks and re-enters the registry only as
//! messages (exit events, scan results), so no session state is ever
//! touched from two tasks at once.
//!
//! Observers get a broadcast stream of coarse events plus a watch counter
//! that ticks whenever any runner's listening ports change; both are
//! hints to re-query, not sources of truth.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use wsmux_core::constants::{EVENT_CHANNEL_CAPACITY, PORT_SCAN_INTERVAL, RESTART_SETTLE_DELAY};
use wsmux_core::error::{Error, Result};
use wsmux_core::keyproto::KeyEvent;
use wsmux_core::session::{
    RunnerMeta, SessionId, SessionInfo, SessionKind, SessionSpec, SessionState,
};

use crate::controller::{ExitEvent, PtyController};
use crate::ports;
use crate::session::SessionRecord;

/// Coarse registry change notifications. Lagging subscribers lose the
/// oldest events; re-query the registry for current state.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created { id: SessionId },
    StateChanged { id: SessionId, state: SessionState },
    PortsChanged { id: SessionId, ports: BTreeSet<u16> },
    Removed { id: SessionId },
}

/// Creation parameters for a runner session.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Stable name; the session id is `runner:<workspace>:<name>`.
    pub name: String,
    pub title: String,
    pub working_dir: PathBuf,
    /// Command issued to the runner's shell when it starts.
    pub initial_command: String,
    /// Deferred runners stay `idle` after attach until started explicitly.
    pub defer: bool,
    pub meta: RunnerMeta,
}

enum RegistryCommand {
    CreateTab {
        workspace: String,
        working_dir: PathBuf,
        initial_command: Option<String>,
        reply: oneshot::Sender<SessionInfo>,
    },
    CreateRunner {
        workspace: String,
        config: RunnerConfig,
        reply: oneshot::Sender<SessionInfo>,
    },
    CreateSetupSessions {
        workspace: String,
        working_dir: PathBuf,
        commands: Vec<String>,
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Attach {
        id: SessionId,
        cols: u16,
        rows: u16,
        reply: oneshot::Sender<Result<mpsc::Receiver<Bytes>>>,
    },
    Start {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    FinishRestart {
        id: SessionId,
        generation: u64,
    },
    ProcessExited {
        id: SessionId,
        code: Option<i32>,
        reply: oneshot::Sender<()>,
    },
    RemoveTab {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveWorkspaceKind {
        workspace: String,
        kind: SessionKind,
        reply: oneshot::Sender<()>,
    },
    RemoveAll {
        reply: oneshot::Sender<()>,
    },
    Write {
        id: SessionId,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    SendKey {
        id: SessionId,
        event: KeyEvent,
        reply: oneshot::Sender<Result<bool>>,
    },
    Resize {
        id: SessionId,
        cols: u16,
        rows: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    GetSession {
        id: SessionId,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    ActiveSession {
        workspace: String,
        kind: SessionKind,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    ScanTick,
    ScanResult {
        id: SessionId,
        pid: i32,
        ports: BTreeSet<u16>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Spawns the registry task.
pub struct SessionRegistry;

impl SessionRegistry {
    pub fn spawn() -> RegistryHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (epoch_tx, epoch_rx) = watch::channel(0u64);

        let registry = Registry {
            records: HashMap::new(),
            workspaces: HashMap::new(),
            next_seq: 0,
            cmd_tx: cmd_tx.clone(),
            exit_tx,
            events: events.clone(),
            epoch_tx,
            scan_task: None,
        };
        tokio::spawn(registry.run(cmd_rx, exit_rx));

        RegistryHandle {
            cmd_tx,
            events,
            port_epoch: epoch_rx,
        }
    }
}

/// Clonable handle to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    cmd_tx: mpsc::UnboundedSender<RegistryCommand>,
    events: broadcast::Sender<SessionEvent>,
    port_epoch: watch::Receiver<u64>,
}

impl RegistryHandle {
    /// Create a tab session with the next sequential index for the
    /// workspace and select it as the workspace's active tab.
    pub async fn create_tab(
        &self,
        workspace: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        initial_command: Option<String>,
    ) -> Result<SessionInfo> {
        let workspace = workspace.into();
        let working_dir = working_dir.into();
        self.request(|reply| RegistryCommand::CreateTab {
            workspace,
            working_dir,
            initial_command,
            reply,
        })
        .await
    }

    /// Create a runner session, or return the existing one when the id is
    /// already registered.
    pub async fn create_runner(
        &self,
        workspace: impl Into<String>,
        config: RunnerConfig,
    ) -> Result<SessionInfo> {
        let workspace = workspace.into();
        self.request(|reply| RegistryCommand::CreateRunner {
            workspace,
            config,
            reply,
        })
        .await
    }

    /// Create one run-to-completion session per command, selecting the
    /// first as the workspace's active setup session.
    pub async fn create_setup_sessions(
        &self,
        workspace: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        commands: Vec<String>,
    ) -> Result<Vec<SessionInfo>> {
        let workspace = workspace.into();
        let working_dir = working_dir.into();
        self.request(|reply| RegistryCommand::CreateSetupSessions {
            workspace,
            working_dir,
            commands,
            reply,
        })
        .await
    }

    /// Spawn the session's process on a PTY sized `cols`×`rows` and
    /// return its output stream. The stream ends when the process does.
    pub async fn attach(
        &self,
        id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Attach {
            id,
            cols,
            rows,
            reply,
        })
        .await?
    }

    /// Issue a deferred runner's command. Valid only on an idle, deferred
    /// session with an attached surface.
    pub async fn start(&self, id: &SessionId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Start { id, reply }).await?
    }

    /// Interrupt a runner's foreground process and mark it not-running.
    pub async fn stop(&self, id: &SessionId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Stop { id, reply }).await?
    }

    /// Interrupt a runner, wait for its shell to settle, then re-issue
    /// its command.
    pub async fn restart(&self, id: &SessionId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Restart { id, reply }).await?
    }

    /// Record an externally observed child exit. Unknown ids are ignored.
    pub async fn process_exit(&self, id: &SessionId, code: Option<i32>) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::ProcessExited { id, code, reply })
            .await
    }

    /// Terminate and remove a tab, reassigning the workspace's active tab
    /// to the most recently created survivor.
    pub async fn remove_tab(&self, id: &SessionId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::RemoveTab { id, reply }).await?
    }

    /// Terminate and remove every runner session in the workspace.
    pub async fn remove_runner_sessions(&self, workspace: &str) -> Result<()> {
        let workspace = workspace.to_string();
        self.request(|reply| RegistryCommand::RemoveWorkspaceKind {
            workspace,
            kind: SessionKind::Runner,
            reply,
        })
        .await
    }

    /// Terminate and remove every setup session in the workspace.
    pub async fn remove_setup_sessions(&self, workspace: &str) -> Result<()> {
        let workspace = workspace.to_string();
        self.request(|reply| RegistryCommand::RemoveWorkspaceKind {
            workspace,
            kind: SessionKind::Setup,
            reply,
        })
        .await
    }

    /// Terminate and remove everything.
    pub async fn remove_all(&self) -> Result<()> {
        self.request(|reply| RegistryCommand::RemoveAll { reply }).await
    }

    /// Forward raw bytes to the session's stdin.
    pub async fn write(&self, id: &SessionId, data: Bytes) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Write { id, data, reply }).await?
    }

    /// Deliver a key event through the protocol-aware encoder. `Ok(false)`
    /// means the caller should deliver the key through the legacy path.
    pub async fn send_key(&self, id: &SessionId, event: KeyEvent) -> Result<bool> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::SendKey { id, event, reply }).await?
    }

    /// Resize the session's PTY. A no-op before attach.
    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::Resize {
            id,
            cols,
            rows,
            reply,
        })
        .await?
    }

    /// Snapshot of one session.
    pub async fn session(&self, id: &SessionId) -> Result<Option<SessionInfo>> {
        let id = id.clone();
        self.request(|reply| RegistryCommand::GetSession { id, reply }).await
    }

    /// Snapshot of every session, in creation order.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.request(|reply| RegistryCommand::ListSessions { reply }).await
    }

    /// The workspace's active session of the given category, if any.
    pub async fn active_session(
        &self,
        workspace: &str,
        kind: SessionKind,
    ) -> Result<Option<SessionId>> {
        let workspace = workspace.to_string();
        self.request(|reply| RegistryCommand::ActiveSession {
            workspace,
            kind,
            reply,
        })
        .await
    }

    /// Terminate all sessions and stop the registry task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| RegistryCommand::Shutdown { reply }).await
    }

    /// Subscribe to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch the port-change counter; it increments whenever any runner's
    /// listening-port set changes.
    pub fn port_epoch(&self) -> watch::Receiver<u64> {
        self.port_epoch.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(make(reply_tx)).map_err(|_| registry_gone())?;
        reply_rx.await.map_err(|_| registry_gone())
    }
}

fn registry_gone() -> Error {
    Error::Channel {
        message: "session registry task stopped".to_string(),
    }
}

#[derive(Default)]
struct WorkspaceState {
    active_tab: Option<SessionId>,
    active_runner: Option<SessionId>,
    active_setup: Option<SessionId>,
    next_tab_index: u32,
    next_setup_index: u32,
}

struct Registry {
    records: HashMap<SessionId, SessionRecord>,
    workspaces: HashMap<String, WorkspaceState>,
    next_seq: u64,
    cmd_tx: mpsc::UnboundedSender<RegistryCommand>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    events: broadcast::Sender<SessionEvent>,
    epoch_tx: watch::Sender<u64>,
    scan_task: Option<JoinHandle<()>>,
}

impl Registry {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<RegistryCommand>,
        mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    ) {
        debug!("session registry task started");
        loop {
            tokio::select! {
                Some(command) = cmd_rx.recv() => {
                    if self.handle_command(command) {
                        break;
                    }
                }
                Some(exit) = exit_rx.recv() => {
                    self.handle_process_exit(exit.id, exit.code);
                }
                else => break,
            }
        }
        self.handle_remove_all();
        debug!("session registry task stopped");
    }

    /// Returns true when the registry should stop.
    fn handle_command(&mut self, command: RegistryCommand) -> bool {
        match command {
            RegistryCommand::CreateTab {
                workspace,
                working_dir,
                initial_command,
                reply,
            } => {
                let info = self.handle_create_tab(workspace, working_dir, initial_command);
                let _ = reply.send(info);
            }
            RegistryCommand::CreateRunner {
                workspace,
                config,
                reply,
            } => {
                let info = self.handle_create_runner(workspace, config);
                let _ = reply.send(info);
            }
            RegistryCommand::CreateSetupSessions {
                workspace,
                working_dir,
                commands,
                reply,
            } => {
                let infos = self.handle_create_setup_sessions(workspace, working_dir, commands);
                let _ = reply.send(infos);
            }
            RegistryCommand::Attach {
                id,
                cols,
                rows,
                reply,
            } => {
                let _ = reply.send(self.handle_attach(id, cols, rows));
            }
            RegistryCommand::Start { id, reply } => {
                let _ = reply.send(self.handle_start(&id));
            }
            RegistryCommand::Stop { id, reply } => {
                let _ = reply.send(self.handle_stop(&id));
            }
            RegistryCommand::Restart { id, reply } => {
                let _ = reply.send(self.handle_restart(&id));
            }
            RegistryCommand::FinishRestart { id, generation } => {
                self.handle_finish_restart(id, generation);
            }
            RegistryCommand::ProcessExited { id, code, reply } => {
                self.handle_process_exit(id, code);
                let _ = reply.send(());
            }
            RegistryCommand::RemoveTab { id, reply } => {
                let _ = reply.send(self.handle_remove_tab(&id));
            }
            RegistryCommand::RemoveWorkspaceKind {
                workspace,
                kind,
                reply,
            } => {
                self.handle_remove_workspace_kind(&workspace, kind);
                let _ = reply.send(());
            }
            RegistryCommand::RemoveAll { reply } => {
                self.handle_remove_all();
                let _ = reply.send(());
            }
            RegistryCommand::Write { id, data, reply } => {
                let _ = reply.send(self.handle_write(&id, data));
            }
            RegistryCommand::SendKey { id, event, reply } => {
                let _ = reply.send(self.handle_send_key(&id, event));
            }
            RegistryCommand::Resize {
                id,
                cols,
                rows,
                reply,
            } => {
                let _ = reply.send(self.handle_resize(&id, cols, rows));
            }
            RegistryCommand::GetSession { id, reply } => {
                let _ = reply.send(self.records.get(&id).map(SessionRecord::info));
            }
            RegistryCommand::ListSessions { reply } => {
                let _ = reply.send(self.list_sessions());
            }
            RegistryCommand::ActiveSession {
                workspace,
                kind,
                reply,
            } => {
                let _ = reply.send(self.active_session(&workspace, kind));
            }
            RegistryCommand::ScanTick => self.handle_scan_tick(),
            RegistryCommand::ScanResult { id, pid, ports } => {
                self.handle_scan_result(id, pid, ports);
            }
            RegistryCommand::Shutdown { reply } => {
                info!("session registry shutting down");
                self.handle_remove_all();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn handle_create_tab(
        &mut self,
        workspace: String,
        working_dir: PathBuf,
        initial_command: Option<String>,
    ) -> SessionInfo {
        let (id, spec) = {
            let ws = self.workspaces.entry(workspace.clone()).or_default();
            ws.next_tab_index += 1;
            let index = ws.next_tab_index;
            let id = SessionId::tab(workspace, index);
            ws.active_tab = Some(id.clone());
            let spec = SessionSpec {
                title: format!("Tab {}", index),
                working_dir,
                initial_command,
                ..SessionSpec::default()
            };
            (id, spec)
        };
        self.insert(id, spec)
    }

    fn handle_create_runner(&mut self, workspace: String, config: RunnerConfig) -> SessionInfo {
        let id = SessionId::runner(workspace.clone(), config.name.clone());
        if let Some(existing) = self.records.get(&id) {
            trace!(session = %id, "create_runner on existing id");
            return existing.info();
        }

        let spec = SessionSpec {
            title: config.title,
            working_dir: config.working_dir,
            initial_command: Some(config.initial_command),
            deferred: config.defer,
            runner: Some(config.meta),
            ..SessionSpec::default()
        };

        if !config.defer {
            let ws = self.workspaces.entry(workspace).or_default();
            if ws.active_runner.is_none() {
                ws.active_runner = Some(id.clone());
            }
        }
        self.insert(id, spec)
    }

    fn handle_create_setup_sessions(
        &mut self,
        workspace: String,
        working_dir: PathBuf,
        commands: Vec<String>,
    ) -> Vec<SessionInfo> {
        let mut infos = Vec::with_capacity(commands.len());
        let mut first: Option<SessionId> = None;

        for command in commands {
            let (id, spec) = {
                let ws = self.workspaces.entry(workspace.clone()).or_default();
                ws.next_setup_index += 1;
                let index = ws.next_setup_index;
                let id = SessionId::setup(workspace.clone(), index);
                let spec = SessionSpec {
                    title: command.clone(),
                    working_dir: working_dir.clone(),
                    initial_command: Some(command),
                    run_as_command: true,
                    ..SessionSpec::default()
                };
                (id, spec)
            };
            first.get_or_insert_with(|| id.clone());
            infos.push(self.insert(id, spec));
        }

        if let Some(first) = first {
            let ws = self.workspaces.entry(workspace).or_default();
            ws.active_setup = Some(first);
        }
        infos
    }

    fn insert(&mut self, id: SessionId, spec: SessionSpec) -> SessionInfo {
        self.next_seq += 1;
        let record = SessionRecord::new(id.clone(), spec, self.next_seq);
        let info = record.info();
        info!(session = %id, title = %info.title, "session created");
        self.records.insert(id.clone(), record);
        let _ = self.events.send(SessionEvent::Created { id });
        info
    }

    fn handle_attach(
        &mut self,
        id: SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let exit_tx = self.exit_tx.clone();
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        if record.state.is_terminal() {
            return Err(Error::InvalidState {
                expected: "idle or running".to_string(),
                actual: record.state.to_string(),
            });
        }
        if record.controller.is_some() {
            return Err(Error::InvalidState {
                expected: "detached".to_string(),
                actual: "attached".to_string(),
            });
        }

        let (controller, output) =
            PtyController::spawn(id.clone(), &record.pty_command(), cols, rows, exit_tx)?;

        // Setup sessions exec their command directly; interactive ones
        // with a non-deferred command get it typed in now. Deferred
        // runners wait for start().
        let state = if record.spec.run_as_command || !record.spec.deferred {
            if !record.spec.run_as_command {
                if let Some(cmd) = &record.spec.initial_command {
                    controller.write(command_line(cmd))?;
                }
            }
            SessionState::Running
        } else {
            SessionState::Idle
        };

        record.controller = Some(controller);
        record.state = state;
        record.generation += 1;

        debug!(session = %id, cols, rows, state = %state, "session attached");
        if state != SessionState::Idle {
            let _ = self.events.send(SessionEvent::StateChanged { id, state });
        }
        self.update_scan_timer();
        Ok(output)
    }

    fn handle_start(&mut self, id: &SessionId) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        if !record.spec.deferred {
            return Err(Error::InvalidState {
                expected: "deferred".to_string(),
                actual: "immediate".to_string(),
            });
        }
        let controller = attached(record)?;
        if record.state != SessionState::Idle {
            return Err(Error::InvalidState {
                expected: "idle".to_string(),
                actual: record.state.to_string(),
            });
        }
        if let Some(cmd) = &record.spec.initial_command {
            controller.write(command_line(cmd))?;
        }
        record.state = SessionState::Running;
        record.generation += 1;

        info!(session = %id, "runner started");
        let _ = self.events.send(SessionEvent::StateChanged {
            id: id.clone(),
            state: SessionState::Running,
        });
        self.update_scan_timer();
        Ok(())
    }

    fn handle_stop(&mut self, id: &SessionId) -> Result<()> {
        let record = self.runner_record(id)?;
        attached(record)?.interrupt()?;
        record.state = SessionState::Idle;
        record.generation += 1;
        let had_ports = !record.ports.is_empty();
        record.ports.clear();

        info!(session = %id, "runner stopped");
        let _ = self.events.send(SessionEvent::StateChanged {
            id: id.clone(),
            state: SessionState::Idle,
        });
        if had_ports {
            self.publish_ports(id.clone(), BTreeSet::new());
        }
        self.update_scan_timer();
        Ok(())
    }

    fn handle_restart(&mut self, id: &SessionId) -> Result<()> {
        let record = self.runner_record(id)?;
        attached(record)?.interrupt()?;
        record.state = SessionState::Idle;
        record.generation += 1;
        let generation = record.generation;
        let had_ports = !record.ports.is_empty();
        record.ports.clear();

        info!(session = %id, "runner restarting");
        let _ = self.events.send(SessionEvent::StateChanged {
            id: id.clone(),
            state: SessionState::Idle,
        });
        if had_ports {
            self.publish_ports(id.clone(), BTreeSet::new());
        }
        self.update_scan_timer();

        // Give the shell a beat to return to its prompt before the
        // command is re-issued; the registry loop itself must not sleep.
        let cmd_tx = self.cmd_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_SETTLE_DELAY).await;
            let _ = cmd_tx.send(RegistryCommand::FinishRestart { id, generation });
        });
        Ok(())
    }

    fn handle_finish_restart(&mut self, id: SessionId, generation: u64) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        // A stop, start, exit, or newer restart got here first; the
        // settled restart no longer applies.
        if record.generation != generation {
            return;
        }
        if record.state != SessionState::Idle {
            return;
        }
        let Some(controller) = record.controller.as_ref() else {
            return;
        };
        if let Some(cmd) = &record.spec.initial_command {
            if let Err(e) = controller.write(command_line(cmd)) {
                warn!(session = %id, error = %e, "restart command write failed");
                return;
            }
        }
        record.state = SessionState::Running;
        record.generation += 1;

        info!(session = %id, "runner restarted");
        let _ = self.events.send(SessionEvent::StateChanged {
            id,
            state: SessionState::Running,
        });
        self.update_scan_timer();
    }

    fn handle_process_exit(&mut self, id: SessionId, code: Option<i32>) {
        let Some(record) = self.records.get_mut(&id) else {
            trace!(session = %id, "exit notification for unknown session ignored");
            return;
        };
        if record.state.is_terminal() {
            trace!(session = %id, "duplicate exit notification ignored");
            return;
        }

        let had_ports = !record.ports.is_empty();
        record.apply_exit(code);
        record.generation += 1;
        let state = record.state;

        info!(session = %id, code = ?code, state = %state, "session process exited");
        let _ = self.events.send(SessionEvent::StateChanged {
            id: id.clone(),
            state,
        });
        if had_ports {
            self.publish_ports(id, BTreeSet::new());
        }
        self.update_scan_timer();
    }

    fn handle_remove_tab(&mut self, id: &SessionId) -> Result<()> {
        if id.kind() != SessionKind::Tab {
            return Err(Error::InvalidState {
                expected: "tab session".to_string(),
                actual: id.kind().to_string(),
            });
        }
        let Some(mut record) = self.records.remove(id) else {
            return Err(Error::SessionNotFound(id.clone()));
        };
        record.teardown();
        info!(session = %id, "tab removed");
        let _ = self.events.send(SessionEvent::Removed { id: id.clone() });
        self.reassign_active(id);
        Ok(())
    }

    fn handle_remove_workspace_kind(&mut self, workspace: &str, kind: SessionKind) {
        let ids: Vec<SessionId> = self
            .records
            .keys()
            .filter(|id| id.kind() == kind && id.workspace() == workspace)
            .cloned()
            .collect();
        for id in &ids {
            if let Some(mut record) = self.records.remove(id) {
                record.teardown();
                let _ = self.events.send(SessionEvent::Removed { id: id.clone() });
            }
        }
        if let Some(ws) = self.workspaces.get_mut(workspace) {
            match kind {
                SessionKind::Tab => ws.active_tab = None,
                SessionKind::Runner => ws.active_runner = None,
                SessionKind::Setup => ws.active_setup = None,
            }
        }
        if !ids.is_empty() {
            info!(workspace, kind = %kind, count = ids.len(), "sessions removed");
        }
        self.update_scan_timer();
    }

    fn handle_remove_all(&mut self) {
        let ids: Vec<SessionId> = self.records.keys().cloned().collect();
        for id in ids {
            if let Some(mut record) = self.records.remove(&id) {
                record.teardown();
                let _ = self.events.send(SessionEvent::Removed { id });
            }
        }
        self.workspaces.clear();
        self.update_scan_timer();
    }

    fn handle_write(&mut self, id: &SessionId, data: Bytes) -> Result<()> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        attached(record)?.write(data)
    }

    fn handle_send_key(&mut self, id: &SessionId, event: KeyEvent) -> Result<bool> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        attached(record)?.send_key(event)
    }

    fn handle_resize(&mut self, id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        match record.controller.as_ref() {
            Some(controller) => controller.resize(cols, rows),
            // Nothing to resize before attach; attach takes dimensions.
            None => Ok(()),
        }
    }

    fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut records: Vec<&SessionRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.created_seq);
        records.into_iter().map(SessionRecord::info).collect()
    }

    fn active_session(&self, workspace: &str, kind: SessionKind) -> Option<SessionId> {
        let ws = self.workspaces.get(workspace)?;
        match kind {
            SessionKind::Tab => ws.active_tab.clone(),
            SessionKind::Runner => ws.active_runner.clone(),
            SessionKind::Setup => ws.active_setup.clone(),
        }
    }

    /// Point the removed session's active slot at the most recently
    /// created survivor of the same category, or clear it.
    fn reassign_active(&mut self, removed: &SessionId) {
        let workspace = removed.workspace().to_string();
        let Some(ws) = self.workspaces.get_mut(&workspace) else {
            return;
        };
        let slot = match removed.kind() {
            SessionKind::Tab => &mut ws.active_tab,
            SessionKind::Runner => &mut ws.active_runner,
            SessionKind::Setup => &mut ws.active_setup,
        };
        if slot.as_ref() != Some(removed) {
            return;
        }
        *slot = self
            .records
            .values()
            .filter(|r| r.id.kind() == removed.kind() && r.id.workspace() == workspace)
            .max_by_key(|r| r.created_seq)
            .map(|r| r.id.clone());
    }

    fn runner_record(&mut self, id: &SessionId) -> Result<&mut SessionRecord> {
        if id.kind() != SessionKind::Runner {
            return Err(Error::InvalidState {
                expected: "runner session".to_string(),
                actual: id.kind().to_string(),
            });
        }
        self.records
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    fn publish_ports(&mut self, id: SessionId, ports: BTreeSet<u16>) {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
        let _ = self.events.send(SessionEvent::PortsChanged { id, ports });
    }

    /// Dispatch one scan per running runner; results come back as
    /// messages so the blocking walk never runs on the registry task.
    fn handle_scan_tick(&mut self) {
        for record in self.records.values() {
            if !record.is_running_runner() {
                continue;
            }
            let Some(controller) = record.controller.as_ref() else {
                continue;
            };
            let id = record.id.clone();
            let pid = controller.pid();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let ports =
                    tokio::task::spawn_blocking(move || ports::listening_ports_for_tree(pid))
                        .await
                        .unwrap_or_default();
                let _ = cmd_tx.send(RegistryCommand::ScanResult { id, pid, ports });
            });
        }
    }

    fn handle_scan_result(&mut self, id: SessionId, pid: i32, ports: BTreeSet<u16>) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        // The session may have stopped or been respawned while the scan
        // was in flight; only results for the scanned process apply.
        if !record.state.is_running() {
            return;
        }
        let Some(controller) = record.controller.as_ref() else {
            return;
        };
        if controller.pid() != pid {
            return;
        }
        if record.ports == ports {
            return;
        }

        debug!(session = %id, ports = ?ports, "listening ports changed");
        record.ports = ports.clone();
        self.publish_ports(id, ports);
    }

    /// Keep the scan ticker alive exactly while any runner is running.
    fn update_scan_timer(&mut self) {
        let needed = self.records.values().any(SessionRecord::is_running_runner);
        if needed && self.scan_task.is_none() {
            debug!("port scan timer started");
            let cmd_tx = self.cmd_tx.clone();
            self.scan_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PORT_SCAN_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if cmd_tx.send(RegistryCommand::ScanTick).is_err() {
                        break;
                    }
                }
            }));
        } else if !needed {
            if let Some(task) = self.scan_task.take() {
                task.abort();
                debug!("port scan timer stopped");
            }
        }
    }
}

fn attached(record: &SessionRecord) -> Result<&PtyController> {
    record.controller.as_ref().ok_or_else(|| Error::InvalidState {
        expected: "attached".to_string(),
        actual: if record.state.is_terminal() {
            record.state.to_string()
        } else {
            "detached".to_string()
        },
    })
}

fn command_line(command: &str) -> Bytes {
    let mut line = Vec::with_capacity(command.len() + 1);
    line.extend_from_slice(command.as_bytes());
    line.push(b'\n');
    Bytes::from(line)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wsmux_core::session::SessionKind;

    fn runner_config(name: &str, defer: bool) -> RunnerConfig {
        RunnerConfig {
            name: name.to_string(),
            title: name.to_string(),
            working_dir: PathBuf::from("/tmp"),
            initial_command: "npm run dev".to_string(),
            defer,
            meta: RunnerMeta::default(),
        }
    }

    #[tokio::test]
    async fn tabs_get_sequential_ids_and_active_selection() {
        let registry = SessionRegistry::spawn();

        let first = registry.create_tab("ws", "/tmp", None).await.unwrap();
        let second = registry.create_tab("ws", "/tmp", None).await.unwrap();

        assert_eq!(first.id.to_string(), "tab:ws:1");
        assert_eq!(second.id.to_string(), "tab:ws:2");
        assert_eq!(
            registry.active_session("ws", SessionKind::Tab).await.unwrap(),
            Some(second.id)
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tab_indices_are_per_workspace() {
        let registry = SessionRegistry::spawn();

        let a = registry.create_tab("alpha", "/tmp", None).await.unwrap();
        let b = registry.create_tab("beta", "/tmp", None).await.unwrap();

        assert_eq!(a.id.to_string(), "tab:alpha:1");
        assert_eq!(b.id.to_string(), "tab:beta:1");
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn create_runner_is_idempotent() {
        let registry = SessionRegistry::spawn();

        let first = registry
            .create_runner("ws", runner_config("dev", false))
            .await
            .unwrap();
        let second = registry
            .create_runner("ws", runner_config("dev", false))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(registry.sessions().await.unwrap().len(), 1);
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn first_immediate_runner_becomes_active() {
        let registry = SessionRegistry::spawn();

        registry
            .create_runner("ws", runner_config("api", false))
            .await
            .unwrap();
        registry
            .create_runner("ws", runner_config("web", false))
            .await
            .unwrap();

        assert_eq!(
            registry
                .active_session("ws", SessionKind::Runner)
                .await
                .unwrap()
                .map(|id| id.to_string()),
            Some("runner:ws:api".to_string())
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deferred_runner_does_not_claim_active() {
        let registry = SessionRegistry::spawn();

        registry
            .create_runner("ws", runner_config("lazy", true))
            .await
            .unwrap();

        assert_eq!(
            registry.active_session("ws", SessionKind::Runner).await.unwrap(),
            None
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn setup_batch_selects_its_first_entry() {
        let registry = SessionRegistry::spawn();

        let infos = registry
            .create_setup_sessions(
                "ws",
                "/tmp",
                vec!["npm install".to_string(), "cp .env.sample .env".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id.to_string(), "setup:ws:1");
        assert_eq!(infos[1].id.to_string(), "setup:ws:2");
        assert_eq!(infos[0].title, "npm install");
        assert_eq!(
            registry.active_session("ws", SessionKind::Setup).await.unwrap(),
            Some(infos[0].id.clone())
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_maps_exit_codes_to_states() {
        let registry = SessionRegistry::spawn();

        let ok = registry.create_tab("ws", "/tmp", None).await.unwrap();
        let bad = registry.create_tab("ws", "/tmp", None).await.unwrap();
        let signaled = registry.create_tab("ws", "/tmp", None).await.unwrap();

        registry.process_exit(&ok.id, Some(0)).await.unwrap();
        registry.process_exit(&bad.id, Some(2)).await.unwrap();
        registry.process_exit(&signaled.id, None).await.unwrap();

        let state = |id: &SessionId| {
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.session(&id).await.unwrap().unwrap().state }
        };
        assert_eq!(state(&ok.id).await, SessionState::Succeeded);
        assert_eq!(state(&bad.id).await, SessionState::Failed);
        assert_eq!(state(&signaled.id).await, SessionState::Failed);
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_for_unknown_session_is_ignored() {
        let registry = SessionRegistry::spawn();
        registry
            .process_exit(&SessionId::tab("ghost", 9), Some(0))
            .await
            .unwrap();
        assert!(registry.sessions().await.unwrap().is_empty());
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removing_active_tab_promotes_most_recent_survivor() {
        let registry = SessionRegistry::spawn();

        let t1 = registry.create_tab("ws", "/tmp", None).await.unwrap();
        let t2 = registry.create_tab("ws", "/tmp", None).await.unwrap();
        let t3 = registry.create_tab("ws", "/tmp", None).await.unwrap();

        registry.remove_tab(&t3.id).await.unwrap();
        assert_eq!(
            registry.active_session("ws", SessionKind::Tab).await.unwrap(),
            Some(t2.id.clone())
        );

        // Removing a non-active tab leaves the selection alone
        registry.remove_tab(&t1.id).await.unwrap();
        assert_eq!(
            registry.active_session("ws", SessionKind::Tab).await.unwrap(),
            Some(t2.id.clone())
        );

        registry.remove_tab(&t2.id).await.unwrap();
        assert_eq!(
            registry.active_session("ws", SessionKind::Tab).await.unwrap(),
            None
        );
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn remove_tab_rejects_non_tab_ids_and_unknown_tabs() {
        let registry = SessionRegistry::spawn();
        registry
            .create_runner("ws", runner_config("dev", false))
            .await
            .unwrap();

        let err = registry
            .remove_tab(&SessionId::runner("ws", "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let err = registry.remove_tab(&SessionId::tab("ws", 7)).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn bulk_removal_clears_active_selection() {
        let registry = SessionRegistry::spawn();

        registry
            .create_runner("ws", runner_config("api", false))
            .await
            .unwrap();
        registry
            .create_runner("ws", runner_config("web", false))
            .await
            .unwrap();
        registry
            .create_setup_sessions("ws", "/tmp", vec!["true".to_string()])
            .await
            .unwrap();

        registry.remove_runner_sessions("ws").await.unwrap();
        registry.remove_setup_sessions("ws").await.unwrap();

        assert_eq!(
            registry.active_session("ws", SessionKind::Runner).await.unwrap(),
            None
        );
        assert_eq!(
            registry.active_session("ws", SessionKind::Setup).await.unwrap(),
            None
        );
        assert!(registry.sessions().await.unwrap().is_empty());
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn io_before_attach_is_rejected_or_deferred() {
        let registry = SessionRegistry::spawn();
        let tab = registry.create_tab("ws", "/tmp", None).await.unwrap();

        let err = registry
            .write(&tab.id, Bytes::from_static(b"ls\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        // Resize before attach is explicitly a no-op
        registry.resize(&tab.id, 120, 40).await.unwrap();
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_requires_deferral_and_attachment() {
        let registry = SessionRegistry::spawn();

        let immediate = registry
            .create_runner("ws", runner_config("api", false))
            .await
            .unwrap();
        let err = registry.start(&immediate.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let deferred = registry
            .create_runner("ws", runner_config("lazy", true))
            .await
            .unwrap();
        let err = registry.start(&deferred.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn events_track_creation_exit_and_removal() {
        let registry = SessionRegistry::spawn();
        let mut events = registry.subscribe();

        let tab = registry.create_tab("ws", "/tmp", None).await.unwrap();
        registry.process_exit(&tab.id, Some(0)).await.unwrap();
        registry.remove_tab(&tab.id).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Created { id } if id == tab.id
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged { state: SessionState::Succeeded, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Removed { id } if id == tab.id
        ));
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn port_epoch_starts_at_zero() {
        let registry = SessionRegistry::spawn();
        assert_eq!(*registry.port_epoch().borrow(), 0);
        registry.shutdown().await.unwrap();
    }
}
