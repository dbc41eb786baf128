//! wsmux-engine: Session engine for the wsmux workspace multiplexer.
//!
//! Provides:
//! - Session registry actor with per-workspace active selection
//! - PTY process lifecycle (spawn, bridge, resize, terminate)
//! - Keyboard-protocol-aware output filtering and key delivery
//! - Listening-port discovery over a session's process tree
//! - CLI argument parsing
//! - Raw terminal mode handling

pub mod cli;
pub mod controller;
pub mod ports;
pub mod pty;
pub mod registry;
pub mod terminal;

mod session;

pub use cli::{Cli, CliLogFormat};
pub use controller::{ExitEvent, PtyController};
pub use ports::listening_ports_for_tree;
pub use pty::{ChildExit, Pty, PtyCommand, build_child_env};
pub use registry::{RegistryHandle, RunnerConfig, SessionEvent, SessionRegistry};
pub use terminal::{RawModeGuard, StdinReader, StdoutWriter, restore_terminal, terminal_size};
