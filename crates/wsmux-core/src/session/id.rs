//! Session identity.
//!
//! A session id carries its category (tab, runner, setup) and its origin
//! inside one value, so the category can never drift from the identifier.
//! The string forms `tab:{workspace}:{n}`, `runner:{workspace}:{name}`,
//! and `setup:{workspace}:{n}` are a serialization detail; the enum is the
//! canonical representation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Session category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Interactive shell tab.
    Tab,
    /// Long-lived process runner (dev server, watcher).
    Runner,
    /// One-shot setup command.
    Setup,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionKind::Tab => "tab",
            SessionKind::Runner => "runner",
            SessionKind::Setup => "setup",
        };
        f.write_str(s)
    }
}

/// Unique session identifier.
///
/// The workspace component is typically a filesystem path and may itself
/// contain `:`; parsing takes the key from the last `:` so such workspaces
/// round-trip. Runner names must not contain `:` for the same reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SessionId {
    /// Interactive tab, numbered sequentially within its workspace.
    Tab { workspace: String, index: u32 },
    /// Named runner within its workspace.
    Runner { workspace: String, name: String },
    /// Setup command, numbered by position in the setup list.
    Setup { workspace: String, index: u32 },
}

impl SessionId {
    /// Construct a tab id.
    pub fn tab(workspace: impl Into<String>, index: u32) -> Self {
        SessionId::Tab {
            workspace: workspace.into(),
            index,
        }
    }

    /// Construct a runner id.
    pub fn runner(workspace: impl Into<String>, name: impl Into<String>) -> Self {
        SessionId::Runner {
            workspace: workspace.into(),
            name: name.into(),
        }
    }

    /// Construct a setup id.
    pub fn setup(workspace: impl Into<String>, index: u32) -> Self {
        SessionId::Setup {
            workspace: workspace.into(),
            index,
        }
    }

    /// The session's category.
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionId::Tab { .. } => SessionKind::Tab,
            SessionId::Runner { .. } => SessionKind::Runner,
            SessionId::Setup { .. } => SessionKind::Setup,
        }
    }

    /// The workspace this session belongs to.
    pub fn workspace(&self) -> &str {
        match self {
            SessionId::Tab { workspace, .. }
            | SessionId::Runner { workspace, .. }
            | SessionId::Setup { workspace, .. } => workspace,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Tab { workspace, index } => write!(f, "tab:{}:{}", workspace, index),
            SessionId::Runner { workspace, name } => write!(f, "runner:{}:{}", workspace, name),
            SessionId::Setup { workspace, index } => write!(f, "setup:{}:{}", workspace, index),
        }
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = s.split_once(':').ok_or_else(|| Error::InvalidSessionId {
            message: format!("missing category prefix: {}", s),
        })?;

        // The workspace may contain ':' (it is usually a path), so the key
        // is whatever follows the last separator.
        let (workspace, key) = rest.rsplit_once(':').ok_or_else(|| Error::InvalidSessionId {
            message: format!("expected {{category}}:{{workspace}}:{{key}}, got: {}", s),
        })?;

        if workspace.is_empty() {
            return Err(Error::InvalidSessionId {
                message: format!("empty workspace: {}", s),
            });
        }
        if key.is_empty() {
            return Err(Error::InvalidSessionId {
                message: format!("empty key: {}", s),
            });
        }

        match kind {
            "tab" => Ok(SessionId::tab(workspace, parse_index(key, s)?)),
            "runner" => Ok(SessionId::runner(workspace, key)),
            "setup" => Ok(SessionId::setup(workspace, parse_index(key, s)?)),
            other => Err(Error::InvalidSessionId {
                message: format!("unknown category: {}", other),
            }),
        }
    }
}

fn parse_index(key: &str, full: &str) -> Result<u32> {
    key.parse::<u32>().map_err(|_| Error::InvalidSessionId {
        message: format!("non-numeric index in: {}", full),
    })
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
