//! wsmux-core: Shared types and pure logic for the wsmux session multiplexer.
//!
//! This crate provides:
//! - Session identity and lifecycle state types
//! - The keyboard-enhancement escape filter and key-event encoder
//! - Error types, constants, and logging setup

pub mod constants;
pub mod error;
pub mod keyproto;
pub mod logging;
pub mod session;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
