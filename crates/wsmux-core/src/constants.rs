//! Configuration constants for wsmux.

use std::time::Duration;

// =============================================================================
// PTY Constants
// =============================================================================

/// Maximum bytes read from a PTY master per readable event.
pub const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;

/// Capacity of the per-session filtered-output channel (in chunks).
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the registry's broadcast event channel. Subscribers that
/// lag further than this lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Default terminal columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;

/// TERM value injected into every child environment.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// COLORTERM value injected into every child environment.
pub const DEFAULT_COLORTERM: &str = "truecolor";

/// Exit code observed when the child-side setup or exec fails.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

// =============================================================================
// Environment Variables
// =============================================================================

/// Variable tying a child process to its owning session. Stripped from the
/// inherited environment before exec, then re-injected with the new id, so
/// nested sessions never see a stale marker.
pub const SESSION_ENV_VAR: &str = "WSMUX_SESSION";

// =============================================================================
// Timing Constants
// =============================================================================

/// Period of the listening-port scan while any runner is running.
pub const PORT_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Delay between interrupting a runner's shell and re-issuing its command
/// during restart, letting the shell return to its prompt.
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// How long terminate waits between non-blocking reap attempts.
pub const REAP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How many non-blocking reap attempts terminate makes before giving up.
pub const REAP_RETRY_LIMIT: u32 = 10;

// =============================================================================
// Control Bytes
// =============================================================================

/// Interrupt byte written to a runner's shell on stop/restart (Ctrl-C).
pub const INTERRUPT_BYTE: u8 = 0x03;

// =============================================================================
// Port Scanner Constants
// =============================================================================

/// Maximum descendant pids collected per scan call. Wider trees are
/// truncated rather than scanned unboundedly.
pub const MAX_PIDS_PER_SCAN: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_8k() {
        assert_eq!(OUTPUT_CHUNK_SIZE, 8192);
    }

    #[test]
    fn timing_constants_are_ordered() {
        assert!(RESTART_SETTLE_DELAY < PORT_SCAN_INTERVAL);
        assert!(REAP_RETRY_DELAY < RESTART_SETTLE_DELAY);
    }

    #[test]
    fn interrupt_is_ctrl_c() {
        assert_eq!(INTERRUPT_BYTE, b'C' & 0x1f);
    }

    #[test]
    fn env_var_names_are_stable() {
        // Child processes and nested sessions depend on these exact names.
        assert_eq!(SESSION_ENV_VAR, "WSMUX_SESSION");
        assert_eq!(DEFAULT_TERM, "xterm-256color");
    }
}
