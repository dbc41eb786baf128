//! PTY allocation and child process control.
//!
//! Handles:
//! - Spawning a shell or one-shot command on a fresh PTY pair
//! - Async read/write on the master descriptor
//! - Window-size changes
//! - Non-blocking child exit collection
//!
//! Uses the `nix` crate for Unix PTY support and `AsyncFd` for proper
//! async I/O integration with tokio's reactor.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, close, dup2, execvpe, fork, setsid, ForkResult, Pid};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use wsmux_core::constants::{
    DEFAULT_COLORTERM, DEFAULT_TERM, SESSION_ENV_VAR, SPAWN_FAILURE_EXIT_CODE,
};
use wsmux_core::error::{Error, Result};
use wsmux_core::session::SessionId;

/// What to execute on the PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    /// Shell or executable path. `None` resolves to `$SHELL` then `/bin/sh`.
    pub shell: Option<String>,
    /// `Some(cmd)` execs `shell -c cmd` to completion; `None` execs an
    /// interactive login-style shell.
    pub one_shot: Option<String>,
    /// Child working directory.
    pub working_dir: PathBuf,
    /// Complete child environment. The child gets exactly this, nothing
    /// inherited; use [`build_child_env`] to derive it from the parent.
    pub env: Vec<(String, String)>,
}

/// Outcome of a collected child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code, or `None` when indeterminate (killed by a signal, or
    /// already reaped elsewhere).
    pub code: Option<i32>,
}

/// Build a child environment from the parent's, honoring the session
/// variable contract: the inherited session marker is stripped, then
/// `TERM`, `COLORTERM`, and a fresh marker for `id` are injected.
pub fn build_child_env(id: &SessionId) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| key != SESSION_ENV_VAR && key != "TERM" && key != "COLORTERM")
        .collect();
    env.push(("TERM".into(), DEFAULT_TERM.into()));
    env.push(("COLORTERM".into(), DEFAULT_COLORTERM.into()));
    env.push((SESSION_ENV_VAR.into(), id.to_string()));
    env
}

/// PTY handle for async I/O.
///
/// Owns the master descriptor and the child pid. Exactly one controller
/// owns a `Pty` at a time; descriptors are never shared.
pub struct Pty {
    /// Master PTY file descriptor wrapped for async I/O.
    master: Arc<AsyncFd<std::fs::File>>,
    /// Child process PID.
    child_pid: Pid,
    /// Raw master fd for ioctl operations.
    master_fd: RawFd,
}

impl Pty {
    /// Allocate a PTY pair sized to `cols`×`rows`, fork, and exec
    /// `command` in the child.
    ///
    /// The child replaces its environment with `command.env`, changes to
    /// `command.working_dir`, and execs with argv[0] rewritten to a
    /// login-shell-style name (leading `-`) when interactive, or with
    /// `-c <cmd>` when one-shot. Any child-side failure calls `_exit(127)`
    /// so the parent observes an immediately-exited child rather than a
    /// forked copy of itself unwinding.
    ///
    /// # Safety
    ///
    /// Uses `fork()`, which is inherently delicate in multi-threaded
    /// programs. All allocation for the child (CStrings for argv/envp) is
    /// done before forking; the child only makes async-signal-safe calls.
    pub fn spawn(command: &PtyCommand, cols: u16, rows: u16) -> Result<Self> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let pty_result = openpty(&winsize, None).map_err(|e| Error::Pty {
            message: format!("failed to open pty: {}", e),
        })?;

        let master_fd = pty_result.master.as_raw_fd();
        let slave_fd = pty_result.slave.as_raw_fd();

        // Resolve the shell to use
        let shell_path = command
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let shell_name = shell_path.rsplit('/').next().unwrap_or(&shell_path);

        info!(shell = %shell_path, one_shot = command.one_shot.is_some(), "spawning pty child");

        // Prepare exec arguments before forking - no allocation may happen
        // in the child.
        let exe = cstring(&shell_path)?;
        let argv: Vec<CString> = match &command.one_shot {
            Some(cmd) => vec![
                cstring(shell_name)?,
                cstring("-c")?,
                cstring(cmd)?,
            ],
            None => vec![cstring(&format!("-{}", shell_name))?],
        };
        let envp: Vec<CString> = command
            .env
            .iter()
            .map(|(k, v)| cstring(&format!("{}={}", k, v)))
            .collect::<Result<_>>()?;
        let cwd = cstring(&command.working_dir.to_string_lossy())?;

        // SAFETY: fork() in a threaded process; the child branch below
        // sticks to async-signal-safe operations and exits via _exit.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                // Parent - close slave fd
                drop(pty_result.slave);

                // Convert master to std::fs::File
                // SAFETY: we own the fd from openpty and it's valid
                let master_owned: OwnedFd = pty_result.master;
                let std_file = unsafe { std::fs::File::from_raw_fd(master_owned.as_raw_fd()) };
                // Prevent double-close by forgetting the OwnedFd
                std::mem::forget(master_owned);

                // Non-blocking mode for async I/O
                set_nonblocking(master_fd)?;

                let async_fd = AsyncFd::new(std_file).map_err(|e| Error::Pty {
                    message: format!("failed to create AsyncFd: {}", e),
                })?;

                Ok(Self {
                    master: Arc::new(async_fd),
                    child_pid: child,
                    master_fd,
                })
            }
            Ok(ForkResult::Child) => {
                // Child - become session leader with the slave as
                // controlling terminal, wire std streams, drop into the
                // working directory, exec. Failures cannot be reported to
                // the parent; exit 127 and let the exit code speak.
                if setsid().is_err() {
                    unsafe { libc::_exit(SPAWN_FAILURE_EXIT_CODE) };
                }

                // TIOCSCTTY request type varies by platform (c_ulong on
                // glibc/macOS, c_int on musl)
                unsafe {
                    libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
                }

                let stdio_ok = dup2(slave_fd, libc::STDIN_FILENO).is_ok()
                    && dup2(slave_fd, libc::STDOUT_FILENO).is_ok()
                    && dup2(slave_fd, libc::STDERR_FILENO).is_ok();
                if !stdio_ok {
                    unsafe { libc::_exit(SPAWN_FAILURE_EXIT_CODE) };
                }

                if slave_fd > libc::STDERR_FILENO {
                    let _ = close(slave_fd);
                }
                let _ = close(master_fd);

                if chdir(cwd.as_c_str()).is_err() {
                    unsafe { libc::_exit(SPAWN_FAILURE_EXIT_CODE) };
                }

                let _ = execvpe(&exe, &argv, &envp);
                unsafe { libc::_exit(SPAWN_FAILURE_EXIT_CODE) };
            }
            Err(e) => Err(Error::Spawn {
                message: format!("fork failed: {}", e),
            }),
        }
    }

    /// Resize the PTY. Does not disturb the child.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let result = unsafe { libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            return Err(Error::Pty {
                message: format!("failed to resize pty: {}", err),
            });
        }

        debug!(cols, rows, "pty resized");
        Ok(())
    }

    /// Write data to the PTY (child's stdin).
    ///
    /// Waits for write readiness; a full kernel pipe parks the task, not
    /// the thread, and the remaining slice is retried.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self.master.writable().await.map_err(|e| Error::Pty {
                message: format!("failed to wait for pty write readiness: {}", e),
            })?;

            match guard.try_io(|inner| inner.get_ref().write(remaining)) {
                Ok(Ok(n)) => {
                    remaining = &remaining[n..];
                }
                Ok(Err(e)) => {
                    return Err(Error::Pty {
                        message: format!("failed to write to pty: {}", e),
                    });
                }
                Err(_would_block) => {
                    // Readiness was a false positive, loop and wait again
                    continue;
                }
            }
        }
        Ok(())
    }

    /// Read data from the PTY (child's output).
    ///
    /// Returns `None` on EOF. EIO from a closed slave side is EOF too -
    /// the usual way a Linux PTY reports the child being gone.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            let mut guard = self.master.readable().await.map_err(|e| Error::Pty {
                message: format!("failed to wait for pty read readiness: {}", e),
            })?;

            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => return Ok(Some(n)),
                Ok(Err(e)) => {
                    if e.raw_os_error() == Some(libc::EIO) {
                        debug!("pty read returned EIO (child likely exited)");
                        return Ok(None);
                    }
                    return Err(Error::Pty {
                        message: format!("failed to read from pty: {}", e),
                    });
                }
                Err(_would_block) => {
                    // Readiness was a false positive, loop and wait again
                    continue;
                }
            }
        }
    }

    /// Non-blocking check for child exit.
    ///
    /// `Ok(None)` while the child runs. A child killed by a signal, or one
    /// already reaped elsewhere, reports `code: None` (indeterminate).
    pub fn try_wait(&self) -> Result<Option<ChildExit>> {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                info!(exit_code = code, "child exited");
                Ok(Some(ChildExit { code: Some(code) }))
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                info!(signal = ?signal, "child killed by signal");
                Ok(Some(ChildExit { code: None }))
            }
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(_) => Ok(None), // stopped/continued
            Err(nix::errno::Errno::ECHILD) => Ok(Some(ChildExit { code: None })),
            Err(e) => Err(Error::Pty {
                message: format!("failed to check child status: {}", e),
            }),
        }
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.child_pid, signal).map_err(|e| Error::Pty {
            message: format!("failed to signal child: {}", e),
        })
    }

    /// The child process pid.
    pub fn pid(&self) -> Pid {
        self.child_pid
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        // Hang up the child if it is still running; the master descriptor
        // closes with the wrapped File.
        if self.try_wait().ok().flatten().is_none() {
            let _ = self.signal(Signal::SIGHUP);
        }
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| Error::Spawn {
        message: format!("argument contains NUL: {}", e),
    })
}

/// Set a file descriptor to non-blocking mode.
fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Pty {
        message: format!("fcntl F_GETFL failed: {}", e),
    })?;

    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;

    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Pty {
        message: format!("fcntl F_SETFL failed: {}", e),
    })?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_command(one_shot: Option<&str>) -> PtyCommand {
        PtyCommand {
            shell: Some("/bin/sh".into()),
            one_shot: one_shot.map(String::from),
            working_dir: std::env::temp_dir(),
            env: build_child_env(&SessionId::tab("ws", 1)),
        }
    }

    /// Collect output until EOF, bounded so a wedged PTY cannot hang the
    /// suite.
    async fn drain(pty: &Pty) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(10), pty.read(&mut buf)).await {
                Ok(Ok(Some(n))) => collected.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        collected
    }

    async fn wait_exit(pty: &Pty) -> Option<ChildExit> {
        for _ in 0..100 {
            if let Ok(Some(exit)) = pty.try_wait() {
                return Some(exit);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    #[tokio::test]
    async fn spawn_interactive_shell() {
        // This test may fail in CI without a proper TTY
        let result = Pty::spawn(&sh_command(None), 80, 24);
        if let Err(e) = &result {
            eprintln!("PTY spawn failed (may be expected in CI): {}", e);
            return;
        }
        let pty = result.unwrap();
        assert!(pty.pid().as_raw() > 0);
        let _ = pty.signal(Signal::SIGHUP);
    }

    #[tokio::test]
    async fn one_shot_reports_exit_code() {
        let Ok(pty) = Pty::spawn(&sh_command(Some("exit 42")), 80, 24) else {
            eprintln!("PTY spawn failed (may be expected in CI)");
            return;
        };

        drain(&pty).await;
        let exit = wait_exit(&pty).await.expect("child should exit");
        assert_eq!(exit.code, Some(42));
    }

    #[tokio::test]
    async fn one_shot_sees_replacement_env() {
        let cmd = sh_command(Some("printf '<%s|%s>' \"$WSMUX_SESSION\" \"$TERM\""));
        let Ok(pty) = Pty::spawn(&cmd, 80, 24) else {
            eprintln!("PTY spawn failed (may be expected in CI)");
            return;
        };

        let output = drain(&pty).await;
        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains("<tab:ws:1|xterm-256color>"),
            "unexpected output: {:?}",
            text
        );
        wait_exit(&pty).await;
    }

    #[tokio::test]
    async fn missing_executable_exits_127() {
        let cmd = PtyCommand {
            shell: Some("/definitely/not/a/shell".into()),
            one_shot: None,
            working_dir: std::env::temp_dir(),
            env: build_child_env(&SessionId::tab("ws", 1)),
        };
        let Ok(pty) = Pty::spawn(&cmd, 80, 24) else {
            eprintln!("PTY spawn failed (may be expected in CI)");
            return;
        };

        drain(&pty).await;
        let exit = wait_exit(&pty).await.expect("child should exit");
        assert_eq!(exit.code, Some(SPAWN_FAILURE_EXIT_CODE));
    }

    #[tokio::test]
    async fn resize_succeeds_on_live_pty() {
        let Ok(pty) = Pty::spawn(&sh_command(None), 80, 24) else {
            eprintln!("PTY spawn failed (may be expected in CI)");
            return;
        };
        assert!(pty.resize(120, 40).is_ok());
        let _ = pty.signal(Signal::SIGHUP);
    }

    #[test]
    fn child_env_strips_and_injects() {
        std::env::set_var(SESSION_ENV_VAR, "stale:ws:9");
        let env = build_child_env(&SessionId::runner("ws", "dev"));
        std::env::remove_var(SESSION_ENV_VAR);

        let get = |k: &str| {
            env.iter()
                .filter(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(get(SESSION_ENV_VAR), vec!["runner:ws:dev"]);
        assert_eq!(get("TERM"), vec![DEFAULT_TERM]);
        assert_eq!(get("COLORTERM"), vec![DEFAULT_COLORTERM]);
    }
}
