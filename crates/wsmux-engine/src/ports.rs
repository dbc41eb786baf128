//! Listening-port discovery for a session's process tree.
//!
//! Walks `/proc` via the `procfs` crate: enumerate processes to build a
//! parent/child map, BFS from the session's shell pid, collect the socket
//! inodes held by every process in the tree, then intersect with the
//! kernel's TCP tables filtered to LISTEN state.
//!
//! Everything here is best-effort. Processes fork, exec, and exit while we
//! scan; a pid that vanishes mid-walk is skipped, never an error. Callers
//! get the ports that were observable at scan time, which may briefly lag
//! reality in either direction.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use procfs::net::TcpState;
use procfs::process::{FDTarget, Process};
use tracing::{debug, trace};

use wsmux_core::constants::MAX_PIDS_PER_SCAN;

/// TCP ports in LISTEN state owned by `root` or any of its descendants.
///
/// Blocking (walks `/proc`); run it on a blocking thread from async
/// contexts. Returns an empty set when the root process is gone or `/proc`
/// is unreadable.
pub fn listening_ports_for_tree(root: i32) -> BTreeSet<u16> {
    let pids = process_tree(root);
    let inodes = socket_inodes(&pids);
    if inodes.is_empty() {
        return BTreeSet::new();
    }

    let mut ports = BTreeSet::new();
    let entries = procfs::net::tcp()
        .unwrap_or_default()
        .into_iter()
        .chain(procfs::net::tcp6().unwrap_or_default());
    for entry in entries {
        if entry.state == TcpState::Listen && inodes.contains(&entry.inode) {
            ports.insert(entry.local_address.port());
        }
    }

    debug!(root, pids = pids.len(), ports = ports.len(), "port scan complete");
    ports
}

/// `root` plus all transitive children, bounded to keep a runaway fork
/// storm from turning the scan into the problem.
fn process_tree(root: i32) -> Vec<i32> {
    // One pass over /proc beats per-pid child lookups: reparented processes
    // still show their current ppid here.
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    let procs = match procfs::process::all_processes() {
        Ok(procs) => procs,
        Err(e) => {
            trace!(error = %e, "cannot enumerate processes");
            return vec![root];
        }
    };
    for process in procs.filter_map(|p| p.ok()) {
        if let Ok(stat) = process.stat() {
            children.entry(stat.ppid).or_default().push(stat.pid);
        }
    }

    let mut visited: HashSet<i32> = HashSet::new();
    let mut queue: VecDeque<i32> = VecDeque::new();
    let mut tree = Vec::new();
    queue.push_back(root);

    while let Some(pid) = queue.pop_front() {
        if tree.len() >= MAX_PIDS_PER_SCAN {
            debug!(root, "process tree truncated at scan limit");
            break;
        }
        if !visited.insert(pid) {
            continue;
        }
        tree.push(pid);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    tree
}

/// Socket inodes held open by any of `pids`. Unreadable fd tables
/// (exited process, permissions) are skipped.
fn socket_inodes(pids: &[i32]) -> HashSet<u64> {
    let mut inodes = HashSet::new();
    for &pid in pids {
        let Ok(process) = Process::new(pid) else {
            continue;
        };
        let Ok(fds) = process.fd() else {
            continue;
        };
        for fd in fds.filter_map(|f| f.ok()) {
            if let FDTarget::Socket(inode) = fd.target {
                inodes.insert(inode);
            }
        }
    }
    inodes
}

// =============================================================================
// Tests
// =============================================================================
