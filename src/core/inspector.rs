//! Process inspection - OS process table queries and signals

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::trace;

use crate::platform;

/// The OS capabilities the termination algorithm needs.
///
/// Kept small so the algorithm can be driven by a fake process table in tests.
pub trait ProcessInspector: Send + Sync {
    /// Whether a process with this id is present in the process table
    fn exists(&self, pid: u32) -> bool;

    /// All descendants of `pid`, children first
    fn children(&self, pid: u32) -> Result<Vec<u32>>;

    /// Ask a process to exit
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Force a process to exit
    fn kill(&self, pid: u32) -> Result<()>;

    /// Whether the process is still running (zombies count as exited)
    fn is_alive(&self, pid: u32) -> bool;

    /// Live processes in the session led by `sid`.
    ///
    /// Finds descendants that were reparented after their parent died.
    fn session_members(&self, sid: u32) -> Result<Vec<u32>>;
}

/// Process inspector backed by `sysinfo` and the platform signal helpers
pub struct SystemInspector {
    system: Mutex<System>,
}

impl SystemInspector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh_all(system: &mut System) {
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );
        trace!("Process table refreshed");
    }

    fn refresh_one(system: &mut System, pid: u32) {
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );
    }
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SystemInspector {
    fn exists(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return platform::is_process_running(pid);
        };
        Self::refresh_one(&mut system, pid);
        system.process(Pid::from_u32(pid)).is_some()
    }

    fn children(&self, pid: u32) -> Result<Vec<u32>> {
        let mut system = self
            .system
            .lock()
            .map_err(|e| anyhow::anyhow!("Process table lock poisoned: {}", e))?;
        Self::refresh_all(&mut system);

        let mut by_parent: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, process) in system.processes() {
            if let Some(parent) = process.parent() {
                by_parent.entry(parent).or_default().push(*child);
            }
        }

        Ok(descendants(&by_parent, Pid::from_u32(pid))
            .into_iter()
            .map(|p| p.as_u32())
            .collect())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        platform::terminate_process(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        platform::kill_process(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return platform::is_process_running(pid);
        };
        Self::refresh_one(&mut system, pid);
        system
            .process(Pid::from_u32(pid))
            .map(|p| !is_gone(p.status()))
            .unwrap_or(false)
    }

    #[cfg(unix)]
    fn session_members(&self, sid: u32) -> Result<Vec<u32>> {
        let mut system = self
            .system
            .lock()
            .map_err(|e| anyhow::anyhow!("Process table lock poisoned: {}", e))?;
        Self::refresh_all(&mut system);

        let sid = Pid::from_u32(sid);
        let mut members: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, p)| p.session_id() == Some(sid) && !is_gone(p.status()))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        members.sort_unstable();
        Ok(members)
    }

    /// sysinfo reports terminal-services sessions here, not process sessions
    #[cfg(not(unix))]
    fn session_members(&self, _sid: u32) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }
}

fn is_gone(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Breadth-first walk of the parent map; the root itself is excluded
fn descendants(by_parent: &HashMap<Pid, Vec<Pid>>, root: Pid) -> Vec<Pid> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = by_parent.get(&parent) {
            for kid in kids {
                // A pid can't be its own ancestor; guard against a corrupt snapshot
                if *kid != root && !out.contains(kid) {
                    out.push(*kid);
                    queue.push_back(*kid);
                }
            }
        }
    }
    out
}
