//! Platform-specific implementations for Unix and Windows

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub mod unix;

use anyhow::Result;
use serde::Serialize;

/// A TCP socket in the LISTEN state and its owning process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningPort {
    pub port: u16,
    pub pid: u32,
    pub name: String,
}

/// Terminate a process gracefully
pub fn terminate_process(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::terminate_process(pid)
    }
    #[cfg(unix)]
    {
        unix::terminate_process(pid)
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::kill_process(pid)
    }
    #[cfg(unix)]
    {
        unix::kill_process(pid)
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(windows)]
    {
        windows::is_process_running(pid)
    }
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
}

/// List listening TCP ports, sorted by port and truncated to `limit`.
///
/// Diagnostic only: any failure to run the OS tool yields an empty list.
pub fn listening_ports(limit: usize) -> Vec<ListeningPort> {
    #[cfg(windows)]
    let found = windows::listening_ports();
    #[cfg(unix)]
    let found = unix::listening_ports();

    let mut ports = match found {
        Ok(ports) => ports,
        Err(e) => {
            tracing::debug!("Listening port scan unavailable: {:#}", e);
            Vec::new()
        }
    };
    fill_process_names(&mut ports);
    ports.sort_by(|a, b| a.port.cmp(&b.port).then(a.pid.cmp(&b.pid)));
    ports.dedup_by(|a, b| a.port == b.port && a.pid == b.pid);
    ports.truncate(limit);
    ports
}

/// Resolve missing process names from the process table
fn fill_process_names(ports: &mut [ListeningPort]) {
    if ports.iter().all(|p| !p.name.is_empty()) {
        return;
    }
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    for port in ports.iter_mut().filter(|p| p.name.is_empty()) {
        port.name = system
            .process(sysinfo::Pid::from_u32(port.pid))
            .map(|p| p.name().to_string_lossy().to_string())
            .unwrap_or_else(|| "-".to_string());
    }
}
