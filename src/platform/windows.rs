//! Windows process termination and socket inspection

use anyhow::{Context, Result};
use std::process::Command;

use windows::Win32::Foundation::{CloseHandle, FALSE};
use windows::Win32::System::Threading::*;

use super::ListeningPort;

/// Exit code reported by GetExitCodeProcess while a process runs
const STILL_ACTIVE: u32 = 259;

/// Terminate a process.
///
/// Windows has no SIGTERM equivalent for console-less children, so this is
/// TerminateProcess with a clean exit code.
pub fn terminate_process(pid: u32) -> Result<()> {
    end_process(pid, 0).context("Failed to terminate process")
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    end_process(pid, 1).context("Failed to kill process")
}

fn end_process(pid: u32, exit_code: u32) -> Result<()> {
    unsafe {
        let handle =
            OpenProcess(PROCESS_TERMINATE, FALSE, pid).context("Failed to open process")?;

        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle).ok();

        result.context("TerminateProcess failed")
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    unsafe {
        let handle = match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) {
            Ok(h) => h,
            Err(_) => return false,
        };

        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle).ok();

        result.is_ok() && exit_code == STILL_ACTIVE
    }
}

/// Listening TCP sockets via `netstat -ano`
pub fn listening_ports() -> Result<Vec<ListeningPort>> {
    let output = Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .output()
        .context("Failed to run netstat")?;

    Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `netstat -ano` rows of the form `TCP  0.0.0.0:135  0.0.0.0:0  LISTENING  1234`.
/// Process names are filled in later by the caller.
fn parse_netstat(stdout: &str) -> Vec<ListeningPort> {
    stdout
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() != 5 || !cols[0].eq_ignore_ascii_case("TCP") || cols[3] != "LISTENING" {
                return None;
            }
            let port = cols[1].rsplit_once(':')?.1.parse::<u16>().ok()?;
            let pid = cols[4].parse::<u32>().ok()?;
            Some(ListeningPort {
                port,
                pid,
                name: String::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_netstat_listening_rows() {
        let out = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1044
  TCP    127.0.0.1:2080         0.0.0.0:0              LISTENING       4242
  TCP    10.0.0.5:50123         1.1.1.1:443            ESTABLISHED     4242
";
        let ports = parse_netstat(out);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].port, 2080);
        assert_eq!(ports[1].pid, 4242);
    }
}
