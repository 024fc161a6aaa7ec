//! Unix process signalling and socket inspection

use anyhow::{Context, Result};
use std::process::Command;

use super::ListeningPort;

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> Result<()> {
    signal(pid, libc::SIGTERM).context("Failed to terminate process")
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    signal(pid, libc::SIGKILL).context("Failed to kill process")
}

/// Check if a process is running
///
/// A process owned by another user still exists even though we may not
/// signal it, so `EPERM` counts as running.
pub fn is_process_running(pid: u32) -> bool {
    let Some(pid) = libc::pid_t::try_from(pid).ok().filter(|p| *p > 0) else {
        return false;
    };
    // kill with signal 0 checks if process exists without sending a signal
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    // pid 0 or a negative value would address a whole process group
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    let result = unsafe { libc::kill(pid, sig) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Listening TCP sockets via `lsof`
pub fn listening_ports() -> Result<Vec<ListeningPort>> {
    let output = Command::new("lsof")
        .args(["-nP", "-iTCP", "-sTCP:LISTEN"])
        .output()
        .context("Failed to run lsof")?;

    Ok(parse_lsof(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `lsof -nP -iTCP -sTCP:LISTEN` output.
///
/// Columns: COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME, where NAME is
/// `addr:port (LISTEN)`.
fn parse_lsof(stdout: &str) -> Vec<ListeningPort> {
    let mut ports = Vec::new();
    for line in stdout.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 9 {
            continue;
        }
        let Ok(pid) = cols[1].parse::<u32>() else {
            continue;
        };
        let name = cols[cols.len() - 2];
        let port = name
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok());
        if let Some(port) = port {
            ports.push(ListeningPort {
                port,
                pid,
                name: cols[0].to_string(),
            });
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsof_listen_table() {
        let out = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
sing-box 4242 me    7u  IPv4 0x1234      0t0  TCP 127.0.0.1:2080 (LISTEN)
sshd      811 root   3u  IPv6 0x9999      0t0  TCP *:22 (LISTEN)
garbage line
";
        let ports = parse_lsof(out);
        assert_eq!(
            ports,
            vec![
                ListeningPort {
                    port: 2080,
                    pid: 4242,
                    name: "sing-box".into()
                },
                ListeningPort {
                    port: 22,
                    pid: 811,
                    name: "sshd".into()
                },
            ]
        );
    }

    #[test]
    fn refuses_to_signal_process_groups() {
        assert!(terminate_process(0).is_err());
        assert!(kill_process(u32::MAX).is_err());
    }

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(0));
    }

    #[test]
    fn foreign_process_counts_as_running() {
        // pid 1 belongs to root; unprivileged callers get EPERM
        assert!(is_process_running(1));
    }
}
