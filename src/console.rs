//! Interactive console - Line commands driving a running supervisor

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::profile::SavedConfig;
use crate::core::{CoreError, CoreRequest, EngineSupervisor, ErrorKind};
use crate::platform;

/// One console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    StartEngine,
    StopEngine,
    StartCore { file: PathBuf, core: Option<String> },
    StopCore,
    Ports,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  status                    engine and core state
  start-engine | stop-engine
  start-core FILE [CORE]    start a core from a config file (core auto-detected)
  stop-core
  ports                     listening TCP ports
  quit";

/// Parse a console line. `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let cmd = match verb.to_lowercase().as_str() {
        "status" | "st" => Command::Status,
        "start-engine" | "on" => Command::StartEngine,
        "stop-engine" | "off" => Command::StopEngine,
        "start-core" | "start" => {
            let file = words.next().context("usage: start-core FILE [CORE]")?;
            Command::StartCore {
                file: PathBuf::from(file),
                core: words.next().map(str::to_string),
            }
        }
        "stop-core" | "stop" => Command::StopCore,
        "ports" => Command::Ports,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => anyhow::bail!("unknown command '{}'; try 'help'", other),
    };
    Ok(Some(cmd))
}

/// Build a start request from a config file, detecting the core if not given
pub fn request_from_file(path: &Path, core: Option<String>) -> Result<CoreRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut profile = SavedConfig::from_raw(name, raw);
    if let Some(core) = core {
        profile.core = core;
    }
    Ok(CoreRequest::from(&profile))
}

/// What the user can do about a failed start
fn start_failure_hint(err: &CoreError) -> &'static str {
    match err.kind() {
        ErrorKind::UserInput => "Check the config and try again.",
        ErrorKind::ResourceUnavailable => {
            "Install the core, or set its path under core_updates.paths in configs/settings.json."
        }
        ErrorKind::Unimplemented => "This core cannot run yet; use a sing-box config instead.",
        ErrorKind::UnsupportedCore => "Known cores: singbox, clash, openvpn, openconnect.",
        ErrorKind::SpawnFailure => "The OS refused to start the core; see logs/umbra.log.",
    }
}

/// Read commands until `quit` or end of input
pub fn run(engine: &EngineSupervisor, input: impl BufRead, mut out: impl Write) -> Result<()> {
    writeln!(out, "{}", HELP)?;
    for line in input.lines() {
        let line = line.context("Failed to read console input")?;
        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                writeln!(out, "{:#}", e)?;
                continue;
            }
        };

        match cmd {
            Command::Status => writeln!(out, "{}", engine.status())?,
            Command::StartEngine => {
                engine.start_engine();
            }
            Command::StopEngine => {
                engine.stop_engine();
            }
            Command::StartCore { file, core } => match request_from_file(&file, core) {
                Ok(req) => match engine.launch_core(&req) {
                    Ok(pid) => writeln!(out, "Core started (PID {}).", pid)?,
                    Err(e) => writeln!(out, "{} {}", e, start_failure_hint(&e))?,
                },
                Err(e) => writeln!(out, "{:#}", e)?,
            },
            Command::StopCore => {
                engine.stop_core();
                writeln!(out, "Core stop requested.")?;
            }
            Command::Ports => {
                for port in platform::listening_ports(8) {
                    writeln!(out, "{:>5}  {:>7}  {}", port.port, port.pid, port.name)?;
                }
            }
            Command::Help => writeln!(out, "{}", HELP)?,
            Command::Quit => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineLog, Settings};
    use tempfile::tempdir;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("STATUS").unwrap(), Some(Command::Status));
        assert_eq!(
            parse_command("start-core cfg.json openvpn").unwrap(),
            Some(Command::StartCore {
                file: PathBuf::from("cfg.json"),
                core: Some("openvpn".into())
            })
        );
        assert!(parse_command("start-core").is_err());
        assert!(parse_command("reboot").is_err());
    }

    #[test]
    fn request_detects_core_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.ovpn");
        std::fs::write(&path, "client\n# openvpn\n").unwrap();

        let req = request_from_file(&path, None).unwrap();
        assert_eq!(req.core.as_deref(), Some("openvpn"));

        let req = request_from_file(&path, Some("singbox".into())).unwrap();
        assert_eq!(req.core.as_deref(), Some("singbox"));
        assert!(request_from_file(&dir.path().join("nope"), None).is_err());
    }

    #[test]
    fn console_session_toggles_engine() {
        let dir = tempdir().unwrap();
        let engine = EngineSupervisor::new(dir.path(), &Settings::default(), EngineLog::new());
        let input = "start-engine\nstatus\nbogus\nstop-engine\nquit\nstart-engine\n";
        let mut out = Vec::new();

        run(&engine, input.as_bytes(), &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("engine: on"));
        assert!(out.contains("unknown command 'bogus'"));
        // Input after quit is ignored
        assert!(!engine.status().running);
    }

    #[test]
    fn failed_start_prints_remedy() {
        let dir = tempdir().unwrap();
        let engine = EngineSupervisor::new(dir.path(), &Settings::default(), EngineLog::new());
        let ovpn = dir.path().join("client.ovpn");
        std::fs::write(&ovpn, "client\n# openvpn\n").unwrap();
        let ssh = dir.path().join("jump.txt");
        std::fs::write(&ssh, "ssh user@host -p 22").unwrap();
        let input = format!(
            "start-core {}\nstart-core {}\nquit\n",
            ovpn.display(),
            ssh.display()
        );
        let mut out = Vec::new();

        run(&engine, input.as_bytes(), &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("openvpn binary path is not configured. Install the core"));
        assert!(out.contains("Unsupported core: ssh Known cores"));
    }
}
