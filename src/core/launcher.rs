//! Core launching - Materialize the active config and spawn the core binary

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::CoreError;
use super::router::CoreSpec;

/// Unique identifier for one run of a core process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreRunId(pub Uuid);

impl CoreRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CoreRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CoreRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A running core process owned by the supervisor
#[derive(Debug)]
pub struct ActiveCore {
    pub id: CoreRunId,
    /// Human readable core name, e.g. "sing-box"
    pub name: String,
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Session the core leads; unix only
    session: Option<u32>,
    child: Child,
}

impl ActiveCore {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit check. Errors while polling count as exited.
    pub fn exit_status(&mut self) -> Option<Result<ExitStatus, std::io::Error>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(Ok(status)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Session id shared by the core and everything it starts
    pub fn session(&self) -> Option<u32> {
        self.session
    }

    /// Collect the exit status after termination, waiting at most `grace`.
    /// Returns false if the process is somehow still running.
    pub fn reap(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.exit_status().is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// Starts core binaries. Holds no per-run state; the caller owns the result.
#[derive(Debug, Clone)]
pub struct CoreLauncher {
    root: PathBuf,
}

impl CoreLauncher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the active config file for a core
    pub fn active_config_path(&self, core: &str) -> PathBuf {
        self.root.join("configs").join(format!("active_{}.json", core))
    }

    /// Validate, materialize and run a sing-box config
    pub fn start_singbox(&self, spec: &CoreSpec, raw: &str) -> Result<ActiveCore, CoreError> {
        if !raw.trim_start().starts_with('{') {
            return Err(CoreError::NotJson {
                core: "Sing-box".into(),
            });
        }

        let binary = spec.binary.as_ref().ok_or_else(|| CoreError::BinaryNotFound {
            core: "Sing-box".into(),
        })?;

        let config_path = self.write_active_config(&spec.name, raw)?;

        info!("Spawning sing-box from {:?}", binary);
        let mut cmd = Command::new(binary);
        cmd.arg("run")
            .arg("-c")
            .arg(&config_path)
            .current_dir(&self.root)
            .stdin(Stdio::null());

        // New session, so orphans of a crashed core can still be found
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        match self.core_log(&spec.name) {
            Some((out, err)) => {
                cmd.stdout(out).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|source| CoreError::Spawn {
            core: "sing-box".into(),
            source,
        })?;

        let session = cfg!(unix).then(|| child.id());
        let core = ActiveCore {
            id: CoreRunId::new(),
            name: "sing-box".into(),
            config_path,
            started_at: Utc::now(),
            session,
            child,
        };
        info!("Spawned sing-box run {} with PID {}", core.id, core.pid());
        Ok(core)
    }

    /// Recognized core without a runtime. Never spawns anything.
    pub fn start_unsupported(&self, spec: &CoreSpec) -> CoreError {
        match &spec.binary {
            Some(binary) => CoreError::Unimplemented {
                name: spec.name.clone(),
                binary: binary.clone(),
            },
            None => CoreError::MissingBinary {
                name: spec.name.clone(),
            },
        }
    }

    /// Write the config through a temp file and rename it into place
    fn write_active_config(&self, core: &str, raw: &str) -> Result<PathBuf, CoreError> {
        let path = self.active_config_path(core);
        let tmp = path.with_extension("json.tmp");

        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = File::create(&tmp)?;
            file.write_all(raw.as_bytes())?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &path)
        };

        write().map_err(|source| {
            let _ = fs::remove_file(&tmp);
            CoreError::ActiveConfigWrite {
                path: path.clone(),
                source,
            }
        })?;

        debug!("Active config written to {:?}", path);
        Ok(path)
    }

    /// Append-mode handles for the core's stdout/stderr under `logs/`
    fn core_log(&self, core: &str) -> Option<(File, File)> {
        let path = self.root.join("logs").join(format!("{}.log", core));
        let open = |p: &Path| -> std::io::Result<(File, File)> {
            if let Some(dir) = p.parent() {
                fs::create_dir_all(dir)?;
            }
            let out = OpenOptions::new().create(true).append(true).open(p)?;
            let err = out.try_clone()?;
            Ok((out, err))
        };
        match open(&path) {
            Ok(handles) => Some(handles),
            Err(e) => {
                warn!("Core output will be discarded; cannot open {:?}: {}", path, e);
                None
            }
        }
    }
}
