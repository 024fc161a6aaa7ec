//! Engine supervisor - Engine on/off state, health loop and the core process slot

use std::io;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::error::CoreError;
use super::inspector::{ProcessInspector, SystemInspector};
use super::launcher::{ActiveCore, CoreLauncher};
use super::log::{EngineLog, LogCallback};
use super::profile::SavedConfig;
use super::router::{ConfigRouter, CoreFamily};
use super::settings::{EngineSettings, Settings};
use super::terminator::{terminate_session, terminate_tree};

const ENGINE_ON: &str = "Engine is ON";
const ENGINE_OFF: &str = "Engine is OFF";

/// Extra time, on top of the terminate timeout, allowed for reaping a killed core
const REAP_GRACE: Duration = Duration::from_secs(1);

/// A request to start a core: which core, and the raw config text
#[derive(Debug, Clone, Default)]
pub struct CoreRequest {
    /// Core identifier; `None` means "auto"
    pub core: Option<String>,
    pub raw: Option<String>,
}

impl CoreRequest {
    pub fn new(core: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            core: Some(core.into()),
            raw: Some(raw.into()),
        }
    }
}

impl From<&SavedConfig> for CoreRequest {
    fn from(cfg: &SavedConfig) -> Self {
        Self::new(cfg.core.clone(), cfg.raw.clone())
    }
}

/// Details of the running core, if any
#[derive(Debug, Clone, Serialize)]
pub struct CoreInfo {
    pub name: String,
    pub pid: u32,
    pub run_id: String,
    pub config_path: String,
    pub uptime_secs: i64,
}

/// Snapshot returned by [`EngineSupervisor::status`]
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub core_process_alive: bool,
    pub message: String,
    pub core: Option<CoreInfo>,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "engine: {} | core: {} | {}",
            if self.running { "on" } else { "off" },
            if self.core_process_alive { "alive" } else { "down" },
            self.message
        )?;
        if let Some(core) = &self.core {
            write!(
                f,
                " | {} pid {} up {}s ({})",
                core.name, core.pid, core.uptime_secs, core.config_path
            )?;
        }
        Ok(())
    }
}

/// The single core process slot.
///
/// `Spawning` and `Terminating` are held only while the owning call does its
/// OS work outside the lock; both count as occupied. A `Running` core has
/// never been waited on: whoever observes its exit takes it out of the slot.
#[derive(Debug, Default)]
enum CoreSlot {
    #[default]
    Empty,
    Spawning {
        cancelled: bool,
    },
    Running(ActiveCore),
    Terminating,
}

impl CoreSlot {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Spawning { .. } | Self::Terminating)
    }
}

/// Slot plus the condition variable signalled on every slot transition
#[derive(Debug, Default)]
struct SharedSlot {
    slot: Mutex<CoreSlot>,
    changed: Condvar,
}

impl SharedSlot {
    fn lock(&self) -> MutexGuard<'_, CoreSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, value: CoreSlot) {
        *self.lock() = value;
        self.changed.notify_all();
    }

    /// Block until no spawn or termination is in flight, at most `timeout`
    fn wait_settled(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| s.is_transient())
            .unwrap_or_else(PoisonError::into_inner);
        !guard.is_transient()
    }

    /// Take the core out of the slot if it has exited on its own
    fn take_exited(&self) -> Option<(ActiveCore, io::Result<ExitStatus>)> {
        let mut slot = self.lock();
        let CoreSlot::Running(active) = &mut *slot else {
            return None;
        };
        let status = active.exit_status()?;
        let CoreSlot::Running(active) = mem::take(&mut *slot) else {
            return None;
        };
        drop(slot);
        self.changed.notify_all();
        Some((active, status))
    }
}

/// Background health-check thread
struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    /// Disconnects when the thread exits
    done: Receiver<()>,
}

struct EngineState {
    running: bool,
    message: String,
    worker: Option<Worker>,
}

/// Everything the health loop shares with the supervisor
struct Shared {
    state: Mutex<EngineState>,
    core: SharedSlot,
    inspector: Arc<dyn ProcessInspector>,
    log: EngineLog,
    timing: EngineSettings,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_message(&self) -> String {
        if self.state().running {
            ENGINE_ON.to_string()
        } else {
            ENGINE_OFF.to_string()
        }
    }

    fn set_message(&self, message: String) {
        self.state().message = message;
    }

    /// Report a core that exited by itself and stop whatever it left behind
    fn core_exited(&self, active: ActiveCore, status: io::Result<ExitStatus>) {
        self.set_message(self.idle_message());
        match status {
            Ok(status) => self.log.error(format!(
                "VPN core process exited unexpectedly ({} PID {}, {}).",
                active.name,
                active.pid(),
                status
            )),
            Err(e) => self.log.error(format!(
                "VPN core process {} lost; status check failed: {}",
                active.pid(),
                e
            )),
        }
        self.sweep_session(&active);
    }

    /// Terminate the process tree of `active` and collect its exit status
    fn reap(&self, mut active: ActiveCore) {
        let pid = active.pid();
        if let Some(status) = active.exit_status() {
            // The pid is released now; signalling it could hit a stranger
            debug!("Core process {} already exited ({:?})", pid, status);
            self.sweep_session(&active);
            return;
        }

        let report = terminate_tree(self.inspector.as_ref(), pid, self.timing.terminate_timeout());
        if !report.killed.is_empty() {
            self.log.warn(format!(
                "Force-killed {} process(es) that ignored terminate: {:?}",
                report.killed.len(),
                report.killed
            ));
        }
        if !active.reap(REAP_GRACE) {
            // Fall back to killing the direct child; it is unreaped, so the pid is still ours
            self.log
                .error(format!("Failed to stop core process {}; killing directly.", pid));
            let _ = self.inspector.kill(pid);
            if !active.reap(REAP_GRACE) {
                self.log.error(format!("Core process {} could not be reaped.", pid));
            }
        }
        self.sweep_session(&active);
    }

    /// Stop descendants that escaped the tree walk by being reparented
    fn sweep_session(&self, active: &ActiveCore) {
        let Some(sid) = active.session() else {
            return;
        };
        let report =
            terminate_session(self.inspector.as_ref(), sid, self.timing.terminate_timeout());
        if !report.descendants.is_empty() {
            self.log.warn(format!(
                "Stopped {} leftover process(es) from the {} session.",
                report.descendants.len(),
                active.name
            ));
        }
    }
}

/// Owns the engine lifecycle and at most one external core process.
///
/// All public operations report failure as `false` (or a [`CoreError`]) plus a
/// log line; none of them panic.
pub struct EngineSupervisor {
    shared: Arc<Shared>,
    /// Serializes start_engine/stop_engine
    lifecycle: Mutex<()>,
    router: ConfigRouter,
    launcher: CoreLauncher,
}

impl EngineSupervisor {
    /// Create a supervisor rooted at `root` (where `cores/`, `configs/` and `logs/` live)
    pub fn new(root: &Path, settings: &Settings, log: EngineLog) -> Self {
        Self::with_inspector(root, settings, log, Arc::new(SystemInspector::new()))
    }

    pub fn with_inspector(
        root: &Path,
        settings: &Settings,
        log: EngineLog,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    running: false,
                    message: ENGINE_OFF.to_string(),
                    worker: None,
                }),
                core: SharedSlot::default(),
                inspector,
                log,
                timing: settings.engine.clone(),
            }),
            lifecycle: Mutex::new(()),
            router: ConfigRouter::new(root, settings.core_updates.paths.clone()),
            launcher: CoreLauncher::new(root),
        }
    }

    /// Mirror every log line to `cb`, replacing any previous callback
    pub fn set_log_callback(&self, cb: Option<LogCallback>) {
        self.shared.log.set_callback(cb);
    }

    /// Snapshot of engine and core state.
    ///
    /// Only blocks when it finds the core dead and cleans up after it.
    pub fn status(&self) -> EngineStatus {
        if let Some((active, status)) = self.shared.core.take_exited() {
            self.shared.core_exited(active, status);
        }

        let (core_process_alive, core) = match &*self.shared.core.lock() {
            CoreSlot::Running(active) => (
                true,
                Some(CoreInfo {
                    name: active.name.clone(),
                    pid: active.pid(),
                    run_id: active.id.to_string(),
                    config_path: active.config_path.display().to_string(),
                    uptime_secs: active.uptime().num_seconds(),
                }),
            ),
            CoreSlot::Terminating => (true, None),
            CoreSlot::Empty | CoreSlot::Spawning { .. } => (false, None),
        };

        let state = self.shared.state();
        EngineStatus {
            running: state.running,
            core_process_alive,
            message: state.message.clone(),
            core,
        }
    }

    /// Turn the engine on and start the health loop. `false` if already on.
    pub fn start_engine(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let log = &self.shared.log;

        if self.shared.state().running {
            log.warn("Engine already running.");
            return false;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel::<()>();
        let spawned = thread::Builder::new().name("umbra-engine-loop".into()).spawn({
            let stop = Arc::clone(&stop);
            let shared = Arc::clone(&self.shared);
            move || {
                let _done = done_tx;
                health_loop(&shared, &stop);
            }
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                log.error(format!("Failed to start engine loop: {}", e));
                return false;
            }
        };

        {
            let mut state = self.shared.state();
            state.running = true;
            state.message = ENGINE_ON.to_string();
            state.worker = Some(Worker { handle, stop, done });
        }
        log.info("Engine started.");
        true
    }

    /// Stop the core (if any), then the health loop. `false` if already off.
    pub fn stop_engine(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let log = &self.shared.log;

        let worker = {
            let mut state = self.shared.state();
            if !state.running {
                return false;
            }
            state.worker.take()
        };

        log.info("Stopping engine...");
        if let Some(worker) = &worker {
            worker.stop.store(true, Ordering::SeqCst);
        }

        // Core goes first so the loop cannot race us on the slot
        self.stop_core_process();

        if let Some(worker) = worker {
            worker.handle.thread().unpark();
            match worker.done.recv_timeout(self.shared.timing.join_timeout()) {
                Err(RecvTimeoutError::Timeout) => {
                    log.warn("Engine loop did not stop in time; continuing shutdown.");
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        log.error("Engine loop panicked.");
                    }
                }
            }
        }

        {
            let mut state = self.shared.state();
            state.running = false;
            state.message = ENGINE_OFF.to_string();
        }
        log.info("Engine stopped.");
        true
    }

    /// Start a core for `req`. `false` (with a logged reason) on any failure.
    pub fn start_core_with_config(&self, req: &CoreRequest) -> bool {
        self.launch_core(req).is_ok()
    }

    /// Typed variant of [`Self::start_core_with_config`]; returns the core's PID.
    /// Failures are logged before being returned.
    pub fn launch_core(&self, req: &CoreRequest) -> Result<u32, CoreError> {
        let result = self.try_launch(req);
        match &result {
            Ok(_) => {}
            Err(e @ (CoreError::AlreadyRunning | CoreError::Cancelled)) => {
                self.shared.log.warn(e.to_string())
            }
            Err(e) => self.shared.log.error(e.to_string()),
        }
        result
    }

    fn try_launch(&self, req: &CoreRequest) -> Result<u32, CoreError> {
        let raw = req.raw.as_deref().map(str::trim).unwrap_or_default();
        if raw.is_empty() {
            return Err(CoreError::EmptyConfig);
        }

        self.reserve_slot()?;
        self.spawn_reserved(req.core.as_deref().unwrap_or("auto"), raw)
    }

    /// Stop the core process if there is one. Always `true`.
    pub fn stop_core(&self) -> bool {
        self.stop_core_process();
        true
    }

    /// Stop everything; safe to call any number of times
    pub fn shutdown(&self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.stop_engine();
            self.stop_core_process();
        }));
        if outcome.is_err() {
            debug!("Shutdown recovered from a panic");
        }
    }

    /// Claim the empty slot for a spawn. A core that exited on its own is
    /// cleaned up and its slot reused.
    fn reserve_slot(&self) -> Result<(), CoreError> {
        let mut slot = self.shared.core.lock();
        let exited = match &mut *slot {
            CoreSlot::Empty => None,
            CoreSlot::Running(active) => match active.exit_status() {
                Some(status) => Some(status),
                None => return Err(CoreError::AlreadyRunning),
            },
            CoreSlot::Spawning { .. } | CoreSlot::Terminating => {
                return Err(CoreError::AlreadyRunning)
            }
        };
        let previous = mem::replace(&mut *slot, CoreSlot::Spawning { cancelled: false });
        drop(slot);

        if let (CoreSlot::Running(active), Some(status)) = (previous, exited) {
            self.shared.core_exited(active, status);
        }
        Ok(())
    }

    /// Resolve and spawn into a slot already claimed by [`Self::reserve_slot`]
    fn spawn_reserved(&self, core: &str, raw: &str) -> Result<u32, CoreError> {
        let spec = self.router.resolve(core);
        let launched = match spec.family {
            CoreFamily::Unknown => Err(CoreError::UnsupportedCore(spec.name.clone())),
            family if family.is_implemented() => self.launcher.start_singbox(&spec, raw),
            _ => Err(self.launcher.start_unsupported(&spec)),
        };

        let active = match launched {
            Ok(active) => active,
            Err(e) => {
                self.shared.core.set(CoreSlot::Empty);
                return Err(e);
            }
        };

        let pid = active.pid();
        let name = active.name.clone();
        let mut slot = self.shared.core.lock();
        if matches!(*slot, CoreSlot::Spawning { cancelled: false }) {
            *slot = CoreSlot::Running(active);
            drop(slot);
            self.shared.core.changed.notify_all();
            self.shared.set_message(format!("Core running: {}", name));
            self.shared
                .log
                .info(format!("{} core started (PID {}).", name, pid));
            return Ok(pid);
        }
        *slot = CoreSlot::Terminating;
        drop(slot);

        self.shared.log.info(format!(
            "Stop requested during start; reaping {} (PID {}).",
            name, pid
        ));
        self.shared.reap(active);
        self.shared.core.set(CoreSlot::Empty);
        Err(CoreError::Cancelled)
    }

    /// Terminate the active core and wait until the slot is empty
    fn stop_core_process(&self) {
        let active = {
            let mut slot = self.shared.core.lock();
            match mem::replace(&mut *slot, CoreSlot::Terminating) {
                CoreSlot::Running(active) => Some(active),
                CoreSlot::Spawning { .. } => {
                    *slot = CoreSlot::Spawning { cancelled: true };
                    None
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };

        match active {
            Some(active) => {
                self.shared.log.info("Stopping VPN core process...");
                self.shared.reap(active);
                self.shared.core.set(CoreSlot::Empty);
                self.shared.set_message(self.shared.idle_message());
            }
            None => {
                // Someone else is mid-spawn or mid-terminate; let them finish
                let limit = self.shared.timing.terminate_timeout() + REAP_GRACE * 2;
                if !self.shared.core.wait_settled(limit) {
                    self.shared
                        .log
                        .error("Timed out waiting for the core process slot to settle.");
                }
            }
        }
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Local process-state polling only; no network activity.
fn health_loop(shared: &Shared, stop: &AtomicBool) {
    let tick = shared.timing.tick_interval();
    debug!("Engine loop running every {:?}", tick);
    while !stop.load(Ordering::SeqCst) {
        if let Some((active, status)) = shared.core.take_exited() {
            shared.core_exited(active, status);
        }
        thread::park_timeout(tick);
    }
    debug!("Engine loop exiting");
}
