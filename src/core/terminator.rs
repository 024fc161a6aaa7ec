//! Process tree termination - Graceful terminate, bounded wait, then kill

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::inspector::ProcessInspector;

/// How often the wait phase re-checks the signalled processes
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What happened during a tree termination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Root (or session leader) was already gone when termination started
    pub already_exited: bool,
    /// Descendants found at termination time, children first
    pub descendants: Vec<u32>,
    /// Processes that ignored the graceful request and were force-killed
    pub killed: Vec<u32>,
}

/// Terminate `root` and all of its descendants.
///
/// Descendants are asked to exit before the root. Anything still alive after
/// `timeout` is force-killed. Best-effort throughout: per-process failures are
/// logged and never returned.
pub fn terminate_tree(
    inspector: &dyn ProcessInspector,
    root: u32,
    timeout: Duration,
) -> TerminationReport {
    if !inspector.exists(root) {
        debug!("Process {} already exited", root);
        return TerminationReport {
            already_exited: true,
            ..Default::default()
        };
    }

    let descendants = match inspector.children(root) {
        Ok(children) => children,
        Err(e) => {
            warn!("Could not enumerate children of {}: {:#}", root, e);
            Vec::new()
        }
    };

    let mut signalled: Vec<u32> = descendants.clone();
    signalled.push(root);
    let killed = terminate_then_kill(inspector, &signalled, timeout);

    TerminationReport {
        already_exited: false,
        descendants,
        killed,
    }
}

/// Terminate whatever is left of the session led by `sid`.
///
/// Once a core has exited its orphans are reparented away from it, so they can
/// only be found by session. `descendants` lists the members found.
pub fn terminate_session(
    inspector: &dyn ProcessInspector,
    sid: u32,
    timeout: Duration,
) -> TerminationReport {
    let members = match inspector.session_members(sid) {
        Ok(members) => members,
        Err(e) => {
            warn!("Could not list session {}: {:#}", sid, e);
            Vec::new()
        }
    };
    if members.is_empty() {
        return TerminationReport {
            already_exited: true,
            ..Default::default()
        };
    }

    debug!("Session {} still has {:?}", sid, members);
    let killed = terminate_then_kill(inspector, &members, timeout);
    TerminationReport {
        already_exited: true,
        descendants: members,
        killed,
    }
}

/// Terminate `pids` in order, wait up to `timeout`, kill survivors; returns the killed
fn terminate_then_kill(inspector: &dyn ProcessInspector, pids: &[u32], timeout: Duration) -> Vec<u32> {
    for &pid in pids {
        if let Err(e) = inspector.terminate(pid) {
            debug!("Terminate {} failed: {:#}", pid, e);
        }
    }

    let survivors = wait_for_exit(inspector, pids, timeout);
    for &pid in &survivors {
        warn!("Process {} ignored terminate; killing", pid);
        if let Err(e) = inspector.kill(pid) {
            debug!("Kill {} failed: {:#}", pid, e);
        }
    }
    survivors
}

/// Poll until every pid has exited or the timeout elapses; returns survivors
fn wait_for_exit(inspector: &dyn ProcessInspector, pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|&pid| inspector.is_alive(pid))
            .collect();

        if alive.is_empty() {
            return alive;
        }
        let now = Instant::now();
        if now >= deadline {
            return alive;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use anyhow::Result;

    #[derive(Debug, Clone)]
    struct FakeProc {
        parent: Option<u32>,
        session: Option<u32>,
        alive: bool,
        ignores_terminate: bool,
    }

    /// In-memory process table recording every signal sent
    #[derive(Default)]
    pub(crate) struct FakeInspector {
        procs: Mutex<HashMap<u32, FakeProc>>,
        pub(crate) calls: Mutex<Vec<String>>,
        pub(crate) fail_children: bool,
    }

    impl FakeInspector {
        /// Add a live process; it joins its parent's session, if any
        pub(crate) fn spawn(&self, pid: u32, parent: Option<u32>, ignores_terminate: bool) {
            let mut procs = self.procs.lock().unwrap();
            let session = parent.and_then(|p| procs.get(&p)).and_then(|p| p.session);
            procs.insert(
                pid,
                FakeProc {
                    parent,
                    session,
                    alive: true,
                    ignores_terminate,
                },
            );
        }

        /// Make `pid` the leader of its own session
        pub(crate) fn setsid(&self, pid: u32) {
            if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
                p.session = Some(pid);
            }
        }

        /// Reparent `pid` to nobody, as after its parent died
        fn orphan(&self, pid: u32) {
            if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
                p.parent = None;
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessInspector for FakeInspector {
        fn exists(&self, pid: u32) -> bool {
            self.procs.lock().unwrap().contains_key(&pid)
        }

        fn children(&self, pid: u32) -> Result<Vec<u32>> {
            if self.fail_children {
                anyhow::bail!("access denied");
            }
            let procs = self.procs.lock().unwrap();
            let mut out = Vec::new();
            let mut frontier = vec![pid];
            while let Some(p) = frontier.pop() {
                let mut kids: Vec<u32> = procs
                    .iter()
                    .filter(|(_, fp)| fp.parent == Some(p))
                    .map(|(k, _)| *k)
                    .collect();
                kids.sort();
                out.extend(&kids);
                frontier.extend(kids);
            }
            Ok(out)
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            self.record(format!("term {pid}"));
            let mut procs = self.procs.lock().unwrap();
            match procs.get_mut(&pid) {
                Some(p) if p.alive => {
                    if !p.ignores_terminate {
                        p.alive = false;
                    }
                    Ok(())
                }
                _ => anyhow::bail!("no such process"),
            }
        }

        fn kill(&self, pid: u32) -> Result<()> {
            self.record(format!("kill {pid}"));
            let mut procs = self.procs.lock().unwrap();
            match procs.get_mut(&pid) {
                Some(p) if p.alive => {
                    p.alive = false;
                    Ok(())
                }
                _ => anyhow::bail!("no such process"),
            }
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.procs
                .lock()
                .unwrap()
                .get(&pid)
                .map(|p| p.alive)
                .unwrap_or(false)
        }

        fn session_members(&self, sid: u32) -> Result<Vec<u32>> {
            let procs = self.procs.lock().unwrap();
            let mut members: Vec<u32> = procs
                .iter()
                .filter(|(_, p)| p.alive && p.session == Some(sid))
                .map(|(pid, _)| *pid)
                .collect();
            members.sort();
            Ok(members)
        }
    }

    #[test]
    fn missing_root_is_a_no_op() {
        let fake = FakeInspector::default();
        let report = terminate_tree(&fake, 100, Duration::from_millis(100));
        assert!(report.already_exited);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn children_are_signalled_before_root() {
        let fake = FakeInspector::default();
        fake.spawn(100, None, false);
        fake.spawn(101, Some(100), false);
        fake.spawn(102, Some(101), false);

        let report = terminate_tree(&fake, 100, Duration::from_millis(200));

        assert_eq!(report.descendants, vec![101, 102]);
        assert!(report.killed.is_empty());
        assert_eq!(fake.calls(), vec!["term 101", "term 102", "term 100"]);
    }

    #[test]
    fn stubborn_processes_are_killed_after_timeout() {
        let fake = FakeInspector::default();
        fake.spawn(100, None, false);
        fake.spawn(101, Some(100), true);

        let started = Instant::now();
        let report = terminate_tree(&fake, 100, Duration::from_millis(150));

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(report.killed, vec![101]);
        assert_eq!(fake.calls().last().unwrap(), "kill 101");
        assert!(!fake.is_alive(101));
    }

    #[test]
    fn enumeration_failure_still_terminates_root() {
        let fake = FakeInspector {
            fail_children: true,
            ..Default::default()
        };
        fake.spawn(100, None, false);

        let report = terminate_tree(&fake, 100, Duration::from_millis(100));

        assert!(report.descendants.is_empty());
        assert_eq!(fake.calls(), vec!["term 100"]);
        assert!(!fake.is_alive(100));
    }

    #[test]
    fn exited_child_does_not_abort_termination() {
        let fake = FakeInspector::default();
        fake.spawn(100, None, false);
        fake.spawn(101, Some(100), false);
        fake.kill(101).unwrap();

        let report = terminate_tree(&fake, 100, Duration::from_millis(100));

        assert!(report.killed.is_empty());
        assert!(!fake.is_alive(100));
    }

    #[test]
    fn orphans_are_found_through_the_session() {
        let fake = FakeInspector::default();
        fake.spawn(100, None, false);
        fake.setsid(100);
        fake.spawn(101, Some(100), false);
        fake.spawn(102, Some(101), true);
        fake.spawn(200, None, false);
        fake.kill(100).unwrap();
        fake.orphan(101);

        let report = terminate_session(&fake, 100, Duration::from_millis(100));

        assert_eq!(report.descendants, vec![101, 102]);
        assert_eq!(report.killed, vec![102]);
        assert!(!fake.is_alive(101));
        assert!(fake.is_alive(200));
        assert!(!fake.calls().iter().any(|c| c.ends_with(" 200")));
    }

    #[test]
    fn empty_session_sends_nothing() {
        let fake = FakeInspector::default();
        fake.spawn(100, None, false);

        let report = terminate_session(&fake, 100, Duration::from_millis(100));

        assert!(report.descendants.is_empty());
        assert!(fake.calls().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn real_shell_tree_is_reaped() {
        use super::super::inspector::SystemInspector;
        use std::process::Command;

        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .unwrap();
        thread::sleep(Duration::from_millis(200));

        let inspector = SystemInspector::new();
        let report = terminate_tree(&inspector, child.id(), Duration::from_secs(3));
        child.wait().unwrap();

        assert!(!report.already_exited);
        assert_eq!(report.descendants.len(), 2);
        for pid in report.descendants {
            assert!(!inspector.is_alive(pid));
        }
    }
}
