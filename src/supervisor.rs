//! Memory-bounded supervision of the bridged child.
//!
//! The supervisor owns at most one child at a time. After every exchange it
//! measures the child's resident memory; once the ceiling is crossed the child
//! is terminated and the next dispatch spawns a fresh one. The reply that was
//! already produced is always returned, so a respawn never delays or retries
//! the request that triggered it.
//!
//! CHANGELOG:
//! - 03/02/2026 - Publish the live child's PID for the signal thread
//! - 03/02/2026 - Initial implementation

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bridge::{CommandSpawner, Exchange, Spawn};
use crate::config::{DaemonConfig, Dialect};
use crate::encoder;
use crate::error::BridgeError;
use crate::memory::{MemoryProbe, SysinfoProbe};

/// Supervisor over a real command and the OS process table.
pub type ProcessSupervisor = Supervisor<CommandSpawner, SysinfoProbe>;

pub struct Supervisor<S: Spawn, P: MemoryProbe> {
    dialect: Dialect,
    memory_limit: u64,
    spawner: S,
    probe: P,
    child: Option<S::Child>,
    /// First reply to the empty bootstrap line, kept for the daemon's lifetime.
    banner: Option<String>,
    respawns: u64,
    /// PID of the live child, 0 when there is none.
    child_pid: Arc<AtomicU32>,
}

impl ProcessSupervisor {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Supervisor::new(
            config.dialect,
            config.memory_limit,
            CommandSpawner::from_config(config),
            SysinfoProbe::new(),
        )
    }
}

impl<S: Spawn, P: MemoryProbe> Supervisor<S, P> {
    pub fn new(dialect: Dialect, memory_limit: u64, spawner: S, probe: P) -> Self {
        Self {
            dialect,
            memory_limit,
            spawner,
            probe,
            child: None,
            banner: None,
            respawns: 0,
            child_pid: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// PID of the live child, if one is running.
    pub fn current_pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.pid())
    }

    /// Number of children discarded because of the memory ceiling.
    pub fn respawns(&self) -> u64 {
        self.respawns
    }

    /// Shared view of the live child's PID (0 when none), readable from
    /// other threads while an exchange is blocked.
    pub fn pid_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.child_pid)
    }

    /// Spawn the child now instead of on the first request.
    pub fn start(&mut self) -> Result<u32, BridgeError> {
        self.ensure_child().map(|c| c.pid())
    }

    /// Drain the child's startup output with one empty exchange.
    ///
    /// Memoized: later calls return the cached reply without touching the
    /// child.
    pub fn bootstrap(&mut self) -> Result<String, BridgeError> {
        self.ensure_child()?;
        if let Some(banner) = &self.banner {
            return Ok(banner.clone());
        }

        let reply = self.exchange_or_discard("")?;
        Ok(self.banner.insert(reply).clone())
    }

    /// Encode `payload`, run one exchange, then enforce the memory ceiling.
    pub fn dispatch(&mut self, payload: &[u8]) -> Result<String, BridgeError> {
        let line = encoder::encode(self.dialect, payload);
        let pid = self.ensure_child()?.pid();

        let response = self.exchange_or_discard(&line)?;
        debug!(pid, request_bytes = payload.len(), response_bytes = response.len(), "exchange done");

        if self.memory_exceeded(pid) {
            info!(pid, limit = self.memory_limit, "child over memory limit, scheduling respawn");
            self.terminate();
            self.respawns += 1;
        }

        Ok(response)
    }

    /// Kill the current child, if any. The next dispatch spawns a new one.
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            self.child_pid.store(0, Ordering::SeqCst);
            child.terminate();
        }
    }

    fn ensure_child(&mut self) -> Result<&mut S::Child, BridgeError> {
        let child = match self.child.take() {
            Some(child) => child,
            None => self.spawn_child()?,
        };
        Ok(self.child.insert(child))
    }

    fn spawn_child(&mut self) -> Result<S::Child, BridgeError> {
        let mut child = self.spawner.spawn()?;
        info!(pid = child.pid(), dialect = %self.dialect, "spawned child process");
        self.child_pid.store(child.pid(), Ordering::SeqCst);

        if self.dialect.needs_bootstrap() {
            match child.exchange("") {
                Ok(reply) => {
                    debug!(pid = child.pid(), reply = %reply, "child bootstrapped");
                    self.banner.get_or_insert(reply);
                }
                Err(e) => {
                    self.child_pid.store(0, Ordering::SeqCst);
                    child.terminate();
                    return Err(e);
                }
            }
        }

        Ok(child)
    }

    /// Exchange with the live child; on failure the child is discarded so the
    /// next request starts from a fresh process.
    fn exchange_or_discard(&mut self, line: &str) -> Result<String, BridgeError> {
        let child = self.ensure_child()?;
        let pid = child.pid();

        match child.exchange(line) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.is_child_gone() {
                    warn!(pid, error = %e, "child went away, discarding it");
                } else {
                    error!(pid, error = %e, "exchange failed, discarding child");
                }
                self.terminate();
                Err(e)
            }
        }
    }

    fn memory_exceeded(&mut self, pid: u32) -> bool {
        match self.probe.resident_bytes(pid) {
            Some(rss) => {
                debug!(pid, rss, "measured child memory");
                rss > self.memory_limit
            }
            None => {
                warn!(pid, "could not measure child memory");
                false
            }
        }
    }
}

impl<S: Spawn, P: MemoryProbe> Drop for Supervisor<S, P> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Child that answers `<pid>|<line>`.
    struct FakeChild {
        pid: u32,
        alive: bool,
        fail_next: bool,
        killed: Rc<RefCell<Vec<u32>>>,
    }

    impl Exchange for FakeChild {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn exchange(&mut self, line: &str) -> Result<String, BridgeError> {
            if !self.alive || self.fail_next {
                return Err(BridgeError::ChildExited { pid: self.pid });
            }
            Ok(format!("{}|{}", self.pid, line))
        }

        fn terminate(&mut self) {
            if self.alive {
                self.alive = false;
                self.killed.borrow_mut().push(self.pid);
            }
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        next_pid: Cell<u32>,
        fail_first: Cell<bool>,
        killed: Rc<RefCell<Vec<u32>>>,
    }

    impl Spawn for FakeSpawner {
        type Child = FakeChild;

        fn spawn(&self) -> Result<FakeChild, BridgeError> {
            let pid = self.next_pid.get() + 100;
            self.next_pid.set(self.next_pid.get() + 1);
            let fail_next = self.fail_first.replace(false);
            Ok(FakeChild {
                pid,
                alive: true,
                fail_next,
                killed: Rc::clone(&self.killed),
            })
        }
    }

    /// Probe replaying a fixed list of readings, then reporting zero.
    struct ScriptedProbe(VecDeque<Option<u64>>);

    impl MemoryProbe for ScriptedProbe {
        fn resident_bytes(&mut self, _pid: u32) -> Option<u64> {
            self.0.pop_front().unwrap_or(Some(0))
        }
    }

    fn supervisor(
        dialect: Dialect,
        readings: &[Option<u64>],
    ) -> (Supervisor<FakeSpawner, ScriptedProbe>, Rc<RefCell<Vec<u32>>>) {
        let spawner = FakeSpawner::default();
        let killed = Rc::clone(&spawner.killed);
        let probe = ScriptedProbe(readings.iter().copied().collect());
        (Supervisor::new(dialect, 1000, spawner, probe), killed)
    }

    fn pid_of(reply: &str) -> &str {
        reply.split('|').next().unwrap()
    }

    #[test]
    fn test_lazy_spawn_on_first_dispatch() {
        let (mut sup, _) = supervisor(Dialect::Script, &[]);
        assert_eq!(sup.current_pid(), None);
        sup.dispatch(b"1").unwrap();
        assert_eq!(sup.current_pid(), Some(100));
    }

    #[test]
    fn test_dispatch_encodes_for_dialect() {
        let (mut sup, _) = supervisor(Dialect::Script, &[]);
        assert_eq!(sup.dispatch(b"x()").unwrap(), "100|(() => { x(); })()");

        let (mut sup, _) = supervisor(Dialect::Pattern, &[]);
        assert_eq!(sup.dispatch(b"kanji").unwrap(), "100|kanji");
    }

    #[test]
    fn test_respawn_happens_after_the_breaching_request() {
        // Request 3 pushes the child over the limit.
        let readings = [Some(10), Some(10), Some(5000), Some(10), Some(10)];
        let (mut sup, killed) = supervisor(Dialect::Pattern, &readings);

        let pids: Vec<String> = (0..5)
            .map(|i| pid_of(&sup.dispatch(format!("r{i}").as_bytes()).unwrap()).to_string())
            .collect();

        assert_eq!(pids[0], pids[1]);
        assert_eq!(pids[1], pids[2]);
        assert_ne!(pids[2], pids[3]);
        assert_eq!(pids[3], pids[4]);
        assert_eq!(*killed.borrow(), vec![100]);
        assert_eq!(sup.respawns(), 1);
    }

    #[test]
    fn test_breaching_response_is_still_returned() {
        let (mut sup, _) = supervisor(Dialect::Pattern, &[Some(1_000_000)]);
        let reply = sup.dispatch(b"heavy").unwrap();
        assert_eq!(reply, "100|heavy");
        assert_eq!(sup.current_pid(), None);
    }

    #[test]
    fn test_limit_is_strictly_greater_than() {
        let (mut sup, _) = supervisor(Dialect::Pattern, &[Some(1000)]);
        sup.dispatch(b"edge").unwrap();
        assert_eq!(sup.current_pid(), Some(100));
    }

    #[test]
    fn test_unmeasurable_memory_keeps_child() {
        let (mut sup, _) = supervisor(Dialect::Pattern, &[None]);
        sup.dispatch(b"a").unwrap();
        assert_eq!(sup.current_pid(), Some(100));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let (mut sup, killed) = supervisor(Dialect::Script, &[]);
        sup.dispatch(b"1").unwrap();
        sup.terminate();
        sup.terminate();
        assert_eq!(sup.current_pid(), None);
        assert_eq!(*killed.borrow(), vec![100]);

        sup.dispatch(b"2").unwrap();
        assert_eq!(sup.current_pid(), Some(101));
    }

    #[test]
    fn test_terminate_without_child_is_noop() {
        let (mut sup, killed) = supervisor(Dialect::Script, &[]);
        sup.terminate();
        assert!(killed.borrow().is_empty());
    }

    #[test]
    fn test_pid_handle_follows_live_child() {
        let (mut sup, _) = supervisor(Dialect::Pattern, &[Some(5000)]);
        let pid = sup.pid_handle();
        assert_eq!(pid.load(Ordering::SeqCst), 0);

        // Over the limit: the first child is gone once the reply is back.
        sup.dispatch(b"a").unwrap();
        assert_eq!(pid.load(Ordering::SeqCst), 0);

        sup.dispatch(b"b").unwrap();
        assert_eq!(pid.load(Ordering::SeqCst), 101);

        sup.terminate();
        assert_eq!(pid.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bootstrap_is_memoized() {
        let (mut sup, _) = supervisor(Dialect::Pattern, &[]);
        assert_eq!(sup.bootstrap().unwrap(), "100|");
        assert_eq!(sup.bootstrap().unwrap(), "100|");
        assert_eq!(sup.current_pid(), Some(100));
    }

    #[test]
    fn test_respawned_pattern_child_is_bootstrapped() {
        let (mut sup, _) = supervisor(Dialect::Pattern, &[Some(5000)]);
        sup.bootstrap().unwrap();
        sup.dispatch(b"a").unwrap();
        assert_eq!(sup.dispatch(b"b").unwrap(), "101|b");
        // Cached banner still comes from the first child.
        assert_eq!(sup.bootstrap().unwrap(), "100|");
    }

    #[test]
    fn test_failed_exchange_discards_child() {
        let (mut sup, killed) = supervisor(Dialect::Script, &[]);
        sup.spawner.fail_first.set(true);

        assert!(matches!(sup.dispatch(b"1"), Err(BridgeError::ChildExited { pid: 100 })));
        assert_eq!(sup.current_pid(), None);
        assert_eq!(*killed.borrow(), vec![100]);

        assert_eq!(pid_of(&sup.dispatch(b"2").unwrap()), "101");
    }

    #[test]
    fn test_repeat_request_gives_same_response() {
        let (mut sup, _) = supervisor(Dialect::Script, &[]);
        let first = sup.dispatch(br#"{"code":"function run(a){return a}","args":[1]}"#).unwrap();
        let second = sup.dispatch(br#"{"code":"function run(a){return a}","args":[1]}"#).unwrap();
        assert_eq!(first, second);
    }
}
