//! Process-control seam.
//!
//! Starting, probing and terminating worker processes is delegated to a
//! [`ProcessControl`] implementation supplied by the embedding runtime.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::worker::{WorkerDescriptor, WorkerRef};

/// Identity of a running worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)
    }
}

/// Starts, probes and terminates worker processes.
pub trait ProcessControl: Send + Sync {
    /// Start a process for a freshly registered worker.
    fn spawn(&self, worker: WorkerRef, desc: &WorkerDescriptor) -> Result<ProcessHandle>;

    /// Whether the process is confirmed alive.
    ///
    /// Never called with the registry lock held, so it may consult the
    /// context itself.
    fn is_alive(&self, handle: ProcessHandle) -> bool;

    /// Request termination. Must not wait for the process to exit.
    fn terminate(&self, handle: ProcessHandle);

    /// Wake a sleeping process, e.g. the supervisor after a
    /// configuration change.
    fn wake(&self, _handle: ProcessHandle) {}
}

/// In-memory process control for tests.
///
/// Spawned processes stay alive until terminated or explicitly exited.
#[derive(Clone, Default)]
pub struct MockProcesses {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    next_pid: u32,
    alive: HashSet<ProcessHandle>,
    spawned: Vec<(WorkerRef, WorkerDescriptor, ProcessHandle)>,
    terminated: Vec<ProcessHandle>,
    fail_with: Option<String>,
    wakeups: Vec<ProcessHandle>,
}

impl MockProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock whose spawns all fail.
    pub fn failing(error_message: impl Into<String>) -> Self {
        let mock = Self::new();
        mock.state.lock().fail_with = Some(error_message.into());
        mock
    }

    /// Simulate the process exiting on its own (clean exit or crash).
    pub fn exit(&self, handle: ProcessHandle) {
        self.state.lock().alive.remove(&handle);
    }

    /// Every spawn request seen so far, in order.
    pub fn spawned(&self) -> Vec<(WorkerRef, WorkerDescriptor, ProcessHandle)> {
        self.state.lock().spawned.clone()
    }

    /// Handle of the most recent spawn for a slot.
    pub fn handle_for(&self, worker: WorkerRef) -> Option<ProcessHandle> {
        self.state
            .lock()
            .spawned
            .iter()
            .rev()
            .find(|(w, _, _)| *w == worker)
            .map(|(_, _, h)| *h)
    }

    /// Every termination request seen so far, in order.
    pub fn terminated(&self) -> Vec<ProcessHandle> {
        self.state.lock().terminated.clone()
    }

    pub fn alive_count(&self) -> usize {
        self.state.lock().alive.len()
    }

    /// Every wake request seen so far, in order.
    pub fn wakeups(&self) -> Vec<ProcessHandle> {
        self.state.lock().wakeups.clone()
    }
}

impl ProcessControl for MockProcesses {
    fn spawn(&self, worker: WorkerRef, desc: &WorkerDescriptor) -> Result<ProcessHandle> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.fail_with {
            return Err(Error::Spawn(msg.clone()));
        }

        state.next_pid += 1;
        let handle = ProcessHandle::new(1000 + state.next_pid);
        state.alive.insert(handle);
        state.spawned.push((worker, desc.clone(), handle));
        Ok(handle)
    }

    fn is_alive(&self, handle: ProcessHandle) -> bool {
        self.state.lock().alive.contains(&handle)
    }

    fn terminate(&self, handle: ProcessHandle) {
        let mut state = self.state.lock();
        state.terminated.push(handle);
        state.alive.remove(&handle);
    }

    fn wake(&self, handle: ProcessHandle) {
        self.state.lock().wakeups.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_ref(slot: usize) -> WorkerRef {
        WorkerRef {
            slot,
            generation: 1,
        }
    }

    #[test]
    fn test_mock_lifecycle() {
        let mock = MockProcesses::new();
        let handle = mock
            .spawn(worker_ref(0), &WorkerDescriptor::manager(1))
            .unwrap();

        assert!(mock.is_alive(handle));
        assert_eq!(mock.handle_for(worker_ref(0)), Some(handle));

        mock.terminate(handle);
        assert!(!mock.is_alive(handle));
        assert_eq!(mock.terminated(), vec![handle]);
    }

    #[test]
    fn test_mock_exit() {
        let mock = MockProcesses::new();
        let a = mock.spawn(worker_ref(0), &WorkerDescriptor::manager(1)).unwrap();
        let b = mock.spawn(worker_ref(1), &WorkerDescriptor::apply(1, 2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(mock.alive_count(), 2);

        mock.exit(a);
        assert_eq!(mock.alive_count(), 1);
        assert!(mock.terminated().is_empty());
    }

    #[test]
    fn test_mock_failing() {
        let mock = MockProcesses::failing("fork failed");
        let err = mock
            .spawn(worker_ref(0), &WorkerDescriptor::manager(1))
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(msg) if msg == "fork failed"));
        assert!(mock.spawned().is_empty());
    }
}
