//! Thread bookkeeping.
//!
//! A global registry tracks live threads and the count of non-daemon
//! threads; the VM's shutdown path waits on the termination condition
//! until the non-daemon count reaches zero. Interruption is
//! level-triggered: the flag is set, the thread's wait condition is
//! broadcast, and the woken thread observes the flag itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use javelin_environ::VmThread;

/// One VM-attached thread.
pub struct JavaThread {
    name: String,
    daemon: bool,
    interrupted: AtomicBool,
    /// Broadcast to wake the thread out of monitor waits on interrupt.
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl JavaThread {
    /// Create a thread record.
    pub fn new(name: impl Into<String>, daemon: bool) -> Arc<JavaThread> {
        Arc::new(JavaThread {
            name: name.into(),
            daemon,
            interrupted: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        })
    }
}

impl VmThread for JavaThread {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_daemon(&self) -> bool {
        self.daemon
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let _guard = self.wakeup_lock.lock().unwrap();
        self.wakeup.notify_all();
    }

    fn interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

struct RegistryState {
    threads: Vec<Arc<JavaThread>>,
    nr_non_daemons: usize,
}

/// The global thread registry.
pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
    terminated: Condvar,
}

impl ThreadRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ThreadRegistry {
            state: Mutex::new(RegistryState {
                threads: Vec::new(),
                nr_non_daemons: 0,
            }),
            terminated: Condvar::new(),
        }
    }

    /// Attach a thread.
    pub fn attach(&self, thread: Arc<JavaThread>) {
        let mut state = self.state.lock().unwrap();
        if !thread.is_daemon() {
            state.nr_non_daemons += 1;
        }
        state.threads.push(thread);
    }

    /// Detach a terminating thread and broadcast the termination
    /// condition.
    pub fn detach(&self, thread: &Arc<JavaThread>) {
        let mut state = self.state.lock().unwrap();
        state
            .threads
            .retain(|t| !Arc::ptr_eq(t, thread));
        if !thread.is_daemon() {
            state.nr_non_daemons -= 1;
        }
        self.terminated.notify_all();
    }

    /// Number of attached threads.
    pub fn nr_threads(&self) -> usize {
        self.state.lock().unwrap().threads.len()
    }

    /// Block until every non-daemon thread has detached.
    pub fn wait_for_non_daemons(&self) {
        let mut state = self.state.lock().unwrap();
        while state.nr_non_daemons > 0 {
            state = self.terminated.wait(state).unwrap();
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_level_triggered() {
        let thread = JavaThread::new("worker", false);
        assert!(!thread.is_interrupted());
        thread.interrupt();
        assert!(thread.is_interrupted());
        // `interrupted` reads and clears.
        assert!(thread.interrupted());
        assert!(!thread.is_interrupted());
    }

    #[test]
    fn shutdown_waits_for_non_daemons() {
        let registry = Arc::new(ThreadRegistry::new());
        let worker = JavaThread::new("worker", false);
        let daemon = JavaThread::new("keeper", true);
        registry.attach(Arc::clone(&worker));
        registry.attach(Arc::clone(&daemon));

        let registry2 = Arc::clone(&registry);
        let worker2 = Arc::clone(&worker);
        let detacher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            registry2.detach(&worker2);
        });

        registry.wait_for_non_daemons();
        detacher.join().unwrap();
        // The daemon is still attached but does not block shutdown.
        assert_eq!(registry.nr_threads(), 1);
    }
}
