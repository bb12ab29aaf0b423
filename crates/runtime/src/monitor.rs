//! Per-object monitors.
//!
//! Monitors are kept in a side table keyed by object address rather than
//! in object headers; the heap contract does not reserve a header word
//! for locking. Locks are re-entrant; unlocking from a thread that does
//! not own the monitor is an error the caller turns into
//! `IllegalMonitorStateException`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use javelin_environ::{ObjectLocking, ObjectRef};

#[derive(Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    recursion: u32,
}

struct Monitor {
    state: Mutex<MonitorState>,
    cond: Condvar,
}

/// The process-wide monitor table.
pub struct MonitorTable {
    monitors: Mutex<HashMap<usize, Arc<Monitor>>>,
}

impl MonitorTable {
    /// An empty table.
    pub fn new() -> Self {
        MonitorTable {
            monitors: Mutex::new(HashMap::new()),
        }
    }

    fn monitor_for(&self, obj: ObjectRef) -> Arc<Monitor> {
        let mut table = self.monitors.lock().unwrap();
        Arc::clone(table.entry(obj.as_raw() as usize).or_insert_with(|| {
            Arc::new(Monitor {
                state: Mutex::new(MonitorState::default()),
                cond: Condvar::new(),
            })
        }))
    }
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectLocking for MonitorTable {
    fn lock(&self, obj: ObjectRef) {
        let monitor = self.monitor_for(obj);
        let me = std::thread::current().id();
        let mut state = monitor.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.recursion = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.recursion += 1;
                    return;
                }
                Some(_) => {
                    state = monitor.cond.wait(state).unwrap();
                }
            }
        }
    }

    fn unlock(&self, obj: ObjectRef) -> Result<(), ()> {
        let monitor = self.monitor_for(obj);
        let me = std::thread::current().id();
        let mut state = monitor.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(());
        }
        state.recursion -= 1;
        if state.recursion == 0 {
            state.owner = None;
            monitor.cond.notify_all();
        }
        Ok(())
    }

    fn wait(&self, obj: ObjectRef, timeout: Option<Duration>) -> Result<(), ()> {
        let monitor = self.monitor_for(obj);
        let me = std::thread::current().id();
        let mut state = monitor.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(());
        }

        // Release the monitor for the duration of the wait, keeping the
        // recursion depth to restore afterwards.
        let depth = state.recursion;
        state.owner = None;
        state.recursion = 0;
        monitor.cond.notify_all();

        state = match timeout {
            Some(timeout) => monitor.cond.wait_timeout(state, timeout).unwrap().0,
            None => monitor.cond.wait(state).unwrap(),
        };

        // Reacquire.
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.recursion = depth;
                    return Ok(());
                }
                Some(_) => state = monitor.cond.wait(state).unwrap(),
            }
        }
    }

    fn notify(&self, obj: ObjectRef) -> Result<(), ()> {
        let monitor = self.monitor_for(obj);
        let me = std::thread::current().id();
        let state = monitor.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(());
        }
        monitor.cond.notify_one();
        Ok(())
    }

    fn notify_all(&self, obj: ObjectRef) -> Result<(), ()> {
        let monitor = self.monitor_for(obj);
        let me = std::thread::current().id();
        let state = monitor.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(());
        }
        monitor.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_raw(addr as *mut usize)
    }

    #[test]
    fn lock_is_reentrant() {
        let table = MonitorTable::new();
        let o = obj(0x1000);
        table.lock(o);
        table.lock(o);
        assert!(table.unlock(o).is_ok());
        assert!(table.unlock(o).is_ok());
        // Fully released: a third unlock is an error.
        assert!(table.unlock(o).is_err());
    }

    #[test]
    fn unlock_from_non_owner_fails() {
        let table = Arc::new(MonitorTable::new());
        let o = obj(0x2000);
        table.lock(o);
        let table2 = Arc::clone(&table);
        let result = std::thread::spawn(move || table2.unlock(o)).join().unwrap();
        assert!(result.is_err());
        assert!(table.unlock(o).is_ok());
    }

    #[test]
    fn contended_lock_excludes() {
        let table = Arc::new(MonitorTable::new());
        let o = obj(0x3000);
        table.lock(o);
        let table2 = Arc::clone(&table);
        let waiter = std::thread::spawn(move || {
            table2.lock(o);
            table2.unlock(o).unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        table.unlock(o).unwrap();
        waiter.join().unwrap();
    }
}
