// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrent fd-indexed connection registry (spec §4.1).
//!
//! The fd space is sparse but bounded by the process's fd table, so a
//! growable dense array indexed by fd is used instead of a hash map
//! (spec §9, "Registry as arena+index"). Growing the array requires the
//! outer `RwLock`; mutating a single connection only requires that
//! connection's own `Mutex`, so two threads operating on different fds never
//! contend with each other.

use crate::connection::Connection;
use crate::error::RegistryError;
use std::sync::{Arc, Mutex, RwLock};

type Slot = Option<Arc<Mutex<Connection>>>;

pub struct Registry {
    slots: RwLock<Vec<Slot>>,
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Inserts `connection` at `fd`. Fails if the slot is already occupied
    /// by another live connection; the caller is expected to have closed it
    /// first (spec §4.7 "close-on-stale").
    pub fn put(&self, fd: i32, connection: Connection) -> Result<(), RegistryError> {
        let idx = non_negative_fd(fd)?;
        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            slots.resize_with(idx + 1, || None);
        }
        if slots[idx].is_some() {
            return Err(RegistryError::SlotOccupied(fd));
        }
        slots[idx] = Some(Arc::new(Mutex::new(connection)));
        Ok(())
    }

    /// Removes and returns the connection at `fd`, if any. Subsequent
    /// operations on the fd start fresh.
    ///
    /// Clearing the slot makes the fd invisible to any new `acquire`/`put`,
    /// but a thread that called `acquire` just before this runs (spec §1,
    /// "arbitrary multi-threaded interposition") may still be mid-mutation
    /// under its own clone of the handle. Rather than assume that race can't
    /// happen and `unwrap`/panic out of `record_close` (forbidden by spec
    /// §7), wait for every other clone to drop: each `record_*` entry holds
    /// its handle only for the duration of one call, so the wait is bounded.
    pub fn take(&self, fd: i32) -> Option<Connection> {
        let idx = non_negative_fd(fd).ok()?;
        let mut slot = {
            let mut slots = self.slots.write().unwrap();
            slots.get_mut(idx)?.take()?
        };
        loop {
            match Arc::try_unwrap(slot) {
                Ok(mutex) => return Some(mutex.into_inner().unwrap()),
                Err(still_shared) => {
                    std::thread::yield_now();
                    slot = still_shared;
                }
            }
        }
    }

    /// Returns a clonable handle to the connection at `fd`. The caller locks
    /// the handle to get mutable access; dropping the resulting guard is the
    /// "release" step from spec §4.1 (Rust's `Mutex` releases on drop, so
    /// there is no separate release call to make).
    pub fn acquire(&self, fd: i32) -> Option<Arc<Mutex<Connection>>> {
        let idx = non_negative_fd(fd).ok()?;
        let slots = self.slots.read().unwrap();
        slots.get(idx)?.clone()
    }

    /// Best-effort, lock-free presence check.
    pub fn present(&self, fd: i32) -> bool {
        let Ok(idx) = non_negative_fd(fd) else {
            return false;
        };
        let slots = self.slots.read().unwrap();
        matches!(slots.get(idx), Some(Some(_)))
    }

    /// Current upper bound on occupied fds (the backing array's length).
    pub fn size(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Drops all entries without running cleanup logic. Used only on fork
    /// (spec §4.7): the child must not attempt to flush JSON or stop
    /// capture threads belonging to the parent's connections.
    pub fn reset(&self) {
        let mut slots = self.slots.write().unwrap();
        slots.clear();
    }

    /// Drops all entries. Callers that want graceful shutdown semantics
    /// (flushed JSON, stopped captures) must do so per-connection via
    /// `record_close` before calling this; `Connection` carries no `Drop`
    /// impl with side effects, so `free` and `reset` are mechanically
    /// identical here. Kept as a distinct method to mirror the spec's
    /// vocabulary and to give call sites a self-documenting name.
    pub fn free(&self) {
        self.reset();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn non_negative_fd(fd: i32) -> Result<usize, RegistryError> {
    if fd < 0 {
        Err(RegistryError::NegativeFd(fd))
    } else {
        Ok(fd as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_present_then_take() {
        let reg = Registry::new();
        assert!(!reg.present(3));
        reg.put(3, Connection::new(0, None)).unwrap();
        assert!(reg.present(3));
        let con = reg.take(3).unwrap();
        assert_eq!(con.id, 0);
        assert!(!reg.present(3));
    }

    #[test]
    fn put_fails_on_occupied_slot() {
        let reg = Registry::new();
        reg.put(5, Connection::new(0, None)).unwrap();
        let err = reg.put(5, Connection::new(1, None)).unwrap_err();
        assert!(matches!(err, RegistryError::SlotOccupied(5)));
    }

    #[test]
    fn put_rejects_negative_fd() {
        let reg = Registry::new();
        let err = reg.put(-1, Connection::new(0, None)).unwrap_err();
        assert!(matches!(err, RegistryError::NegativeFd(-1)));
    }

    #[test]
    fn acquire_allows_mutation_through_the_lock() {
        let reg = Registry::new();
        reg.put(7, Connection::new(0, None)).unwrap();
        {
            let handle = reg.acquire(7).unwrap();
            let mut conn = handle.lock().unwrap();
            conn.credit_sent(10);
        }
        let handle = reg.acquire(7).unwrap();
        assert_eq!(handle.lock().unwrap().bytes_sent, 10);
    }

    #[test]
    fn size_reflects_backing_array_growth() {
        let reg = Registry::new();
        assert_eq!(reg.size(), 0);
        reg.put(4, Connection::new(0, None)).unwrap();
        assert_eq!(reg.size(), 5);
    }

    #[test]
    fn reset_empties_registry_without_panicking_on_dangling_handles() {
        let reg = Registry::new();
        reg.put(1, Connection::new(0, None)).unwrap();
        reg.put(2, Connection::new(1, None)).unwrap();
        reg.reset();
        assert_eq!(reg.size(), 0);
        assert!(!reg.present(1));
        assert!(!reg.present(2));
    }

    #[test]
    fn distinct_fds_do_not_contend_on_each_others_lock() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let reg = StdArc::new(Registry::new());
        reg.put(1, Connection::new(0, None)).unwrap();
        reg.put(2, Connection::new(1, None)).unwrap();

        let r1 = reg.clone();
        let t1 = thread::spawn(move || {
            let h = r1.acquire(1).unwrap();
            let mut c = h.lock().unwrap();
            c.credit_sent(1);
        });
        let r2 = reg.clone();
        let t2 = thread::spawn(move || {
            let h = r2.acquire(2).unwrap();
            let mut c = h.lock().unwrap();
            c.credit_received(1);
        });
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(reg.acquire(1).unwrap().lock().unwrap().bytes_sent, 1);
        assert_eq!(reg.acquire(2).unwrap().lock().unwrap().bytes_received, 1);
    }

    #[test]
    fn take_waits_out_a_racing_in_flight_handle_instead_of_panicking() {
        use std::sync::Arc as StdArc;
        use std::thread;
        use std::time::Duration;

        let reg = StdArc::new(Registry::new());
        reg.put(9, Connection::new(0, None)).unwrap();

        let handle = reg.acquire(9).unwrap();
        let worker = thread::spawn(move || {
            let mut conn = handle.lock().unwrap();
            thread::sleep(Duration::from_millis(50));
            conn.credit_sent(7);
        });

        // Races record_close's take() against the in-flight handle above;
        // must block until the worker finishes rather than panic.
        let con = reg.take(9).unwrap();
        worker.join().unwrap();
        assert_eq!(con.bytes_sent, 7);
    }
}
