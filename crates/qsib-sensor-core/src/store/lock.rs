//! Reader-biased shared/exclusive lock with bounded writer wait
//!
//! Exports (readers) are long compared to ingests (writers) and far more
//! latency tolerant on the host side, but a sensor streams notifications
//! continuously, so a writer must never starve behind overlapping exports.
//!
//! Readers are admitted whenever no writer holds the lock, even while
//! writers wait. Each admission that overtakes a waiting writer is counted;
//! once the count reaches the admission budget, new readers queue until a
//! writer has run. A writer therefore waits for at most `budget` reader
//! critical sections plus those already in progress.
//!
//! Release is tied to guard drop, so a guard can only be released once.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Default)]
struct LockState {
    /// Readers currently holding the lock
    readers: u32,
    /// Whether a writer holds the lock
    writer: bool,
    /// Writers blocked in `acquire_exclusive`
    writers_waiting: u32,
    /// Readers admitted past a waiting writer since the last write
    overtakes: u32,
}

/// Reader-preferring lock guaranteeing writer progress
pub struct ReaderBiasedLock<T> {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    budget: u32,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by `state`: shared guards only exist
// while no writer holds the lock, and an exclusive guard only while no reader
// or other writer does.
unsafe impl<T: Send> Send for ReaderBiasedLock<T> {}
unsafe impl<T: Send + Sync> Sync for ReaderBiasedLock<T> {}

impl<T> ReaderBiasedLock<T> {
    /// Create a lock letting up to `budget` readers overtake a waiting writer
    pub fn new(value: T, budget: u32) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            budget: budget.max(1),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire shared access, blocking while a writer holds the lock or the
    /// overtake budget for waiting writers is spent
    pub fn acquire_shared(&self) -> SharedGuard<'_, T> {
        let mut state = self.state.lock();
        loop {
            let writer_waiting = state.writers_waiting > 0;
            if !state.writer && (!writer_waiting || state.overtakes < self.budget) {
                state.readers += 1;
                if writer_waiting {
                    state.overtakes += 1;
                }
                break;
            }
            self.readers_cv.wait(&mut state);
        }
        SharedGuard { lock: self }
    }

    /// Acquire exclusive access, blocking until all readers and writers leave
    pub fn acquire_exclusive(&self) -> ExclusiveGuard<'_, T> {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.writers_cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
        state.overtakes = 0;
        ExclusiveGuard { lock: self }
    }

    /// Consume the lock, returning the protected value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn release_shared(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 && state.writers_waiting > 0 {
            self.writers_cv.notify_one();
        }
    }

    fn release_exclusive(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        if state.writers_waiting > 0 {
            self.writers_cv.notify_one();
        }
        self.readers_cv.notify_all();
    }
}

impl<T: Default> Default for ReaderBiasedLock<T> {
    fn default() -> Self {
        Self::new(T::default(), 32)
    }
}

impl<T> std::fmt::Debug for ReaderBiasedLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReaderBiasedLock")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("writers_waiting", &state.writers_waiting)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

/// Shared access; released on drop
pub struct SharedGuard<'a, T> {
    lock: &'a ReaderBiasedLock<T>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: no exclusive guard exists while this guard is alive
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// Exclusive access; released on drop
pub struct ExclusiveGuard<'a, T> {
    lock: &'a ReaderBiasedLock<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the only one alive
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the only one alive
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_many_readers_share() {
        let lock = ReaderBiasedLock::new(5u32, 4);
        let a = lock.acquire_shared();
        let b = lock.acquire_shared();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    fn test_writer_mutates() {
        let lock = ReaderBiasedLock::new(Vec::<u32>::new(), 4);
        lock.acquire_exclusive().push(1);
        lock.acquire_exclusive().push(2);
        assert_eq!(*lock.acquire_shared(), vec![1, 2]);
        assert_eq!(lock.into_inner(), vec![1, 2]);
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let lock = Arc::new(ReaderBiasedLock::new(0u32, 4));
        let reader = lock.acquire_shared();

        let writer_lock = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            *writer_lock.acquire_exclusive() += 1;
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*reader, 0);
        drop(reader);

        writer.join().unwrap();
        assert_eq!(*lock.acquire_shared(), 1);
    }

    #[test]
    fn test_readers_overtake_waiting_writer_within_budget() {
        let lock = Arc::new(ReaderBiasedLock::new(0u32, 2));
        let first = lock.acquire_shared();

        let writer_lock = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            *writer_lock.acquire_exclusive() = 1;
        });
        while lock.state.lock().writers_waiting == 0 {
            std::thread::yield_now();
        }

        // Two readers may still overtake the waiting writer
        let second = lock.acquire_shared();
        let third = lock.acquire_shared();
        assert_eq!(*second + *third, 0);

        // A fourth reader must queue behind the writer
        let blocked_lock = Arc::clone(&lock);
        let observed = Arc::new(AtomicU32::new(u32::MAX));
        let observed_clone = Arc::clone(&observed);
        let late_reader = std::thread::spawn(move || {
            let value = *blocked_lock.acquire_shared();
            observed_clone.store(value, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(observed.load(Ordering::SeqCst), u32::MAX);

        drop(first);
        drop(second);
        drop(third);
        writer.join().unwrap();
        late_reader.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writer_progresses_under_reader_stream() {
        let lock = Arc::new(ReaderBiasedLock::new(0u64, 8));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let guard = lock.acquire_shared();
                        std::thread::sleep(Duration::from_micros(200));
                        drop(guard);
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            *lock.acquire_exclusive() += 1;
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        assert_eq!(*lock.acquire_shared(), 50);
    }
}
