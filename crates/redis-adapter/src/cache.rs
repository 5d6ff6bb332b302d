//! The double-buffered value cache: tracks the latest vector published to a
//! stream sub-key with single-writer/many-reader semantics and no torn
//! reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::time::Time;

/// Latest-vector cache for a typed, trivially-copyable element `V`.
///
/// Construct with a `lazy_init` closure that performs a single
/// at-or-before stream read — it runs at most once, the first time a
/// reader observes the cache before any write has landed.
pub struct ValueCache<V> {
    buffers: [Mutex<Vec<V>>; 2],
    read_index: AtomicUsize,
    last_write: Mutex<Time>,
    swap_lock: RwLock<()>,
    lazy_init: Box<dyn Fn() -> (Time, Vec<V>) + Send + Sync>,
}

impl<V: Clone + Send + 'static> ValueCache<V> {
    pub fn new(lazy_init: impl Fn() -> (Time, Vec<V>) + Send + Sync + 'static) -> Self {
        ValueCache {
            buffers: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            read_index: AtomicUsize::new(0),
            last_write: Mutex::new(Time::INVALID),
            swap_lock: RwLock::new(()),
            lazy_init: Box::new(lazy_init),
        }
    }

    /// Reader-callback entry point: install `data` as the latest snapshot at
    /// `time`. Writes into the currently-idle buffer, then flips the read
    /// index under an exclusive lock held only for the flip itself.
    pub fn write_buffer(&self, time: Time, data: Vec<V>) {
        let read_idx = self.read_index.load(Ordering::Acquire);
        let write_idx = 1 - read_idx;
        *self.buffers[write_idx].lock().unwrap() = data;

        let _guard = self.swap_lock.write().unwrap();
        self.read_index.store(write_idx, Ordering::Release);
        *self.last_write.lock().unwrap() = time;
    }

    fn ensure_initialized(&self) {
        if self.last_write.lock().unwrap().ok() {
            return;
        }
        let _guard = self.swap_lock.write().unwrap();
        if self.last_write.lock().unwrap().ok() {
            return; // another thread initialized it while we waited
        }
        let (time, data) = (self.lazy_init)();
        let idx = self.read_index.load(Ordering::Acquire);
        *self.buffers[idx].lock().unwrap() = data;
        *self.last_write.lock().unwrap() = time;
    }

    /// Copy the full current snapshot out. Returns the time of the snapshot
    /// that was actually copied (never a mix of two writes).
    pub fn copy_read_buffer(&self) -> (Time, Vec<V>) {
        self.ensure_initialized();
        let _guard = self.swap_lock.read().unwrap();
        let idx = self.read_index.load(Ordering::Acquire);
        let time = *self.last_write.lock().unwrap();
        let data = self.buffers[idx].lock().unwrap().clone();
        (time, data)
    }

    /// Copy into `dest`, starting at `first_index` of the cached buffer.
    /// Returns `(time, elements_copied)`; `elements_copied` may be smaller
    /// than `dest.len()` if the cached buffer is shorter than requested.
    pub fn copy_read_buffer_into(&self, dest: &mut [V], first_index: usize) -> (Time, usize) {
        self.ensure_initialized();
        let _guard = self.swap_lock.read().unwrap();
        let idx = self.read_index.load(Ordering::Acquire);
        let time = *self.last_write.lock().unwrap();
        let source = self.buffers[idx].lock().unwrap();
        let available = source.len().saturating_sub(first_index);
        let n = available.min(dest.len());
        dest[..n].clone_from_slice(&source[first_index..first_index + n]);
        (time, n)
    }

    /// Copy a single scalar out at `index` (the common case of a cache
    /// holding one value rather than a vector).
    pub fn copy_read_scalar(&self, dest: &mut V, index: usize) -> Time
    where
        V: Default,
    {
        let mut one = [dest.clone()];
        let (time, copied) = self.copy_read_buffer_into(&mut one, index);
        if copied == 1 {
            *dest = one[0].clone();
        }
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn lazy_initializes_exactly_once_from_the_fallback_read() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let cache = ValueCache::<f32>::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            (Time::new(1, 0), vec![1.0, 2.0])
        });
        let (t1, v1) = cache.copy_read_buffer();
        let (t2, v2) = cache.copy_read_buffer();
        assert_eq!(v1, vec![1.0, 2.0]);
        assert_eq!(v1, v2);
        assert_eq!(t1, t2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_is_visible_to_subsequent_reads() {
        let cache = ValueCache::<f32>::new(|| (Time::new(1, 0), vec![]));
        cache.write_buffer(Time::new(2, 0), vec![9.0, 8.0]);
        let (time, data) = cache.copy_read_buffer();
        assert_eq!(data, vec![9.0, 8.0]);
        assert_eq!(time, Time::new(2, 0));
    }

    #[test]
    fn concurrent_readers_never_observe_a_mixed_snapshot() {
        let cache = Arc::new(ValueCache::<i64>::new(|| (Time::new(1, 0), vec![0; 64])));
        let barrier = Arc::new(Barrier::new(9));

        let writer = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for n in 1..500i64 {
                    cache.write_buffer(Time::new(n as u64 + 1, 0), vec![n; 64]);
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            readers.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..500 {
                    let (_, data) = cache.copy_read_buffer();
                    // every element in one read must agree: a torn read
                    // would show a mix of values from two different writes.
                    assert!(data.windows(2).all(|w| w[0] == w[1]));
                }
            }));
        }

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
