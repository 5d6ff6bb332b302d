//! The stream reader engine: one blocking multi-key reader thread per active
//! cluster slot, a per-slot cursor table, and the `"$"` first-ID
//! synchronisation rule that keeps a newly-added key from missing entries
//! that land on a sibling key in the same slot before its own cursor
//! resolves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::Attrs;
use crate::driver::{Driver, Entry};
use crate::keys::{KeyBuilder, STOP_STUB};
use crate::workers::WorkerPool;

const THREAD_START_CONFIRM: Duration = Duration::from_millis(20);
const SENTINEL_NEW_KEY: &str = "$";

pub type ReaderCallback = dyn Fn(Vec<Entry>) + Send + Sync;

/// Update `keyids` with the last entry seen on each key in `batches`, then
/// run the `"$"` first-ID synchronisation rule: while `*check_for_dollars`
/// is still true, every cursor still parked on the sentinel is rewritten to
/// the first real ID observed in this batch, so entries that raced onto
/// another key between the initial `"$"` resolution and now are not skipped.
/// Flips `*check_for_dollars` to false once that rewrite has happened once.
fn resync_cursors(keyids: &mut HashMap<String, String>, batches: &[(String, Vec<Entry>)], check_for_dollars: &mut bool) {
    let mut first_new_id: Option<String> = None;
    for (stream_key, entries) in batches {
        if let Some(last) = entries.last() {
            keyids.insert(stream_key.clone(), last.0.clone());
            if *check_for_dollars && first_new_id.is_none() {
                first_new_id = Some(last.0.clone());
            }
        }
    }
    if let Some(new_id) = first_new_id {
        for cursor in keyids.values_mut() {
            if cursor == SENTINEL_NEW_KEY {
                *cursor = new_id.clone();
            }
        }
        *check_for_dollars = false;
    }
}

struct ReaderState {
    keyids: HashMap<String, String>,
    subs: HashMap<String, Vec<Arc<ReaderCallback>>>,
    stop_key: String,
}

struct ReaderInfo {
    state: Arc<Mutex<ReaderState>>,
    thread: Option<JoinHandle<()>>,
    run: Arc<AtomicBool>,
}

impl ReaderInfo {
    fn new() -> Self {
        ReaderInfo {
            state: Arc::new(Mutex::new(ReaderState {
                keyids: HashMap::new(),
                subs: HashMap::new(),
                stop_key: String::new(),
            })),
            thread: None,
            run: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Owns the `slot -> ReaderInfo` table described in the component design.
pub struct ReaderEngine {
    driver: Arc<Driver>,
    keys: Arc<KeyBuilder>,
    workers: Arc<WorkerPool>,
    timeout_ms: u64,
    readers: Mutex<HashMap<u16, ReaderInfo>>,
    defer: AtomicBool,
}

impl ReaderEngine {
    pub fn new(driver: Arc<Driver>, keys: Arc<KeyBuilder>, workers: Arc<WorkerPool>, timeout_ms: u64) -> Self {
        ReaderEngine { driver, keys, workers, timeout_ms, readers: Mutex::new(HashMap::new()), defer: AtomicBool::new(false) }
    }

    /// Add a callback for a schema stream key (`key`, already built with
    /// `base_override`/`sub`); the per-slot stop key is named from the first
    /// sub-key to use that slot, which is fine — any name under the same
    /// base hashes to the same slot.
    pub fn add_reader(&self, key: String, base_override: Option<&str>, sub: &str, callback: Arc<ReaderCallback>) -> bool {
        let slot = self.driver.keyslot(&key);
        if slot < 0 {
            return false;
        }
        let slot = slot as u16;
        self.stop_reader(slot);

        let mut readers = self.readers.lock().unwrap();
        let info = readers.entry(slot).or_insert_with(ReaderInfo::new);
        let mut state = info.state.lock().unwrap();
        if state.stop_key.is_empty() {
            state.stop_key = self.keys.build(&format!("{sub}:{STOP_STUB}"), base_override);
            let stop_key = state.stop_key.clone();
            state.keyids.insert(stop_key, SENTINEL_NEW_KEY.to_string());
        }
        state.subs.entry(key.clone()).or_default().push(callback);
        state.keyids.entry(key).or_insert_with(|| SENTINEL_NEW_KEY.to_string());
        drop(state);
        drop(readers);
        self.start_reader(slot)
    }

    /// Add a callback for a key that does *not* follow the schema
    /// convention. The stop key is built by wrapping the whole generic key
    /// as the hash tag, so it is guaranteed to land on the same slot even
    /// though the generic key itself may carry no `{}` tag of its own.
    pub fn add_generic_reader(&self, key: String, callback: Arc<ReaderCallback>) -> bool {
        if self.keys.is_schema_key(&key) {
            return false; // reject recognised schema keys
        }
        let slot = self.driver.keyslot(&key);
        if slot < 0 {
            return false;
        }
        let slot = slot as u16;
        self.stop_reader(slot);

        let mut readers = self.readers.lock().unwrap();
        let info = readers.entry(slot).or_insert_with(ReaderInfo::new);
        let mut state = info.state.lock().unwrap();
        if state.stop_key.is_empty() {
            state.stop_key = self.keys.build(STOP_STUB, Some(&key));
            let stop_key = state.stop_key.clone();
            state.keyids.insert(stop_key, SENTINEL_NEW_KEY.to_string());
        }
        state.subs.entry(key.clone()).or_default().push(callback);
        state.keyids.entry(key).or_insert_with(|| SENTINEL_NEW_KEY.to_string());
        drop(state);
        drop(readers);
        self.start_reader(slot)
    }

    /// Remove every callback registered for `key`; tears the whole slot down
    /// if it was the last key subscribed on that slot.
    pub fn remove_reader(&self, key: &str) -> bool {
        let slot = self.driver.keyslot(key);
        if slot < 0 {
            return false;
        }
        let slot = slot as u16;
        if !self.readers.lock().unwrap().contains_key(&slot) {
            return false;
        }
        self.stop_reader(slot);

        let mut readers = self.readers.lock().unwrap();
        let remove_slot = {
            let info = readers.get(&slot).unwrap();
            let mut state = info.state.lock().unwrap();
            state.subs.remove(key);
            state.keyids.remove(key);
            state.subs.is_empty()
        };
        if remove_slot {
            readers.remove(&slot);
            true
        } else {
            drop(readers);
            self.start_reader(slot)
        }
    }

    /// Pause (defer = true) or resume (defer = false) every reader thread,
    /// for batching many add/remove calls without thread churn.
    pub fn set_defer(&self, defer: bool) -> bool {
        let was_deferred = self.defer.swap(defer, Ordering::SeqCst);
        if defer && !was_deferred {
            let slots: Vec<u16> = self.readers.lock().unwrap().keys().copied().collect();
            for slot in slots {
                self.stop_reader(slot);
            }
        } else if !defer && was_deferred {
            let slots: Vec<u16> = self.readers.lock().unwrap().keys().copied().collect();
            for slot in slots {
                self.start_reader(slot);
            }
        }
        true
    }

    fn start_reader(&self, slot: u16) -> bool {
        if self.defer.load(Ordering::SeqCst) {
            return true;
        }

        let mut readers = self.readers.lock().unwrap();
        let info = match readers.get_mut(&slot) {
            Some(info) => info,
            None => return false,
        };
        if info.thread.is_some() {
            return false;
        }

        let state = Arc::clone(&info.state);
        let run = Arc::clone(&info.run);
        run.store(false, Ordering::SeqCst);

        let driver = Arc::clone(&self.driver);
        let workers = Arc::clone(&self.workers);
        let timeout_ms = self.timeout_ms;
        let rendezvous = Arc::new((Mutex::new(false), Condvar::new()));
        let rendezvous_thread = Arc::clone(&rendezvous);
        let run_thread = Arc::clone(&run);

        let handle = std::thread::Builder::new()
            .name(format!("radapter-reader-{slot}"))
            .spawn(move || {
                run_thread.store(true, Ordering::SeqCst);
                {
                    let (lock, cv) = &*rendezvous_thread;
                    *lock.lock().unwrap() = true;
                    cv.notify_all();
                }

                let mut check_for_dollars = true;

                while run_thread.load(Ordering::SeqCst) {
                    let keyids_snapshot: Vec<(String, String)> = {
                        let state = state.lock().unwrap();
                        state.keyids.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    };

                    let batches = match driver.xread_multi_block(&keyids_snapshot, timeout_ms) {
                        Some(batches) => batches,
                        None => {
                            tracing::error!(slot, "xread_multi_block returned disconnected in reader");
                            run_thread.store(false, Ordering::SeqCst);
                            break;
                        }
                    };

                    if batches.is_empty() {
                        continue; // driver timeout: loop again with the same cursor table
                    }

                    let mut state = state.lock().unwrap();
                    resync_cursors(&mut state.keyids, &batches, &mut check_for_dollars);

                    for (stream_key, entries) in batches {
                        if let Some(callbacks) = state.subs.get(&stream_key) {
                            for cb in callbacks {
                                let cb = Arc::clone(cb);
                                let entries = entries.clone();
                                workers.submit(&stream_key, move || cb(entries));
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn reader thread");

        let (lock, cv) = &*rendezvous;
        let guard = lock.lock().unwrap();
        let (guard, _timeout) = cv.wait_timeout_while(guard, THREAD_START_CONFIRM, |started| !*started).unwrap();
        let started = *guard;
        if !started {
            tracing::error!(slot, "start_reader timeout waiting for thread start");
        }
        info.thread = Some(handle);
        started
    }

    fn stop_reader(&self, slot: u16) -> bool {
        let mut readers = self.readers.lock().unwrap();
        let info = match readers.get_mut(&slot) {
            Some(info) => info,
            None => return false,
        };
        let handle = match info.thread.take() {
            Some(handle) => handle,
            None => return false,
        };
        info.run.store(false, Ordering::SeqCst);

        let stop_key = info.state.lock().unwrap().stop_key.clone();
        let mut attrs = Attrs::new();
        attrs.insert(crate::codec::DEFAULT_FIELD.to_string(), String::new());
        self.driver.xadd_trim(&stop_key, "*", &attrs, 1);

        drop(readers); // avoid holding the table lock across join
        let _ = handle.join();
        true
    }

    /// Stop every active reader thread (used on adapter shutdown and by the
    /// reconnect supervisor before restoring connections).
    pub fn stop_all(&self) {
        let slots: Vec<u16> = self.readers.lock().unwrap().keys().copied().collect();
        for slot in slots {
            self.stop_reader(slot);
        }
    }

    /// Restart every known slot (used by the reconnect supervisor after a
    /// successful reconnect).
    pub fn start_all(&self) {
        let slots: Vec<u16> = self.readers.lock().unwrap().keys().copied().collect();
        for slot in slots {
            self.start_reader(slot);
        }
    }
}

impl Drop for ReaderEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Deterministic unit test for the `"$"` resynchronisation rule,
    /// independent of a live driver: three keys share a slot, two already
    /// have real cursors and one is still on the sentinel. The rule must
    /// rewrite only the sentinel cursor, and it must rewrite it to the first
    /// real ID observed in that batch.
    #[test]
    fn first_id_synchronisation_only_rewrites_sentinel_cursors() {
        let mut keyids: HashMap<String, String> = HashMap::new();
        keyids.insert("k1".to_string(), "100-0".to_string());
        keyids.insert("k2".to_string(), SENTINEL_NEW_KEY.to_string());
        keyids.insert("k3".to_string(), "50-0".to_string());

        let batches: Vec<(String, Vec<Entry>)> =
            vec![("k1".to_string(), vec![("150-0".to_string(), Attrs::new())])];

        let mut check_for_dollars = true;
        resync_cursors(&mut keyids, &batches, &mut check_for_dollars);

        assert_eq!(keyids.get("k1"), Some(&"150-0".to_string()));
        assert_eq!(keyids.get("k2"), Some(&"150-0".to_string()));
        assert_eq!(keyids.get("k3"), Some(&"50-0".to_string()));
        assert!(!check_for_dollars);
    }

    #[test]
    fn resync_is_a_one_shot_once_a_real_id_has_been_seen() {
        let mut keyids: HashMap<String, String> = HashMap::new();
        keyids.insert("k1".to_string(), "100-0".to_string());

        let first_batch: Vec<(String, Vec<Entry>)> =
            vec![("k1".to_string(), vec![("150-0".to_string(), Attrs::new())])];
        let mut check_for_dollars = false; // already resolved by an earlier round
        resync_cursors(&mut keyids, &first_batch, &mut check_for_dollars);

        // A later key still parked on the sentinel must not be rewritten
        // retroactively once the one-shot window has closed.
        keyids.insert("k2".to_string(), SENTINEL_NEW_KEY.to_string());
        let second_batch: Vec<(String, Vec<Entry>)> =
            vec![("k1".to_string(), vec![("160-0".to_string(), Attrs::new())])];
        resync_cursors(&mut keyids, &second_batch, &mut check_for_dollars);

        assert_eq!(keyids.get("k1"), Some(&"160-0".to_string()));
        assert_eq!(keyids.get("k2"), Some(&SENTINEL_NEW_KEY.to_string()));
    }

    #[test]
    fn dispatch_delivers_raw_entries_to_registered_callback() {
        let (tx, rx) = mpsc::channel();
        let callback: Arc<ReaderCallback> = Arc::new(move |entries: Vec<Entry>| {
            tx.send(entries.len()).unwrap();
        });
        callback(vec![("1-0".to_string(), Attrs::new()), ("2-0".to_string(), Attrs::new())]);
        assert_eq!(rx.recv().unwrap(), 2);
    }
}
