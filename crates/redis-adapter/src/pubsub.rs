//! The pub/sub listener: one background consumer thread multiplexing
//! exact-channel and pattern subscriptions, dispatching onto the worker pool.
//!
//! Subscribing, pattern-subscribing, and unsubscribing all quiesce the
//! listener first (stop, mutate the subscription tables, restart) so the
//! tables are never written while the consumer thread might be reading them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::driver::Driver;
use crate::keys::KeyBuilder;
use crate::workers::WorkerPool;

const THREAD_START_CONFIRM: Duration = Duration::from_millis(20);

/// `fn(base, sub, message)`.
pub type ListenFn = dyn Fn(String, String, String) + Send + Sync;

struct Subs {
    exact: HashMap<String, Vec<Arc<ListenFn>>>,
    pattern: HashMap<String, Vec<Arc<ListenFn>>>,
}

pub struct Listener {
    driver: Arc<Driver>,
    keys: Arc<KeyBuilder>,
    workers: Arc<WorkerPool>,
    stop_channel: String,
    subs: Mutex<Subs>,
    handle: Mutex<Option<JoinHandle<()>>>,
    run: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(driver: Arc<Driver>, keys: Arc<KeyBuilder>, workers: Arc<WorkerPool>) -> Self {
        let stop_channel = keys.build_default(crate::keys::STOP_STUB);
        Listener {
            driver,
            keys,
            workers,
            stop_channel,
            subs: Mutex::new(Subs { exact: HashMap::new(), pattern: HashMap::new() }),
            handle: Mutex::new(None),
            run: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe `func` to an exact channel key; restarts the listener.
    pub fn subscribe(&self, channel: String, func: Arc<ListenFn>) -> bool {
        self.stop();
        self.subs.lock().unwrap().exact.entry(channel).or_default().push(func);
        self.start()
    }

    /// Subscribe `func` to a channel pattern; restarts the listener. Rejects
    /// patterns when the home base contains characters that would make the
    /// hash tag ambiguous.
    pub fn psubscribe(&self, pattern: String, func: Arc<ListenFn>) -> bool {
        if KeyBuilder::has_ambiguous_chars(self.keys.base()) {
            return false;
        }
        self.stop();
        self.subs.lock().unwrap().pattern.entry(pattern).or_default().push(func);
        self.start()
    }

    /// Remove every callback registered for `channel`, whether it was an
    /// exact-channel or pattern subscription, restarting the listener if any
    /// subscription remains.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.stop();
        {
            let mut subs = self.subs.lock().unwrap();
            subs.exact.remove(channel);
            subs.pattern.remove(channel);
        }
        let any_left = {
            let subs = self.subs.lock().unwrap();
            !subs.exact.is_empty() || !subs.pattern.is_empty()
        };
        if any_left { self.start() } else { true }
    }

    fn start(&self) -> bool {
        let mut handle_guard = self.handle.lock().unwrap();
        if handle_guard.is_some() {
            return false;
        }

        let (exact, pattern) = {
            let subs = self.subs.lock().unwrap();
            (subs.exact.clone_keys(), subs.pattern.clone_keys())
        };
        if exact.is_empty() && pattern.is_empty() {
            return true; // nothing to listen for; a transient no-op
        }

        let rendezvous = Arc::new((Mutex::new(false), Condvar::new()));
        let rendezvous_thread = Arc::clone(&rendezvous);
        let driver = Arc::clone(&self.driver);
        let keys = Arc::clone(&self.keys);
        let workers = Arc::clone(&self.workers);
        let run = Arc::clone(&self.run);
        let stop_channel = self.stop_channel.clone();
        run.store(false, Ordering::SeqCst);

        let subs_for_dispatch = Arc::new(Mutex::new(None::<(HashMap<String, Vec<Arc<ListenFn>>>, HashMap<String, Vec<Arc<ListenFn>>>)>));
        *subs_for_dispatch.lock().unwrap() = Some({
            let subs = self.subs.lock().unwrap();
            (subs.exact.clone(), subs.pattern.clone())
        });
        let dispatch_tables = Arc::clone(&subs_for_dispatch);

        let handle = std::thread::Builder::new()
            .name("radapter-listener".to_string())
            .spawn(move || {
                let conn = match driver.open_pubsub_connection() {
                    Some(conn) => conn,
                    None => {
                        tracing::error!("failed to obtain a subscriber connection");
                        let (lock, cv) = &*rendezvous_thread;
                        *lock.lock().unwrap() = true;
                        cv.notify_all();
                        return;
                    }
                };
                let mut conn = conn;
                let mut pubsub = conn.as_pubsub();

                for channel in &exact {
                    if let Err(err) = pubsub.subscribe(channel) {
                        tracing::error!(channel, error = %err, "subscribe failed");
                    }
                }
                for pattern in &pattern {
                    if let Err(err) = pubsub.psubscribe(pattern) {
                        tracing::error!(pattern, error = %err, "psubscribe failed");
                    }
                }
                if let Err(err) = pubsub.subscribe(&stop_channel) {
                    tracing::error!(channel = %stop_channel, error = %err, "failed to subscribe stop channel");
                }

                run.store(true, Ordering::SeqCst);
                {
                    let (lock, cv) = &*rendezvous_thread;
                    *lock.lock().unwrap() = true;
                    cv.notify_all();
                }

                let (exact_subs, pattern_subs) = dispatch_tables.lock().unwrap().take().unwrap();

                while run.load(Ordering::SeqCst) {
                    match pubsub.get_message() {
                        Ok(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            if channel == stop_channel {
                                break;
                            }
                            let payload: String = msg.get_payload().unwrap_or_default();
                            if let Ok(pattern) = msg.get_pattern::<String>() {
                                if let Some(callbacks) = pattern_subs.get(&pattern) {
                                    dispatch(&workers, &keys, &channel, &payload, callbacks);
                                }
                            } else if let Some(callbacks) = exact_subs.get(&channel) {
                                dispatch(&workers, &keys, &channel, &payload, callbacks);
                            }
                        }
                        Err(err) => {
                            if err.is_timeout() {
                                continue;
                            }
                            tracing::error!(error = %err, "consume in listener");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn listener thread");

        let (lock, cv) = &*rendezvous;
        let guard = lock.lock().unwrap();
        let (guard, _timeout) = cv.wait_timeout_while(guard, THREAD_START_CONFIRM, |started| !*started).unwrap();
        let started = *guard;
        if !started {
            tracing::error!("start_listener timeout waiting for thread start");
        }
        *handle_guard = Some(handle);
        started
    }

    /// Stop then start the listener, preserving every subscription table
    /// entry untouched. Used by the reconnect supervisor.
    pub fn restart(&self) -> bool {
        self.stop();
        self.start()
    }

    fn stop(&self) -> bool {
        let mut handle_guard = self.handle.lock().unwrap();
        let handle = match handle_guard.take() {
            Some(handle) => handle,
            None => return false,
        };
        self.run.store(false, Ordering::SeqCst);
        self.driver.publish(&self.stop_channel, "");
        let _ = handle.join();
        true
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(workers: &WorkerPool, keys: &KeyBuilder, channel: &str, payload: &str, callbacks: &[Arc<ListenFn>]) {
    let (base, sub) = keys.split(channel);
    for cb in callbacks {
        let cb = Arc::clone(cb);
        let base = base.clone();
        let sub = sub.clone();
        let payload = payload.to_string();
        workers.submit(channel, move || cb(base, sub, payload));
    }
}

trait CloneKeys {
    fn clone_keys(&self) -> Vec<String>;
}

impl<V> CloneKeys for HashMap<String, V> {
    fn clone_keys(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_channel_is_built_from_the_home_base() {
        let driver_keys = KeyBuilder::new("BASE");
        assert_eq!(driver_keys.build_default(crate::keys::STOP_STUB), "{BASE}:[*-STOP-*]");
    }
}
