//! `RedisAdapter`: the public facade wiring the driver, key builder, worker
//! pool, pub/sub listener, and stream reader engine into the typed API
//! described in the component design.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::ValueCache;
use crate::codec::{Attrs, StreamCodec, StringCodec};
use crate::config::Options;
use crate::driver::{Driver, Entry, DISCONNECTED};
use crate::error::AdapterError;
use crate::keys::{KeyBuilder, CHANNEL_STUB, LOG_STUB, STATUS_STUB, STREAM_STUB};
use crate::pubsub::{ListenFn, Listener};
use crate::reader::{ReaderCallback, ReaderEngine};
use crate::time::Time;
use crate::workers::WorkerPool;

/// Sentinel returned by a write operation when the facade is not currently
/// connected, distinguishable from [`Time::INVALID`] (a logical failure on
/// an otherwise-live connection, e.g. a malformed ID rejected by the server).
pub const NOT_CONNECTED: Time = Time { nanos: u64::MAX, seqnum: u64::MAX };

/// A single client-side handle onto one logical stream/keyspace "home base",
/// with background pub/sub dispatch and stream-tailing readers layered on
/// top of a reconnect-aware driver.
pub struct RedisAdapter {
    driver: Arc<Driver>,
    keys: Arc<KeyBuilder>,
    workers: Arc<WorkerPool>,
    listener: Arc<Listener>,
    reader: Arc<ReaderEngine>,
    connecting: Arc<AtomicBool>,
}

impl RedisAdapter {
    /// Open a connection under `base_key`, starting `worker_count` dispatch
    /// workers. The listener and reader engine are constructed idle; nothing
    /// subscribes or tails a stream until a caller asks it to.
    pub fn new(base_key: impl Into<String>, options: Options, worker_count: usize) -> Result<Self, AdapterError> {
        options.validate()?;
        let timeout_ms = options.timeout.as_millis() as u64;
        let driver = Arc::new(Driver::connect(options)?);
        let keys = Arc::new(KeyBuilder::new(base_key));
        let workers = Arc::new(WorkerPool::new(worker_count)?);
        let listener = Arc::new(Listener::new(Arc::clone(&driver), Arc::clone(&keys), Arc::clone(&workers)));
        let reader = Arc::new(ReaderEngine::new(Arc::clone(&driver), Arc::clone(&keys), Arc::clone(&workers), timeout_ms));
        Ok(RedisAdapter {
            driver,
            keys,
            workers,
            listener,
            reader,
            connecting: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn base_key(&self) -> &str {
        self.keys.base()
    }

    // ---- connection-level pass-throughs -----------------------------

    pub fn ping(&self) -> bool {
        self.driver.ping()
    }

    pub fn exists(&self, key: &str) -> i64 {
        self.driver.exists(key)
    }

    pub fn delete(&self, key: &str) -> i64 {
        self.driver.del(key)
    }

    pub fn keyslot(&self, key: &str) -> i64 {
        self.driver.keyslot(key)
    }

    /// `COPY src dst`; falls back to nothing automatically on a cross-slot
    /// refusal — callers that need a cross-slot copy must range-read and
    /// re-add themselves, since Redis Cluster has no atomic cross-slot copy.
    pub fn copy(&self, src: &str, dst: &str) -> i64 {
        let result = self.driver.copy(src, dst);
        if result == DISCONNECTED {
            self.connect();
        }
        result
    }

    pub fn rename(&self, src: &str, dst: &str) -> bool {
        self.driver.rename(src, dst)
    }

    // ---- watchdog (hash-field TTL) --------------------------------------

    pub fn hexists(&self, key: &str, field: &str) -> i64 {
        self.driver.hexists(key, field)
    }

    pub fn hset(&self, key: &str, field: &str, value: &str) -> bool {
        self.driver.hset(key, field, value)
    }

    /// Arm a TTL on a single hash field. `-3` means the server predates
    /// Redis 7.4's `HEXPIRE` and the watchdog has been downgraded to a
    /// no-op; see `driver::Driver::hexpire`.
    pub fn hexpire(&self, key: &str, field: &str, seconds: u64) -> i64 {
        self.driver.hexpire(key, field, seconds)
    }

    pub fn hkeys(&self, key: &str) -> Option<Vec<String>> {
        let result = self.driver.hkeys(key);
        self.reconnect_if_disconnected(&result);
        result
    }

    // ---- typed stream API --------------------------------------------

    fn keyed(&self, stub: &str, sub: &str, base_override: Option<&str>) -> String {
        self.keys.build(&format!("{stub}:{sub}"), base_override)
    }

    fn stream_key(&self, sub: &str, base_override: Option<&str>) -> String {
        self.keyed(STREAM_STUB, sub, base_override)
    }

    /// Ascending-order range read over `[min, max]`, decoded with `C`.
    /// Entries that fail to decode (e.g. a foreign writer's payload) are
    /// dropped rather than surfaced as an error.
    pub fn forward_range<V, C: StreamCodec<V>>(&self, sub: &str, min: Time, max: Time, count: Option<usize>) -> Vec<(Time, V)> {
        let key = self.stream_key(sub, None);
        let raw = self.driver.xrange(&key, &min.id_or_min(), &max.id_or_max(), count);
        self.reconnect_if_disconnected(&raw);
        decode_entries::<V, C>(raw.unwrap_or_default())
    }

    /// Descending-order read over `(-inf, max]`, re-reversed to ascending
    /// order before it reaches the caller.
    pub fn reverse_range<V, C: StreamCodec<V>>(&self, sub: &str, max: Time, count: Option<usize>) -> Vec<(Time, V)> {
        let key = self.stream_key(sub, None);
        let raw = self.driver.xrevrange(&key, &max.id_or_max(), "-", count);
        self.reconnect_if_disconnected(&raw);
        let mut decoded = decode_entries::<V, C>(raw.unwrap_or_default());
        decoded.reverse();
        decoded
    }

    /// The single most recent entry at or before `max`, or `None` if the
    /// stream is empty, the disconnected outcome and the no-data outcome are
    /// not distinguished here — both read as `None`.
    pub fn single_at_or_before<V, C: StreamCodec<V>>(&self, sub: &str, max: Time) -> Option<(Time, V)> {
        let key = self.stream_key(sub, None);
        let raw = self.driver.xrevrange(&key, &max.id_or_max(), "-", Some(1));
        self.reconnect_if_disconnected(&raw);
        decode_entries::<V, C>(raw.unwrap_or_default()).into_iter().next()
    }

    /// Add one entry. Returns the ID actually assigned, [`Time::INVALID`] on
    /// a logical failure (e.g. a rejected explicit ID), or [`NOT_CONNECTED`]
    /// if the facade has no live connection.
    pub fn add_single<V, C: StreamCodec<V>>(&self, sub: &str, value: &V, time: Time, trim: Option<usize>) -> Time {
        let key = self.stream_key(sub, None);
        let attrs = C::encode(value);
        let id = match trim {
            Some(trim) => self.driver.xadd_trim(&key, &time.id_or_now(), &attrs, trim),
            None => self.driver.xadd(&key, &time.id_or_now(), &attrs),
        };
        match id {
            None => {
                self.connect();
                NOT_CONNECTED
            }
            Some(id) if id.is_empty() => Time::INVALID,
            Some(id) => Time::parse(&id),
        }
    }

    /// Add each of `items` in order, trimming once afterwards to
    /// `max(trim, entries successfully added)`. Returns the IDs actually
    /// assigned, in the same order; an entry that failed to add (disconnect
    /// or rejection) is simply absent from the result, not padded with a
    /// sentinel.
    pub fn add_many<V, C: StreamCodec<V>>(&self, sub: &str, items: &[(Time, V)], trim: Option<usize>) -> Vec<Time> {
        let key = self.stream_key(sub, None);
        let mut added = Vec::with_capacity(items.len());
        let mut disconnected = false;
        for (time, value) in items {
            let attrs = C::encode(value);
            match self.driver.xadd(&key, &time.id_or_now(), &attrs) {
                Some(id) if !id.is_empty() => added.push(Time::parse(&id)),
                Some(_) => {}
                None => disconnected = true,
            }
        }
        if disconnected {
            self.connect();
        }
        if let Some(trim) = trim {
            if !added.is_empty() {
                self.driver.xtrim(&key, trim.max(added.len()), true);
            }
        }
        added
    }

    // ---- status (single latest value, under STATUS_STUB) -----------------

    /// Most recently set status string, or `None` if nothing has been set
    /// yet or the facade is disconnected.
    pub fn get_status(&self, sub: &str, base_override: Option<&str>) -> Option<String> {
        let key = self.keyed(STATUS_STUB, sub, base_override);
        let raw = self.driver.xrevrange(&key, "+", "-", Some(1));
        self.reconnect_if_disconnected(&raw);
        decode_entries::<String, StringCodec>(raw.unwrap_or_default()).into_iter().next().map(|(_, v)| v)
    }

    /// Overwrite the status string, trimming the underlying stream to the
    /// single most recent entry.
    pub fn set_status(&self, sub: &str, base_override: Option<&str>, value: &str) -> Time {
        let key = self.keyed(STATUS_STUB, sub, base_override);
        let attrs = StringCodec::encode(&value.to_string());
        match self.driver.xadd_trim(&key, &Time::now().id_or_now(), &attrs, 1) {
            None => {
                self.connect();
                NOT_CONNECTED
            }
            Some(id) if id.is_empty() => Time::INVALID,
            Some(id) => Time::parse(&id),
        }
    }

    // ---- log (append-only string stream, under LOG_STUB) ------------------

    /// Append a log message, trimming the log stream to `trim` entries
    /// afterwards if given.
    pub fn add_log(&self, sub: &str, message: &str, trim: Option<usize>) -> Time {
        let key = self.keyed(LOG_STUB, sub, None);
        let attrs = StringCodec::encode(&message.to_string());
        let now_id = Time::now().id_or_now();
        let id = match trim {
            Some(trim) => self.driver.xadd_trim(&key, &now_id, &attrs, trim),
            None => self.driver.xadd(&key, &now_id, &attrs),
        };
        match id {
            None => {
                self.connect();
                NOT_CONNECTED
            }
            Some(id) if id.is_empty() => Time::INVALID,
            Some(id) => Time::parse(&id),
        }
    }

    /// Ascending-order log read over `[min, max]`.
    pub fn log_range(&self, sub: &str, min: Time, max: Time, count: Option<usize>) -> Vec<(Time, String)> {
        let key = self.keyed(LOG_STUB, sub, None);
        let raw = self.driver.xrange(&key, &min.id_or_min(), &max.id_or_max(), count);
        self.reconnect_if_disconnected(&raw);
        decode_entries::<String, StringCodec>(raw.unwrap_or_default())
    }

    /// Descending-order log read over `(-inf, max]`, re-reversed to
    /// ascending order before it reaches the caller.
    pub fn log_before(&self, sub: &str, max: Time, count: Option<usize>) -> Vec<(Time, String)> {
        let key = self.keyed(LOG_STUB, sub, None);
        let raw = self.driver.xrevrange(&key, &max.id_or_max(), "-", count);
        self.reconnect_if_disconnected(&raw);
        let mut decoded = decode_entries::<String, StringCodec>(raw.unwrap_or_default());
        decoded.reverse();
        decoded
    }

    /// Ascending-order log read over `[min, +inf)`.
    pub fn log_after(&self, sub: &str, min: Time, count: Option<usize>) -> Vec<(Time, String)> {
        self.log_range(sub, min, Time::INVALID, count)
    }

    // ---- pub/sub --------------------------------------------------------

    fn channel_key(&self, sub: &str, base_override: Option<&str>) -> String {
        self.keys.build(&format!("{CHANNEL_STUB}:{sub}"), base_override)
    }

    pub fn subscribe(&self, sub: &str, base_override: Option<&str>, func: impl Fn(String, String, String) + Send + Sync + 'static) -> bool {
        let channel = self.channel_key(sub, base_override);
        let func: Arc<ListenFn> = Arc::new(func);
        self.listener.subscribe(channel, func)
    }

    pub fn psubscribe(&self, pattern_sub: &str, base_override: Option<&str>, func: impl Fn(String, String, String) + Send + Sync + 'static) -> bool {
        let pattern = self.channel_key(pattern_sub, base_override);
        let func: Arc<ListenFn> = Arc::new(func);
        self.listener.psubscribe(pattern, func)
    }

    pub fn unsubscribe(&self, sub: &str, base_override: Option<&str>) -> bool {
        let channel = self.channel_key(sub, base_override);
        self.listener.unsubscribe(&channel)
    }

    pub fn publish(&self, sub: &str, base_override: Option<&str>, message: &str) -> i64 {
        let channel = self.channel_key(sub, base_override);
        let result = self.driver.publish(&channel, message);
        if result == DISCONNECTED {
            self.connect();
        }
        result
    }

    // ---- stream readers --------------------------------------------------

    /// Tail a schema stream sub-key, decoding each batch with `C` before
    /// handing it to `func` as `(base, sub, entries)`.
    pub fn add_stream_reader<V, C>(
        &self,
        sub: &str,
        base_override: Option<&str>,
        func: impl Fn(String, String, Vec<(Time, V)>) + Send + Sync + 'static,
    ) -> bool
    where
        V: Send + 'static,
        C: StreamCodec<V>,
    {
        let key = self.stream_key(sub, base_override);
        let base = base_override.unwrap_or_else(|| self.keys.base()).to_string();
        let sub_owned = sub.to_string();
        let callback: Arc<ReaderCallback> = Arc::new(move |raw: Vec<Entry>| {
            func(base.clone(), sub_owned.clone(), decode_entries::<V, C>(raw));
        });
        self.reader.add_reader(key, base_override, sub, callback)
    }

    pub fn remove_stream_reader(&self, sub: &str, base_override: Option<&str>) -> bool {
        let key = self.stream_key(sub, base_override);
        self.reader.remove_reader(&key)
    }

    /// Tail the status key, decoded as a string, as `(base, sub, entries)`.
    pub fn add_status_reader(&self, sub: &str, base_override: Option<&str>, func: impl Fn(String, String, Vec<(Time, String)>) + Send + Sync + 'static) -> bool {
        let key = self.keyed(STATUS_STUB, sub, base_override);
        let base = base_override.unwrap_or_else(|| self.keys.base()).to_string();
        let sub_owned = sub.to_string();
        let callback: Arc<ReaderCallback> = Arc::new(move |raw: Vec<Entry>| {
            func(base.clone(), sub_owned.clone(), decode_entries::<String, StringCodec>(raw));
        });
        self.reader.add_reader(key, base_override, sub, callback)
    }

    pub fn remove_status_reader(&self, sub: &str, base_override: Option<&str>) -> bool {
        let key = self.keyed(STATUS_STUB, sub, base_override);
        self.reader.remove_reader(&key)
    }

    /// Tail the log key, decoded as a string, as `(base, sub, entries)`.
    pub fn add_log_reader(&self, sub: &str, func: impl Fn(String, String, Vec<(Time, String)>) + Send + Sync + 'static) -> bool {
        let key = self.keyed(LOG_STUB, sub, None);
        let base = self.keys.base().to_string();
        let sub_owned = sub.to_string();
        let callback: Arc<ReaderCallback> = Arc::new(move |raw: Vec<Entry>| {
            func(base.clone(), sub_owned.clone(), decode_entries::<String, StringCodec>(raw));
        });
        self.reader.add_reader(key, None, sub, callback)
    }

    pub fn remove_log_reader(&self, sub: &str) -> bool {
        let key = self.keyed(LOG_STUB, sub, None);
        self.reader.remove_reader(&key)
    }

    /// Tail an arbitrary non-schema key. Rejected if `key` is itself
    /// recognised as one of this adapter's own schema keys. `func` receives
    /// the raw key as both the base and sub position, so a caller that
    /// registers more than one generic key can still tell them apart.
    pub fn add_generic_reader(&self, key: impl Into<String>, func: impl Fn(String, String, Vec<(Time, Attrs)>) + Send + Sync + 'static) -> bool {
        let key = key.into();
        let key_for_callback = key.clone();
        let callback: Arc<ReaderCallback> = Arc::new(move |raw: Vec<Entry>| {
            let entries = raw.into_iter().map(|(id, attrs)| (Time::parse(&id), attrs)).collect();
            func(key_for_callback.clone(), key_for_callback.clone(), entries);
        });
        self.reader.add_generic_reader(key, callback)
    }

    pub fn remove_generic_reader(&self, key: &str) -> bool {
        self.reader.remove_reader(key)
    }

    pub fn set_defer_readers(&self, defer: bool) -> bool {
        self.reader.set_defer(defer)
    }

    // ---- latest-value cache ----------------------------------------------

    /// A cache that always holds the most recently observed entry on a
    /// schema stream sub-key: lazily backfilled from a single at-or-before
    /// read the first time it's consulted, then kept current by an internal
    /// stream reader for as long as this `RedisAdapter` lives.
    pub fn cache<V, C>(&self, sub: &str) -> Arc<ValueCache<V>>
    where
        V: Clone + Send + 'static,
        C: StreamCodec<Vec<V>> + 'static,
    {
        let key = self.stream_key(sub, None);
        let driver = Arc::clone(&self.driver);
        let init_key = key.clone();
        let cache = Arc::new(ValueCache::<V>::new(move || match driver.xrevrange(&init_key, "+", "-", Some(1)) {
            Some(entries) => match entries.into_iter().next() {
                Some((id, attrs)) => (Time::parse(&id), C::decode(&attrs).unwrap_or_default()),
                None => (Time::INVALID, Vec::new()),
            },
            None => (Time::INVALID, Vec::new()),
        }));

        let cache_for_writes = Arc::clone(&cache);
        let callback: Arc<ReaderCallback> = Arc::new(move |raw: Vec<Entry>| {
            if let Some((id, attrs)) = raw.into_iter().last() {
                if let Some(data) = C::decode(&attrs) {
                    cache_for_writes.write_buffer(Time::parse(&id), data);
                }
            }
        });
        self.reader.add_reader(key, None, sub, callback);
        cache
    }

    // ---- reconnect supervisor ---------------------------------------------

    /// Kick off a reconnect attempt if one is not already underway. Cheap to
    /// call on every failure signal: the `connecting` flag makes repeated
    /// calls from many concurrent operations collapse onto a single attempt.
    fn connect(&self) {
        if self.connecting.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let driver = Arc::clone(&self.driver);
        let reader = Arc::clone(&self.reader);
        let listener = Arc::clone(&self.listener);
        let connecting = Arc::clone(&self.connecting);
        let spawned = std::thread::Builder::new().name("radapter-reconnect".to_string()).spawn(move || {
            tracing::info!("reconnect: attempting");
            if driver.reconnect() {
                reader.stop_all();
                reader.start_all();
                listener.restart();
                tracing::info!("reconnect: succeeded, listener and readers restored");
            } else {
                tracing::warn!("reconnect: attempt failed");
            }
            connecting.store(false, Ordering::SeqCst);
        });
        if spawned.is_err() {
            tracing::error!("failed to spawn reconnect thread");
            self.connecting.store(false, Ordering::SeqCst);
        }
    }

    fn reconnect_if_disconnected<T>(&self, result: &Option<T>) {
        if result.is_none() {
            self.connect();
        }
    }
}

fn decode_entries<V, C: StreamCodec<V>>(raw: Vec<Entry>) -> Vec<(Time, V)> {
    raw.into_iter().filter_map(|(id, attrs)| Some((Time::parse(&id), C::decode(&attrs)?))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_sentinel_differs_from_invalid() {
        assert_ne!(NOT_CONNECTED, Time::INVALID);
        assert!(!Time::INVALID.ok());
    }
}
