//! The driver facade: a uniform interface over a single-node or cluster
//! Redis client, with the three-valued outcome sentinel described in the
//! component design — success, logical failure, or disconnected (`-1`,
//! `-2` reserved for cross-slot refusal on `copy`).
//!
//! This replaces the original's inheritance-based single/cluster dispatch
//! with one concrete type holding a tagged variant; nothing here is a trait
//! object, and there is no virtual call in the hot path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use redis::{Commands, ConnectionLike, FromRedisValue};

use crate::codec::Attrs;
use crate::config::Options;
use crate::error::AdapterError;

pub const DISCONNECTED: i64 = -1;
pub const CROSS_SLOT: i64 = -2;

/// A stream entry as returned by a range/read command: its ID and field map.
pub type Entry = (String, Attrs);

enum DriverHandle {
    Cluster(redis::cluster::ClusterClient),
    Single(redis::Client),
}

enum AnyConnection {
    Single(redis::Connection),
    Cluster(redis::cluster::ClusterConnection),
}

impl AnyConnection {
    fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> redis::RedisResult<T> {
        match self {
            AnyConnection::Single(c) => cmd.query(c),
            AnyConnection::Cluster(c) => cmd.query(c),
        }
    }
}

fn open_single(options: &Options) -> redis::RedisResult<redis::Client> {
    redis::Client::open(options.single_node_url())
}

fn try_open_cluster(options: &Options) -> Option<redis::cluster::ClusterClient> {
    if options.path.is_some() {
        return None; // cluster clients don't speak Unix sockets
    }
    let url = options.single_node_url();
    let client = redis::cluster::ClusterClientBuilder::new(vec![url]).build().ok()?;
    client.get_connection().ok()?;
    Some(client)
}

fn build_handle(options: &Options) -> Result<DriverHandle, AdapterError> {
    if let Some(cluster) = try_open_cluster(options) {
        return Ok(DriverHandle::Cluster(cluster));
    }
    let single = open_single(options).map_err(AdapterError::Connect)?;
    let mut conn = single.get_connection().map_err(AdapterError::Connect)?;
    redis::cmd("PING").query::<String>(&mut conn).map_err(AdapterError::Connect)?;
    Ok(DriverHandle::Single(single))
}

/// `true` once the "server doesn't support HEXPIRE" warning has fired, so it
/// logs exactly once per process rather than once per call.
static HEXPIRE_UNSUPPORTED_LOGGED: AtomicBool = AtomicBool::new(false);

pub struct Driver {
    handle: RwLock<Option<DriverHandle>>,
    options: Options,
}

impl Driver {
    pub fn connect(options: Options) -> Result<Self, AdapterError> {
        let handle = build_handle(&options)?;
        Ok(Driver { handle: RwLock::new(Some(handle)), options })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Lazily attempt a fresh connection, replacing the held handle on
    /// success. Called only by the reconnect supervisor.
    pub fn reconnect(&self) -> bool {
        match build_handle(&self.options) {
            Ok(handle) => {
                *self.handle.write().unwrap() = Some(handle);
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "reconnect attempt failed");
                false
            }
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut AnyConnection) -> redis::RedisResult<T>) -> Option<redis::RedisResult<T>> {
        let guard = self.handle.read().unwrap();
        let handle = guard.as_ref()?;
        let mut conn = match handle {
            DriverHandle::Single(c) => c.get_connection().ok().map(AnyConnection::Single),
            DriverHandle::Cluster(c) => c.get_connection().ok().map(AnyConnection::Cluster),
        }?;
        Some(f(&mut conn))
    }

    /// Run `cmd`, mapping any driver error to the disconnected sentinel and
    /// logging once. `ok_default` is returned verbatim on a disconnected
    /// facade (no connection currently held).
    fn sentinel_call<T: FromRedisValue>(&self, op: &'static str, key: &str, cmd: redis::Cmd) -> Option<T> {
        match self.with_connection(|conn| conn.query::<T>(&cmd)) {
            None => None,
            Some(Ok(value)) => Some(value),
            Some(Err(err)) => {
                tracing::error!(op, key, error = %err, "redis operation failed");
                None
            }
        }
    }

    pub fn ping(&self) -> bool {
        self.sentinel_call::<String>("ping", "", redis::cmd("PING")).is_some()
    }

    pub fn del(&self, key: &str) -> i64 {
        self.sentinel_call::<i64>("del", key, redis::cmd("DEL").arg(key)).unwrap_or(DISCONNECTED)
    }

    pub fn exists(&self, key: &str) -> i64 {
        self.sentinel_call::<i64>("exists", key, redis::cmd("EXISTS").arg(key)).unwrap_or(DISCONNECTED)
    }

    /// Cluster hash slot for `key`; `0` for a single-node server (a valid
    /// slot, not an error), negative on a disconnected facade.
    pub fn keyslot(&self, key: &str) -> i64 {
        let guard = self.handle.read().unwrap();
        match guard.as_ref() {
            Some(DriverHandle::Single(_)) => 0,
            Some(DriverHandle::Cluster(_)) => {
                drop(guard);
                self.sentinel_call::<i64>("keyslot", key, redis::cmd("CLUSTER").arg("KEYSLOT").arg(key))
                    .unwrap_or(DISCONNECTED)
            }
            None => DISCONNECTED,
        }
    }

    /// `1` copied, `0` not copied (e.g. destination exists), `-1`
    /// disconnected, `-2` cross-slot (caller should fall back to a
    /// range-read-then-add for streams, as the adapter layer does).
    pub fn copy(&self, src: &str, dst: &str) -> i64 {
        match self.with_connection(|conn| conn.query::<i64>(redis::cmd("COPY").arg(src).arg(dst))) {
            None => DISCONNECTED,
            Some(Ok(n)) => n,
            Some(Err(err)) => {
                if err.to_string().contains("CROSSSLOT") {
                    CROSS_SLOT
                } else {
                    tracing::error!(op = "copy", src, dst, error = %err, "redis operation failed");
                    DISCONNECTED
                }
            }
        }
    }

    pub fn rename(&self, src: &str, dst: &str) -> bool {
        self.sentinel_call::<String>("rename", src, redis::cmd("RENAME").arg(src).arg(dst)).is_some()
    }

    /// Server time as `(seconds, microseconds)`, both as decimal strings.
    pub fn time(&self) -> Option<(String, String)> {
        self.sentinel_call::<(String, String)>("time", "", redis::cmd("TIME"))
    }

    pub fn xrange(&self, key: &str, start: &str, end: &str, count: Option<usize>) -> Option<Vec<Entry>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg(start).arg(end);
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        self.sentinel_call("xrange", key, cmd)
    }

    pub fn xrevrange(&self, key: &str, end: &str, start: &str, count: Option<usize>) -> Option<Vec<Entry>> {
        let mut cmd = redis::cmd("XREVRANGE");
        cmd.arg(key).arg(end).arg(start);
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        self.sentinel_call("xrevrange", key, cmd)
    }

    /// Blocking multi-key read. A driver-side timeout is treated as success
    /// with an empty result, not a failure — the caller's loop just iterates
    /// again, which is what lets the stop-key protocol unblock a read
    /// without tearing down the connection.
    pub fn xread_multi_block(&self, keyids: &[(String, String)], timeout_ms: u64) -> Option<Vec<(String, Vec<Entry>)>> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("BLOCK").arg(timeout_ms).arg("STREAMS");
        for (key, _) in keyids {
            cmd.arg(key);
        }
        for (_, id) in keyids {
            cmd.arg(id);
        }
        match self.with_connection(|conn| conn.query::<Option<Vec<(String, Vec<Entry>)>>>(&cmd)) {
            None => None,
            Some(Ok(Some(streams))) => Some(streams),
            Some(Ok(None)) => Some(Vec::new()), // driver timeout: success, empty
            Some(Err(err)) => {
                tracing::error!(op = "xread_multi_block", error = %err, "redis operation failed");
                None
            }
        }
    }

    pub fn xadd(&self, key: &str, id: &str, attrs: &Attrs) -> Option<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg(id);
        for (field, value) in attrs {
            cmd.arg(field).arg(value);
        }
        self.sentinel_call("xadd", key, cmd)
    }

    pub fn xtrim(&self, key: &str, threshold: usize, approximate: bool) -> i64 {
        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(key).arg("MAXLEN");
        if approximate {
            cmd.arg("~");
        }
        cmd.arg(threshold);
        self.sentinel_call::<i64>("xtrim", key, cmd).unwrap_or(DISCONNECTED)
    }

    pub fn xadd_trim(&self, key: &str, id: &str, attrs: &Attrs, trim: usize) -> Option<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("MAXLEN").arg("~").arg(trim).arg(id);
        for (field, value) in attrs {
            cmd.arg(field).arg(value);
        }
        self.sentinel_call("xadd_trim", key, cmd)
    }

    pub fn hexists(&self, key: &str, field: &str) -> i64 {
        self.sentinel_call::<i64>("hexists", key, redis::cmd("HEXISTS").arg(key).arg(field)).unwrap_or(DISCONNECTED)
    }

    pub fn hset(&self, key: &str, field: &str, value: &str) -> bool {
        self.sentinel_call::<i64>("hset", key, redis::cmd("HSET").arg(key).arg(field).arg(value)).is_some()
    }

    /// `2` expiration set and field already expired, `1` expiration set and
    /// unexpired, `0` condition not met, `-1` disconnected/error, `-2`
    /// key/field missing, `-3` unsupported (server predates Redis 7.4's
    /// `HEXPIRE`).
    pub fn hexpire(&self, key: &str, field: &str, seconds: u64) -> i64 {
        let cmd = redis::cmd("HEXPIRE").arg(key).arg(seconds).arg("FIELDS").arg(1).arg(field).to_owned();
        match self.with_connection(|conn| conn.query::<Vec<i64>>(&cmd)) {
            None => DISCONNECTED,
            Some(Ok(results)) => results.first().copied().unwrap_or(DISCONNECTED),
            Some(Err(err)) => {
                if err.to_string().to_lowercase().contains("unknown command") {
                    if !HEXPIRE_UNSUPPORTED_LOGGED.swap(true, Ordering::Relaxed) {
                        tracing::warn!("server does not support HEXPIRE; watchdog TTL downgraded to a no-op");
                    }
                    -3
                } else {
                    tracing::error!(op = "hexpire", key, error = %err, "redis operation failed");
                    DISCONNECTED
                }
            }
        }
    }

    pub fn hkeys(&self, key: &str) -> Option<Vec<String>> {
        self.sentinel_call("hkeys", key, redis::cmd("HKEYS").arg(key))
    }

    pub fn publish(&self, channel: &str, message: &str) -> i64 {
        self.sentinel_call::<i64>("publish", channel, redis::cmd("PUBLISH").arg(channel).arg(message))
            .unwrap_or(DISCONNECTED)
    }

    /// Open a dedicated connection for pub/sub use. For a cluster handle,
    /// Redis Cluster fans PUBLISH out cluster-wide (since Redis 7), so a
    /// connection to any one node sees every published message — the
    /// listener does not need a routed, slot-aware subscriber.
    pub fn open_pubsub_connection(&self) -> Option<redis::Connection> {
        let guard = self.handle.read().unwrap();
        match guard.as_ref()? {
            DriverHandle::Single(client) => client.get_connection().ok(),
            DriverHandle::Cluster(_) => redis::Client::open(self.options.single_node_url()).ok()?.get_connection().ok(),
        }
    }
}
