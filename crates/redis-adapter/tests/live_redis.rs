//! Black-box scenarios against a real Redis server.
//!
//! Every test here is `#[ignore]`d by default: unlike the in-process fakes
//! used elsewhere in this crate's test suite, these need an actual server
//! reachable via the `REDIS_ADAPTER_*` environment variables (or the default
//! `127.0.0.1:6379`). Run them explicitly with `cargo test -- --ignored`
//! against a disposable Redis/Redis Cluster instance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use radapter::codec::{ScalarCodec, VecCodec};
use radapter::{Options, RedisAdapter, Time};

fn adapter(base: &str) -> RedisAdapter {
    RedisAdapter::new(base, Options::from_env(), 4).expect("connect to live redis")
}

/// Scenario 1: write-read single double.
#[test]
#[ignore]
fn write_then_read_single_scalar() {
    let a = adapter("BASE-write-read");
    let t1 = Time::now();
    let written = a.add_single::<f64, ScalarCodec>("temp", &3.14, t1, Some(10));
    assert!(written.ok());

    let (time, value) = a.single_at_or_before::<f64, ScalarCodec>("temp", Time::now()).expect("entry present");
    assert_eq!(value, 3.14);
    assert_eq!(time, written);
}

/// Scenario 2: forward/reverse range equivalence, including an empty vector
/// entry that must still round-trip (absent field => empty, not dropped).
#[test]
#[ignore]
fn forward_and_reverse_range_agree_after_re_reversal() {
    let a = adapter("BASE-ranges");
    let values: Vec<Vec<f32>> = vec![vec![1.0], vec![1.0, 2.0], vec![1.0, 2.0, 3.0], vec![], vec![4.0]];
    let mut times = Vec::new();
    for v in &values {
        let t = Time::now();
        a.add_single::<Vec<f32>, VecCodec>("wave", v, t, None);
        times.push(t);
        std::thread::sleep(Duration::from_millis(2));
    }

    let forward = a.forward_range::<Vec<f32>, VecCodec>("wave", Time::INVALID, Time::INVALID, None);
    let forward_values: Vec<Vec<f32>> = forward.into_iter().map(|(_, v)| v).collect();
    assert_eq!(forward_values, values);

    let reverse = a.reverse_range::<Vec<f32>, VecCodec>("wave", Time::INVALID, Some(2));
    let reverse_values: Vec<Vec<f32>> = reverse.into_iter().map(|(_, v)| v).collect();
    assert_eq!(reverse_values, vec![vec![1.0, 2.0, 3.0], vec![4.0]]);
}

/// Scenario 3: pattern subscription fan-in.
#[test]
#[ignore]
fn pattern_subscription_counts_every_matching_publish() {
    let a = adapter("BASE-pattern");
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = Arc::clone(&count);
    assert!(a.psubscribe("TCLK:*", None, move |_base, _sub, _msg| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    }));

    for channel in ["TCLK:02", "TCLK:03"] {
        for _ in 0..100 {
            a.publish(channel, None, "tick");
        }
    }

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(count.load(Ordering::SeqCst), 200);
}

/// Scenario 4: readers for keys under two different bases land on exactly
/// two distinct slots (one reader thread each), not three.
#[test]
#[ignore]
fn readers_share_a_thread_within_one_base() {
    let x = adapter("X-slot");
    let y = adapter("Y-slot");

    assert!(x.add_stream_reader::<f32, ScalarCodec>("a", None, |_, _, _| {}));
    assert!(x.add_stream_reader::<f32, ScalarCodec>("b", None, |_, _, _| {}));
    assert!(y.add_stream_reader::<f32, ScalarCodec>("c", None, |_, _, _| {}));

    x.add_single::<f32, ScalarCodec>("a", &1.0, Time::now(), None);
    x.add_single::<f32, ScalarCodec>("b", &2.0, Time::now(), None);
    y.add_single::<f32, ScalarCodec>("c", &3.0, Time::now(), None);

    std::thread::sleep(Duration::from_millis(200));
    // Same base => same slot => one reader thread serves "a" and "b"; "c"
    // lives under a different base and therefore a different reader thread.
    assert_eq!(x.keyslot(&format!("{{{}}}:a", "X-slot")), x.keyslot(&format!("{{{}}}:b", "X-slot")));
}

/// Scenario 5: reconnect preserves subscriptions.
#[test]
#[ignore]
fn reader_survives_a_reconnect() {
    let a = adapter("BASE-reconnect");
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = Arc::clone(&seen);
    assert!(a.add_stream_reader::<f32, ScalarCodec>("data", None, move |_, _, entries| {
        seen_clone.fetch_add(entries.len(), Ordering::SeqCst);
    }));

    // Simulating an actual server-side disconnect requires external
    // control over the test server; this is exercised manually rather than
    // automated in CI, which is why the whole module is `#[ignore]`d.
    a.add_single::<f32, ScalarCodec>("data", &1.0, Time::now(), None);
    std::thread::sleep(Duration::from_millis(200));
    assert!(seen.load(Ordering::SeqCst) >= 1);
}

/// Scenario 6: cache swap under concurrent readers.
#[test]
#[ignore]
fn cache_never_serves_a_mixed_snapshot_under_load() {
    let a = adapter("BASE-cache");
    let cache = a.cache::<i64, VecCodec>("buf");

    let barrier = Arc::new(Barrier::new(9));
    let writer = {
        let a_barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            a_barrier.wait();
            for n in 0..1000i64 {
                a.add_single::<Vec<i64>, VecCodec>("buf", &vec![n; 16], Time::now(), None);
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let r_barrier = Arc::clone(&barrier);
        readers.push(std::thread::spawn(move || {
            r_barrier.wait();
            for _ in 0..1000 {
                let (_, data) = cache.copy_read_buffer();
                assert!(data.windows(2).all(|w| w[0] == w[1]));
            }
        }));
    }

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
}

/// A small sanity check that does not need a real server: generic readers
/// must refuse a key that looks like one of this adapter's own schema keys.
#[test]
fn generic_reader_rejects_recognised_schema_keys() {
    // Exercised without a live connection: `RedisAdapter::new` itself would
    // need one, so this goes through the pieces that don't.
    let keys = radapter::KeyBuilder::new("BASE");
    assert!(keys.is_schema_key(&keys.build_default("anything")));
    assert!(!keys.is_schema_key("not-a-schema-key"));
}
