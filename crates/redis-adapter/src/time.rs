//! `Time`: the millisecond-ID + nanosecond-remainder + sequence identifier
//! used for every stream entry this crate writes or reads.

use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_MILLI: u64 = 1_000_000;
const REMAINDER_SCALE: u64 = 10_000_000_000;

fn nanoseconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

/// A Redis stream ID, decomposed into nanosecond-resolution wall time and a
/// per-millisecond sequence number.
///
/// The zero value `(0, 0)` is the invalid/absent sentinel — see [`Time::ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Time {
    pub nanos: u64,
    pub seqnum: u64,
}

impl Time {
    pub const INVALID: Time = Time { nanos: 0, seqnum: 0 };

    pub fn new(nanos: u64, seqnum: u64) -> Self {
        Time { nanos, seqnum }
    }

    pub fn now() -> Self {
        Time::new(nanoseconds_since_epoch(), 0)
    }

    /// Parse a Redis stream ID of the form `<ms>-<mixed>`. A malformed ID
    /// silently becomes the invalid value; it never panics.
    pub fn parse(id: &str) -> Self {
        (|| -> Option<Time> {
            let (ms_part, mixed_part) = id.split_once('-')?;
            let ms: u64 = ms_part.parse().ok()?;
            let mixed: u64 = mixed_part.parse().ok()?;
            Some(Time::new(
                ms * NANOS_PER_MILLI + mixed / REMAINDER_SCALE,
                mixed % REMAINDER_SCALE,
            ))
        })()
        .unwrap_or(Time::INVALID)
    }

    /// `true` iff this is not the invalid sentinel.
    pub fn ok(&self) -> bool {
        self.nanos != 0 || self.seqnum != 0
    }

    /// Render as a Redis stream ID string `<ms>-<mixed>`.
    pub fn id(&self) -> String {
        let mixed = (self.nanos % NANOS_PER_MILLI) * REMAINDER_SCALE + self.seqnum;
        format!("{}-{}", self.nanos / NANOS_PER_MILLI, mixed)
    }

    /// This ID, or the current wall-clock time if this one is invalid.
    pub fn id_or_now(&self) -> String {
        if self.ok() { self.id() } else { Time::now().id() }
    }

    /// This ID, or Redis's `-` (minimum possible ID) if invalid.
    pub fn id_or_min(&self) -> String {
        if self.ok() { self.id() } else { "-".to_string() }
    }

    /// This ID, or Redis's `+` (maximum possible ID) if invalid.
    pub fn id_or_max(&self) -> String {
        if self.ok() { self.id() } else { "+".to_string() }
    }
}

impl From<&str> for Time {
    fn from(id: &str) -> Self {
        Time::parse(id)
    }
}

impl From<String> for Time {
    fn from(id: String) -> Self {
        Time::parse(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_by_default() {
        assert!(!Time::default().ok());
        assert_eq!(Time::default().id_or_min(), "-");
        assert_eq!(Time::default().id_or_max(), "+");
    }

    #[test]
    fn round_trips_through_id_string() {
        let t = Time::new(1_700_000_123_456_789, 42);
        let parsed = Time::parse(&t.id());
        assert_eq!(t, parsed);
    }

    #[test]
    fn malformed_id_is_invalid_not_a_panic() {
        assert_eq!(Time::parse(""), Time::INVALID);
        assert_eq!(Time::parse("not-an-id"), Time::INVALID);
        assert_eq!(Time::parse("no-dash-here-either-"), Time::INVALID);
    }

    #[test]
    fn id_or_now_substitutes_current_time_when_invalid() {
        let emitted = Time::INVALID.id_or_now();
        let reparsed = Time::parse(&emitted);
        assert!(reparsed.ok());
    }

    proptest::proptest! {
        #[test]
        fn id_round_trip_holds_for_arbitrary_values(
            nanos in 0u64..(1u64 << 62),
            seqnum in 0u64..10_000_000_000u64,
        ) {
            let t = Time::new(nanos, seqnum);
            proptest::prop_assert_eq!(Time::parse(&t.id()), t);
        }
    }
}
