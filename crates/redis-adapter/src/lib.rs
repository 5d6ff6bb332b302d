//! Client-side Redis adapter: a typed stream API, pub/sub dispatch, and
//! cluster-aware stream tailing, all layered over a reconnect-capable
//! single-node-or-cluster driver.
//!
//! See [`RedisAdapter`] for the entry point.

pub mod adapter;
pub mod cache;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod keys;
pub mod pubsub;
pub mod reader;
pub mod time;
pub mod workers;

pub use adapter::{RedisAdapter, NOT_CONNECTED};
pub use codec::{AttrsCodec, ScalarCodec, StreamCodec, StringCodec, VecCodec};
pub use config::Options;
pub use error::AdapterError;
pub use keys::KeyBuilder;
pub use time::Time;
