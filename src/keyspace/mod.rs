//! Keyspace primitives: keys, half-open ranges, and the coverage maps the
//! queue is built on.

mod actor_map;
mod range;
mod range_map;

pub use actor_map::ActorMap;
pub use range::{max_key, Key, KeyRange};
pub use range_map::RangeMap;
