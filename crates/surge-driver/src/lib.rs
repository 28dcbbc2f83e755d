//! Pipelined streaming core of the surge load driver.
//!
//! The driver saturates a time-series database with a reproducible, sharded,
//! bounded-in-flight request stream: one producer task per stream, one
//! response demultiplexer per connection, many streams multiplexed over a
//! fixed pool of TCP sockets.
pub mod config;
pub mod counters;
pub mod demux;
pub mod driver;
pub mod frame_io;
pub mod plan;
pub mod pool;
pub mod producer;
pub mod samples;
pub mod shard;

pub use config::{ConfigError, DriverConfig};
pub use driver::{Driver, Mode, RunReport};
