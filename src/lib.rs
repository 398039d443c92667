//! radioscope: always-on-top spectrum overlay for a live internet radio stream.
//!
//! Three pieces share one single-threaded event loop:
//! - `analyzer` + `scheduler` turn decoded stream audio into 64 bars per frame
//! - `monitor` keeps exactly one audio pipeline alive and rebuilds it on stalls
//! - `host_bridge` mirrors window intent to the host and tracks now-playing info

pub mod analyzer;
pub mod audio_source;
pub mod config;
pub mod host;
pub mod host_bridge;
pub mod http_source;
pub mod logging;
pub mod metadata;
pub mod monitor;
pub mod scheduler;
pub mod shared_state;

#[cfg(test)]
pub(crate) mod testing;
