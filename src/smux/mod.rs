//! The smux stream-multiplexing layer carried over a single KCP session.
//!
//! Grounded on `smux` / `smux_sess` in `examples/original_source/smux.h` /
//! `smux.cpp`: one reader loop owns ingress and dispatches frames to
//! per-stream buffers; one writer task owns egress and serializes every
//! frame (data and control) onto the underlying KCP session in order.

pub mod session;
pub mod stream;

pub use session::SmuxSession;
pub use stream::SmuxStream;

/// High-water mark (bytes buffered for one stream) at which the session's
/// single reader loop stops dispatching further frames until the stream
/// drains. Mirrors the 128 KiB figure used throughout spec.md §4.4/§4.5.
pub const HIGH_WATER: usize = 128 * 1024;

/// Low-water mark the reader loop waits for before resuming.
pub const LOW_WATER: usize = 16 * 1024;
