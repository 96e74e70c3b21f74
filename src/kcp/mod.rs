//! The KCP ARQ engine and its async session adapter.
//!
//! [`engine`] is the pure state machine (no I/O of its own); [`session`]
//! drives it from a tokio task and exposes an async read/write surface to
//! the smux layer.

pub mod engine;
pub mod error;
pub mod session;

pub use engine::{get_conv, set_conv, Kcp, KCP_OVERHEAD};
pub use error::{Error, KcpResult};
