//! A TCP-over-UDP tunnel built on a KCP reliable-ARQ engine with a
//! smux-style stream multiplexer layered on top, so many TCP connections
//! share a small pool of KCP conversations instead of one each.

pub mod bridge;
pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod kcp;
pub mod smux;
pub mod tunnel;

pub use error::{TunnelError, TunnelResult};
