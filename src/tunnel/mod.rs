//! Tunnel composition: the client's pool of KCP/smux tunnels and the
//! server's endpoint-keyed demultiplexer, grounded on `kcptun_client` /
//! `Local` (`kcptun_client.cpp`, `local.cpp`) and `kcptun_server` / `Server`
//! (`kcptun_server.cpp`, `server.cpp`) in `examples/original_source/`.

pub mod client;
pub mod server;
