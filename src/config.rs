//! CLI surface and SIP003 plugin-mode configuration, grounded on the
//! `gflags`-based `FLAGS_*` table and `parse_config_from_env` /
//! `parse_plugin_options` in `examples/original_source/config.h` /
//! `config.cpp`. `clap` is this crate's equivalent of gflags (an
//! enrichment drawn from the example pack rather than the teacher crate,
//! see DESIGN.md); the SIP003 override logic is re-expressed directly from
//! the original's `env_assigners` map.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::{TunnelError, TunnelResult};
use crate::kcp::session::KcpConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "TCP-over-UDP tunnel built on KCP and smux")]
pub struct Cli {
    /// Local address the client listens on, or the server's smux/KCP endpoint.
    #[arg(short = 'l', long, default_value = "127.0.0.1:12948")]
    pub localaddr: String,

    /// Client: the peer's UDP endpoint. Server: unused (kept for symmetry
    /// with the client flag set and for SIP003 overrides).
    #[arg(short = 'r', long, default_value = "127.0.0.1:12949")]
    pub remoteaddr: String,

    /// Server: local TCP address to dial for each accepted stream. Client:
    /// unused.
    #[arg(short = 't', long)]
    pub targetaddr: Option<String>,

    /// Number of parallel KCP/smux tunnels the client pool maintains.
    #[arg(long, default_value_t = 1)]
    pub conn: usize,

    /// Auto expiration time (seconds) for a single tunnel; 0 disables
    /// scavenging entirely regardless of `scavengettl`.
    #[arg(long, default_value_t = 0)]
    pub autoexpire: i64,

    /// How long a tunnel lives (seconds) once `autoexpire` schedules its
    /// retirement; -1 disables scavenging.
    #[arg(long, default_value_t = 600)]
    pub scavengettl: i64,

    /// Keepalive interval in seconds; a session that sees no ingress for
    /// three intervals is declared dead.
    #[arg(long, default_value_t = 10)]
    pub keepalive: u64,

    #[arg(long, default_value_t = 1350)]
    pub mtu: usize,

    #[arg(long, default_value_t = 128)]
    pub sndwnd: u16,

    #[arg(long, default_value_t = 512)]
    pub rcvwnd: u16,

    /// 0 or 1; matches the original's int32 `FLAGS_nodelay` rather than a
    /// plain bool so the plugin-option surface can express "disabled".
    #[arg(long, default_value_t = 1)]
    pub nodelay: u8,

    #[arg(long, default_value_t = 10)]
    pub interval: u32,

    #[arg(long, default_value_t = 2)]
    pub resend: i32,

    /// 0 or 1; disables congestion control when 0. See `nodelay` for why
    /// this isn't a bool.
    #[arg(long, default_value_t = 1)]
    pub nc: u8,

    /// Best-effort DSCP/TOS value applied to the UDP socket(s).
    #[arg(long)]
    pub dscp: Option<u32>,

    /// Send/receive socket buffer size (bytes) requested on UDP sockets.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub sockbuf: usize,

    /// Redirect logging to a file instead of stdout.
    #[arg(long)]
    pub logfile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub localaddr: SocketAddr,
    pub remoteaddr: SocketAddr,
    pub targetaddr: SocketAddr,
    pub conns: usize,
    /// `None` when scavenging is disabled (`autoexpire == 0` or
    /// `scavengettl < 0`); `Some(ttl)` schedules a one-shot per-tunnel
    /// destruction `ttl` after the tunnel is dialed, per spec.md §4.6.
    pub scavenge_ttl: Option<Duration>,
    pub keepalive: Duration,
    pub kcp: KcpConfig,
    pub dscp: Option<u32>,
    pub sockbuf: usize,
}

impl TunnelConfig {
    pub fn from_cli(cli: Cli) -> TunnelResult<TunnelConfig> {
        let localaddr = cli
            .localaddr
            .parse()
            .map_err(|e| TunnelError::Config(format!("invalid localaddr {:?}: {e}", cli.localaddr)))?;
        let remoteaddr = cli
            .remoteaddr
            .parse()
            .map_err(|e| TunnelError::Config(format!("invalid remoteaddr {:?}: {e}", cli.remoteaddr)))?;
        let targetaddr = match &cli.targetaddr {
            Some(addr) => addr
                .parse()
                .map_err(|e| TunnelError::Config(format!("invalid targetaddr {:?}: {e}", addr)))?,
            None => remoteaddr,
        };

        let scavenge_ttl = if cli.autoexpire > 0 && cli.scavengettl >= 0 {
            Some(Duration::from_secs(cli.scavengettl as u64))
        } else {
            None
        };

        Ok(TunnelConfig {
            localaddr,
            remoteaddr,
            targetaddr,
            conns: cli.conn.max(1),
            scavenge_ttl,
            keepalive: Duration::from_secs(cli.keepalive.max(1)),
            kcp: KcpConfig {
                nodelay: cli.nodelay != 0,
                interval: cli.interval,
                resend: cli.resend,
                nc: cli.nc != 0,
                snd_wnd: cli.sndwnd,
                rcv_wnd: cli.rcvwnd,
                mtu: cli.mtu,
            },
            dscp: cli.dscp,
            sockbuf: cli.sockbuf,
        })
    }
}

/// Initializes logging, directed at `logfile` when given and stdout
/// otherwise. Mirrors `config.cpp`'s `google::SetLogDestination` call under
/// `FLAGS_logfile`; `env_logger` is this crate's equivalent of glog.
pub fn init_logging(logfile: Option<&str>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = logfile {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => {
                eprintln!("failed to open logfile {path:?}: {err}, logging to stdout instead");
            }
        }
    }
    builder.init();
}

/// Overrides CLI defaults with SIP003 plugin-mode environment variables, the
/// convention shadowsocks plugins use to receive their endpoints. Mirrors
/// `parse_config_from_env`: `SS_REMOTE_HOST`/`SS_REMOTE_PORT` become this
/// process's `remoteaddr`, `SS_LOCAL_HOST`/`SS_LOCAL_PORT` become
/// `localaddr`, and `SS_PLUGIN_OPTIONS` is a `;`-separated `key=value` list
/// applied on top of both.
pub fn apply_sip003_env(cli: &mut Cli) -> TunnelResult<()> {
    if let (Ok(host), Ok(port)) = (env::var("SS_REMOTE_HOST"), env::var("SS_REMOTE_PORT")) {
        cli.remoteaddr = format!("{host}:{port}");
    }
    if let (Ok(host), Ok(port)) = (env::var("SS_LOCAL_HOST"), env::var("SS_LOCAL_PORT")) {
        cli.localaddr = format!("{host}:{port}");
    }

    if let Ok(opts) = env::var("SS_PLUGIN_OPTIONS") {
        let parsed = parse_plugin_options(&opts);
        apply_plugin_options(cli, &parsed)?;
    }

    Ok(())
}

fn parse_plugin_options(opts: &str) -> HashMap<String, String> {
    opts.split(';')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn apply_plugin_options(cli: &mut Cli, opts: &HashMap<String, String>) -> TunnelResult<()> {
    macro_rules! apply_parsed {
        ($key:literal, $field:expr, $ty:ty) => {
            if let Some(v) = opts.get($key) {
                $field = v
                    .parse::<$ty>()
                    .map_err(|e| TunnelError::Config(format!("plugin option {} invalid: {e}", $key)))?;
            }
        };
    }

    if let Some(v) = opts.get("remoteaddr") {
        cli.remoteaddr = v.clone();
    }
    if let Some(v) = opts.get("localaddr") {
        cli.localaddr = v.clone();
    }
    if let Some(v) = opts.get("targetaddr") {
        cli.targetaddr = Some(v.clone());
    }
    apply_parsed!("conn", cli.conn, usize);
    apply_parsed!("autoexpire", cli.autoexpire, i64);
    apply_parsed!("scavengettl", cli.scavengettl, i64);
    apply_parsed!("keepalive", cli.keepalive, u64);
    apply_parsed!("mtu", cli.mtu, usize);
    apply_parsed!("sndwnd", cli.sndwnd, u16);
    apply_parsed!("rcvwnd", cli.rcvwnd, u16);
    apply_parsed!("nodelay", cli.nodelay, u8);
    apply_parsed!("interval", cli.interval, u32);
    apply_parsed!("resend", cli.resend, i32);
    apply_parsed!("nc", cli.nc, u8);
    apply_parsed!("dscp", cli.dscp, u32);
    apply_parsed!("sockbuf", cli.sockbuf, usize);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_options_parse_semicolon_separated_pairs() {
        let opts = parse_plugin_options("conn=8;mtu=1200;keepalive=5");
        assert_eq!(opts.get("conn").map(String::as_str), Some("8"));
        assert_eq!(opts.get("mtu").map(String::as_str), Some("1200"));
        assert_eq!(opts.get("keepalive").map(String::as_str), Some("5"));
    }

    #[test]
    fn apply_plugin_options_overrides_numeric_fields() {
        let mut cli = Cli::parse_from(["kcptun-client"]);
        let mut opts = HashMap::new();
        opts.insert("conn".to_string(), "16".to_string());
        apply_plugin_options(&mut cli, &opts).unwrap();
        assert_eq!(cli.conn, 16);
    }

    #[test]
    fn autoexpire_zero_disables_scavenging() {
        let mut cli = Cli::parse_from(["kcptun-client"]);
        cli.autoexpire = 0;
        let config = TunnelConfig::from_cli(cli).unwrap();
        assert!(config.scavenge_ttl.is_none());
    }

    #[test]
    fn autoexpire_set_with_negative_scavengettl_disables_scavenging() {
        let mut cli = Cli::parse_from(["kcptun-client"]);
        cli.autoexpire = 30;
        cli.scavengettl = -1;
        let config = TunnelConfig::from_cli(cli).unwrap();
        assert!(config.scavenge_ttl.is_none());
    }

    #[test]
    fn autoexpire_and_scavengettl_enable_scheduled_retirement() {
        let mut cli = Cli::parse_from(["kcptun-client"]);
        cli.autoexpire = 2;
        cli.scavengettl = 2;
        let config = TunnelConfig::from_cli(cli).unwrap();
        assert_eq!(config.scavenge_ttl, Some(Duration::from_secs(2)));
    }

    #[test]
    fn targetaddr_defaults_to_remoteaddr_when_unset() {
        let cli = Cli::parse_from(["kcptun-server"]);
        let config = TunnelConfig::from_cli(cli).unwrap();
        assert_eq!(config.targetaddr, config.remoteaddr);
    }

    #[test]
    fn targetaddr_overrides_remoteaddr_when_set() {
        let mut cli = Cli::parse_from(["kcptun-server"]);
        cli.targetaddr = Some("127.0.0.1:9999".to_string());
        let config = TunnelConfig::from_cli(cli).unwrap();
        assert_eq!(config.targetaddr, "127.0.0.1:9999".parse().unwrap());
    }

    #[test]
    fn from_cli_rejects_unparsable_address() {
        let mut cli = Cli::parse_from(["kcptun-client"]);
        cli.localaddr = "not-an-address".to_string();
        assert!(TunnelConfig::from_cli(cli).is_err());
    }
}
