//! f5vpn-login - command-line VPN tunnel client for BIG-IP APM
//! ("FirePass") gateways, without the vendor client.
//!
//! # Architecture
//!
//! - `https`: one-shot TLS request/response mini-client, optionally
//!   through an HTTP-CONNECT or SOCKS5 proxy (§4.A).
//! - `login`: the login/favorite/tunnel-param protocol driven against
//!   the gateway's `my.logon.php3`/`vdesk` endpoints (§4.B).
//! - `route`: CIDR/netmask/implicit-class route parsing and
//!   reverse-DNS zone generation (§4.C).
//! - `platform`: per-OS route and DNS install/teardown (§4.D).
//! - `pppd`: forks and supervises the PPPD child (§4.E).
//! - `logwatch`: parses the PPPD log stream for the interface-up event
//!   (§4.F).
//! - `relay`: the non-blocking TLS-to-PTY byte pump (§4.G).
//! - `cache`: the `~/.f5vpn-login.conf` session cache (§3).
//! - `config`: the optional TOML preferences file.
//! - `privilege`: scoped effective-uid elevation (§9).
//! - `logging`: `tracing` subscriber setup.
//! - `error`: crate-wide error aggregation and exit-code mapping.

pub mod cache;
pub mod config;
pub mod error;
pub mod https;
pub mod logging;
pub mod login;
pub mod logwatch;
pub mod platform;
pub mod pppd;
pub mod privilege;
pub mod relay;
pub mod route;

pub use error::Error;
