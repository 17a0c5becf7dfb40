//! Orchestrator (§4.H)
//!
//! Sequences login/favorite-selection (`login`), host-route + tunnel
//! setup (`route`, `https`, `pppd`), the relay loop (`relay`), and
//! teardown, in that order, with the session cache (`cache`) threaded
//! through for reuse across runs.

use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use nix::unistd::{getuid, seteuid};
use openssl::ssl::SslStream;
use tracing::{info, warn};

use f5vpn_login::config::Config;
use f5vpn_login::error::Error;
use f5vpn_login::https::{self, HttpsError, ProxyConfig};
use f5vpn_login::logging::{self, LogFormat};
use f5vpn_login::login::{self, Favorite, LoginError, TunnelParams};
use f5vpn_login::logwatch::IpUpEvent;
use f5vpn_login::platform::{self, Platform, RouteAction};
use f5vpn_login::pppd;
use f5vpn_login::relay::RelayLoop;
use f5vpn_login::{cache, route};

/// Command-line VPN tunnel client for BIG-IP APM (FirePass) gateways.
#[derive(Parser, Debug)]
#[command(name = "f5vpn-login", version, about)]
struct Args {
    /// [user@]host of the gateway. Falls back to the config file's
    /// `default_host` when omitted; a bare host prompts for username.
    userhost: Option<String>,

    /// Don't install or tear down DNS configuration.
    #[arg(long)]
    skip_dns: bool,

    /// Don't install the per-route entries from LAN0.
    #[arg(long)]
    skip_routes: bool,

    /// Additionally route 100.64.0.0/10 and 10.0.0.0/8 through the tunnel.
    #[arg(long)]
    custom_routes: bool,

    /// Reuse an existing MRHSession cookie instead of logging in.
    #[arg(long)]
    sessionid: Option<String>,

    /// host:port of an HTTP CONNECT proxy to route gateway traffic through.
    #[arg(long)]
    http_proxy: Option<String>,

    /// host:port of a SOCKS5 proxy to route gateway traffic through.
    #[arg(long)]
    socks5_proxy: Option<String>,

    /// No-op flag reflecting the (default) disabled certificate
    /// verification; kept for command-line compatibility.
    #[arg(long)]
    insecure: bool,

    /// Enable TLS certificate verification (default is disabled, see §9).
    #[arg(long)]
    verify_cert: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Structured log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Persist the resolved flags to the preferences file for future runs.
    #[arg(long)]
    save_config: bool,
}

fn main() {
    let result = run();
    if let Err(err) = &result {
        tracing::error!("{err}");
        std::process::exit(err.exit_code());
    }
}

fn run() -> Result<(), Error> {
    let args = Args::parse();
    logging::init(args.verbose, args.log_format);
    if args.insecure {
        tracing::debug!("--insecure passed; certificate verification is disabled by default anyway");
    }

    ensure_root_and_drop_privileges()?;

    let config = load_config();

    let identity = resolve_identity(&args, &config)?;
    let (username, host) = identity
        .split_once('@')
        .ok_or_else(|| Error::NoHost)
        .map(|(u, h)| (u.to_string(), h.to_string()))?;

    let proxy = build_proxy(&args, &config)?;
    let verify_cert = args.verify_cert || config.verify_cert;
    let skip_dns = args.skip_dns || config.skip_dns;
    let skip_routes = args.skip_routes || config.skip_routes;
    let custom_routes = args.custom_routes || config.custom_routes;

    if args.save_config {
        let to_save = Config {
            default_host: Some(identity.clone()),
            http_proxy: args.http_proxy.clone().or_else(|| config.http_proxy.clone()),
            socks5_proxy: args.socks5_proxy.clone().or_else(|| config.socks5_proxy.clone()),
            skip_dns,
            skip_routes,
            custom_routes,
            verify_cert,
        };
        let path = Config::default_path()?;
        to_save.save(&path)?;
        info!("saved preferences to {}", path.display());
    }

    let cached_session = if let Some(sid) = args.sessionid.clone() {
        Some(sid)
    } else {
        cache::load().filter(|c| c.userhost == identity).map(|c| c.session)
    };

    info!("acquiring session for {identity}");
    let (session, params) = negotiate(&host, &username, &proxy, verify_cert, cached_session)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    if let Err(e) = cache::save(&identity, &session, now) {
        warn!("failed to persist session cache: {e}");
    }

    let tunnel_host = require_param(&params, "tunnel_host0")?.to_string();
    let tunnel_port: u16 = require_param(&params, "tunnel_port0")?
        .parse()
        .map_err(|_| Error::Login(LoginError::NoTunnelParams))?;
    let session_id = require_param(&params, "Session_ID")?.to_string();
    require_param(&params, "LAN0")?;
    require_param(&params, "DNS0")?;
    require_param(&params, "DNSSuffix0")?;

    let mut platform = platform::detect()?;

    let (default_gateway, default_iface) = route::current_default_gateway()?;
    let tunnel_ip = https::resolve_ipv4(&tunnel_host)?;

    info!("installing host route to {tunnel_ip} via {default_gateway} ({default_iface})");
    platform.setup_route(
        Some(default_iface.as_str()),
        &default_gateway.to_string(),
        &tunnel_ip.to_string(),
        32,
        RouteAction::Add,
    )?;

    let result = connect_and_relay(
        &tunnel_host,
        tunnel_port,
        &session_id,
        &session,
        &proxy,
        verify_cert,
        platform.as_mut(),
        &params,
        skip_dns,
        skip_routes,
        custom_routes,
    );

    info!("removing host route to {tunnel_ip}");
    let _ = platform.setup_route(
        Some(default_iface.as_str()),
        &default_gateway.to_string(),
        &tunnel_ip.to_string(),
        32,
        RouteAction::Delete,
    );

    result
}

fn ensure_root_and_drop_privileges() -> Result<(), Error> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::NotRoot);
    }
    seteuid(getuid())?;
    Ok(())
}

fn load_config() -> Config {
    Config::default_path()
        .ok()
        .and_then(|path| Config::load_or_default(&path).ok())
        .unwrap_or_default()
}

fn resolve_identity(args: &Args, config: &Config) -> Result<String, Error> {
    let spec = args
        .userhost
        .clone()
        .or_else(|| config.default_host.clone())
        .ok_or(Error::NoHost)?;

    if spec.contains('@') {
        Ok(spec)
    } else {
        let username = prompt("Username")?;
        Ok(format!("{username}@{spec}"))
    }
}

fn prompt(label: &str) -> Result<String, Error> {
    use std::io::Write;
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_host_port(spec: &str) -> Result<(String, u16), Error> {
    let (host, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidProxySpec(spec.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| Error::InvalidProxySpec(spec.to_string()))?;
    Ok((host.to_string(), port))
}

fn build_proxy(args: &Args, config: &Config) -> Result<ProxyConfig, Error> {
    if let Some(spec) = args.http_proxy.clone().or_else(|| config.http_proxy.clone()) {
        let (host, port) = parse_host_port(&spec)?;
        Ok(ProxyConfig::HttpConnect { host, port })
    } else if let Some(spec) = args.socks5_proxy.clone().or_else(|| config.socks5_proxy.clone()) {
        let (host, port) = parse_host_port(&spec)?;
        Ok(ProxyConfig::Socks5 { host, port })
    } else {
        Ok(ProxyConfig::Direct)
    }
}

fn require_param<'a>(params: &'a TunnelParams, key: &str) -> Result<&'a str, Error> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or(Error::Login(LoginError::NoTunnelParams))
}

/// §4.H steps 3-5: reuse a cached session if it still lists favorites,
/// else prompt for credentials and log in, retrying through
/// `ChallengeRequired` and stale-session param fetches (§7).
fn negotiate(
    host: &str,
    username: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
    mut cached_session: Option<String>,
) -> Result<(String, TunnelParams), Error> {
    loop {
        let (session, favorites) = acquire_session(host, username, proxy, verify_cert, cached_session.take())?;
        let favorite = select_favorite(&favorites)?;
        match login::fetch_tunnel_params(host, &session, &favorite.id, proxy, verify_cert)? {
            Some(params) => return Ok((session, params)),
            None => {
                warn!("session went stale while fetching tunnel parameters, re-authenticating");
                continue;
            }
        }
    }
}

fn acquire_session(
    host: &str,
    username: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
    cached_session: Option<String>,
) -> Result<(String, Vec<Favorite>), Error> {
    if let Some(session) = cached_session {
        match login::fetch_favorites(host, &session, proxy, verify_cert) {
            Ok(Some(favorites)) => {
                info!("reusing cached session");
                return Ok((session, favorites));
            }
            Ok(None) => info!("cached session is stale, re-authenticating"),
            Err(e) => warn!("cached session check failed ({e}), re-authenticating"),
        }
    }

    loop {
        let password = rpassword::prompt_password(format!("RADIUS password for {username}@{host}: "))?;
        let dpassword = rpassword::prompt_password("LAN password: ")?;

        let client_data = login::preflight(host, proxy, verify_cert)?;
        match login::do_login(host, username, &password, &dpassword, &client_data, proxy, verify_cert) {
            Ok(session) => match login::fetch_favorites(host, &session, proxy, verify_cert)? {
                Some(favorites) => return Ok((session, favorites)),
                None => return Err(Error::NoNetworkAccess),
            },
            Err(LoginError::ChallengeRequired(challenge)) => {
                eprintln!("gateway requested a challenge: {challenge}");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn select_favorite(favorites: &[Favorite]) -> Result<&Favorite, Error> {
    match favorites.len() {
        0 => Err(Error::NoFavoriteSelected),
        1 => Ok(&favorites[0]),
        _ => {
            let index = login::prompt_favorite_selection(favorites)?;
            Ok(&favorites[index])
        }
    }
}

/// Opens the `GET /myvpn?sess=...` tunnel stream, retrying up to 5
/// times on the TLS "EOF occurred in violation of protocol" error
/// (§4.H step 8 / §7).
fn connect_tunnel_with_retry(
    host: &str,
    port: u16,
    request: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<SslStream<TcpStream>, HttpsError> {
    let mut attempt = 0;
    loop {
        match https::connect_tunnel_stream(host, port, request, proxy, verify_cert) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                let transient_eof = e.to_string().to_lowercase().contains("eof");
                if transient_eof && attempt <= 5 {
                    warn!("tls eof on tunnel connect, retrying ({attempt}/5)");
                    continue;
                }
                return Err(e);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn connect_and_relay(
    tunnel_host: &str,
    tunnel_port: u16,
    session_id: &str,
    mrh_session: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
    platform: &mut dyn Platform,
    params: &TunnelParams,
    skip_dns: bool,
    skip_routes: bool,
    custom_routes: bool,
) -> Result<(), Error> {
    let request = format!(
        "GET /myvpn?sess={session_id} HTTP/1.0\r\nHost: {tunnel_host}\r\nCookie: MRHSession={mrh_session}\r\n\r\n"
    );

    let tls = connect_tunnel_with_retry(tunnel_host, tunnel_port, &request, proxy, verify_cert)?;
    let tls_fd = tls.get_ref().as_raw_fd();

    let service_id = format!("f5vpn-{tunnel_host}");
    let handle = pppd::spawn_pppd(tls_fd, true, &service_id)?;
    info!("pppd spawned (pid {})", handle.pid);

    let mut relay = RelayLoop::new(tls, handle.pty_master, handle.log_pipe_read)?;

    let relay_result = relay.run(|event: &IpUpEvent| {
        info!(
            "interface up: {} (tty {}, local {}, remote {})",
            event.iface, event.tty, event.local_ip, event.remote_ip
        );
        platform.wait_for_interface(&event.iface);

        if !skip_routes {
            install_lan_routes(platform, event, params, custom_routes).map_err(|e| e.to_string())?;
        }
        if !skip_dns {
            install_dns(platform, event, params, &service_id).map_err(|e| e.to_string())?;
        }
        Ok(())
    });

    platform.teardown_dns();
    if let Err(e) = pppd::shutdown_pppd(handle.pid) {
        warn!("failed to reap pppd: {e}");
    }

    relay_result.map_err(Error::from)
}

/// §4.H step 9: applies every `LAN0` route spec (plus, under
/// `--custom-routes`, two fixed extra specs) through the newly-up ppp
/// interface. Parses every spec before installing any, so a malformed
/// route aborts with no partial state (§8 scenario 6).
fn install_lan_routes(
    platform: &mut dyn Platform,
    event: &IpUpEvent,
    params: &TunnelParams,
    custom_routes: bool,
) -> Result<(), Error> {
    let lan0 = params.get("LAN0").map(String::as_str).unwrap_or_default();
    let mut specs: Vec<route::RouteSpec> = lan0
        .split_whitespace()
        .map(route::parse_net_bits)
        .collect::<Result<_, _>>()?;

    if custom_routes {
        specs.push(route::parse_net_bits("100.64.0.0/10")?);
        specs.push(route::parse_net_bits("10.0.0.0/8")?);
    }

    for spec in &specs {
        platform.setup_route(
            Some(event.iface.as_str()),
            &event.remote_ip,
            &spec.net_string(),
            spec.bits,
            RouteAction::Add,
        )?;
    }
    Ok(())
}

fn install_dns(
    platform: &mut dyn Platform,
    event: &IpUpEvent,
    params: &TunnelParams,
    service_id: &str,
) -> Result<(), Error> {
    let servers: Vec<String> = params
        .get("DNS0")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let domains: Vec<String> = params
        .get("DNSSuffix0")
        .map(|s| {
            s.split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let lan0 = params.get("LAN0").map(String::as_str).unwrap_or_default();
    let mut revdns = Vec::new();
    for part in lan0.split_whitespace() {
        let spec = route::parse_net_bits(part)?;
        revdns.extend(route::routespec_to_revdns(&spec));
    }

    platform.setup_dns(&event.iface, service_id, &servers, &domains, &revdns, true)?;
    Ok(())
}
