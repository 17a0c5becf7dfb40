//! HTTPS mini-client (§4.A)
//!
//! One-shot TLS request/response over an optional HTTP-CONNECT or
//! SOCKS5 proxy. Certificate verification is disabled by default (see
//! §9) and can be turned on with `--verify-cert`.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream, ToSocketAddrs};

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpsError {
    #[error("dns resolution failed for {0}")]
    Dns(String),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub enum ProxyConfig {
    Direct,
    HttpConnect { host: String, port: u16 },
    Socks5 { host: String, port: u16 },
}

/// `name[:port]`, default port 443. Resolves to an IPv4 address.
pub fn parse_hostport(host: &str, default_port: u16) -> Result<(Ipv4Addr, u16), HttpsError> {
    let (name, port) = match host.rsplit_once(':') {
        Some((n, p)) => (n, p.parse().map_err(|_| HttpsError::Dns(host.to_string()))?),
        None => (host, default_port),
    };
    resolve_ipv4(name).map(|ip| (ip, port))
}

pub(crate) fn resolve_ipv4(name: &str) -> Result<Ipv4Addr, HttpsError> {
    (name, 0u16)
        .to_socket_addrs()
        .map_err(|_| HttpsError::Dns(name.to_string()))?
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| HttpsError::Dns(name.to_string()))
}

fn read_line(stream: &mut TcpStream) -> Result<String, HttpsError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn connect_via_http_proxy(
    proxy_host: &str,
    proxy_port: u16,
    ip: Ipv4Addr,
    port: u16,
) -> Result<TcpStream, HttpsError> {
    let mut stream = TcpStream::connect((proxy_host, proxy_port))?;
    let request = format!("CONNECT {ip}:{port} HTTP/1.0\r\n\r\n");
    stream.write_all(request.as_bytes())?;

    let status_line = read_line(&mut stream)?;
    let status_code = status_line.split_whitespace().nth(1);
    if status_code != Some("200") {
        return Err(HttpsError::Proxy(format!(
            "proxy returned bad status for CONNECT: {status_line:?}"
        )));
    }
    loop {
        let line = read_line(&mut stream)?;
        if line.is_empty() {
            break;
        }
    }
    Ok(stream)
}

fn connect_via_socks5(
    proxy_host: &str,
    proxy_port: u16,
    ip: Ipv4Addr,
    port: u16,
) -> Result<TcpStream, HttpsError> {
    let mut stream = TcpStream::connect((proxy_host, proxy_port))?;

    // Greeting: version 5, one method, no-auth.
    stream.write_all(&[0x05, 0x01, 0x00])?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply)?;
    if reply[0] != 0x05 || reply[1] != 0x00 {
        return Err(HttpsError::Proxy("socks5 server rejected no-auth method".into()));
    }

    // CONNECT request, IPv4 address type.
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    if header[1] != 0x00 {
        return Err(HttpsError::Proxy(format!("socks5 CONNECT failed, reply code {}", header[1])));
    }
    // Skip the bound address that follows (variable length by address type).
    match header[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest)?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest)?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest)?;
        }
        _ => return Err(HttpsError::Proxy("unknown socks5 address type".into())),
    }

    Ok(stream)
}

fn proxy_connect(
    proxy: &ProxyConfig,
    ip: Ipv4Addr,
    port: u16,
) -> Result<TcpStream, HttpsError> {
    match proxy {
        ProxyConfig::Direct => Ok(TcpStream::connect((ip, port))?),
        ProxyConfig::HttpConnect { host, port: proxy_port } => {
            connect_via_http_proxy(host, *proxy_port, ip, port)
        }
        ProxyConfig::Socks5 { host, port: proxy_port } => {
            connect_via_socks5(host, *proxy_port, ip, port)
        }
    }
}

/// Sends `request` (a literal HTTP request, CRLF-terminated headers) to
/// `host` over TLS, optionally through `proxy`, and returns the full
/// response (headers + body) decoded as UTF-8.
pub fn send_request(
    host: &str,
    request: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<String, HttpsError> {
    let (hostname, port_str) = host.split_once(':').unwrap_or((host, "443"));
    let port: u16 = port_str.parse().unwrap_or(443);
    let ip = resolve_ipv4(hostname)?;

    let tcp = proxy_connect(proxy, ip, port)?;
    tcp.set_nodelay(true).ok();

    let mut connector = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| HttpsError::Tls(e.to_string()))?;
    if !verify_cert {
        connector.set_verify(SslVerifyMode::NONE);
    }
    let connector = connector.build();

    let mut tls = if verify_cert {
        connector
            .connect(hostname, tcp)
            .map_err(|e| HttpsError::Tls(e.to_string()))?
    } else {
        connector
            .configure()
            .map_err(|e| HttpsError::Tls(e.to_string()))?
            .verify_hostname(false)
            .connect(hostname, tcp)
            .map_err(|e| HttpsError::Tls(e.to_string()))?
    };

    tls.write_all(request.as_bytes())?;

    let mut data = Vec::new();
    tls.read_to_end(&mut data)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Reads the first byte of the tunnel data stream as a sync marker
/// (§4.H step 8), returning the still-open TLS stream for the relay
/// loop to take ownership of.
pub fn connect_tunnel_stream(
    host: &str,
    port: u16,
    request: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<openssl::ssl::SslStream<TcpStream>, HttpsError> {
    let ip = resolve_ipv4(host)?;
    let tcp = proxy_connect(proxy, ip, port)?;
    tcp.set_nodelay(true).ok();
    tcp.set_read_timeout(Some(std::time::Duration::from_secs(10))).ok();

    let mut connector = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| HttpsError::Tls(e.to_string()))?;
    if !verify_cert {
        connector.set_verify(SslVerifyMode::NONE);
    }
    let connector = connector.build();

    let mut tls = if verify_cert {
        connector.connect(host, tcp).map_err(|e| HttpsError::Tls(e.to_string()))?
    } else {
        connector
            .configure()
            .map_err(|e| HttpsError::Tls(e.to_string()))?
            .verify_hostname(false)
            .connect(host, tcp)
            .map_err(|e| HttpsError::Tls(e.to_string()))?
    };

    tls.write_all(request.as_bytes())?;

    let mut sync_marker = [0u8; 1];
    tls.ssl_read(&mut sync_marker).map_err(|e| HttpsError::Tls(e.to_string()))?;

    Ok(tls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hostport_with_explicit_port() {
        let (_ip, port) = parse_hostport("localhost:8443", 443).unwrap();
        assert_eq!(port, 8443);
    }

    #[test]
    fn parses_hostport_with_default_port() {
        let (_ip, port) = parse_hostport("localhost", 443).unwrap();
        assert_eq!(port, 443);
    }
}
