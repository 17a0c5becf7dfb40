//! Login & favorite protocol (§4.B)
//!
//! Four fixed HTTP/1.0 request templates against the gateway's
//! `my.logon.php3`/`vdesk` endpoints, plus the response scrapers that
//! drive them. Headers are reproduced verbatim — some gateways key
//! behavior off the legacy User-Agent string.

use std::collections::HashMap;
use std::io::{self, Write};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::https::{send_request, HttpsError, ProxyConfig};

#[derive(Error, Debug)]
pub enum LoginError {
    #[error(transparent)]
    Https(#[from] HttpsError),

    #[error("invalid credentials")]
    Auth,

    #[error("gateway requested a challenge: {0}")]
    ChallengeRequired(String),

    #[error("unrecognized login response")]
    UnknownLoginResponse,

    #[error("tunnel parameters unavailable")]
    NoTunnelParams,
}

pub type TunnelParams = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct Favorite {
    pub id: String,
    pub name: String,
}

const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; U; PPC Mac OS X; en) AppleWebKit/312.5 (KHTML, like Gecko) Safari/312.1";

fn common_headers(host: &str) -> String {
    format!(
        "Accept: text/xml,application/xml,application/xhtml+xml,text/html;q=0.9,text/plain;q=0.8,image/png,*/*;q=0.5\r\n\
Accept-Language: en-us,en;q=0.5\r\n\
Cookie: uRoamTestCookie=TEST; VHOST=standard\r\n\
Referer: https://{host}/my.logon.php3\r\n\
User-Agent: {USER_AGENT}\r\n"
    )
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

static CLIENT_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"document\.external_data_post_cls\.client_data\.value = "([\w=]+)"|name="client_data" value="([\w=]+)""#).unwrap()
});

static SET_COOKIE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Set-Cookie:\s*MRHSession=([^;]*);").unwrap());

static AUTH_FAIL_NEEDLE: &str = "Either Username or Password do not match!";

static CHALLENGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Challenge: ([^<]*)<").unwrap());

static STALE_STATUS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"HTTP/\d\.\d 302( Found)?").unwrap());

static EMBED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<embed[^>]*\(([^)]*)\)[^>]*>").unwrap());

static WRITELN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"document\.writeln\('\(([^)]*)\)'\)").unwrap());

static XML_FAVORITE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<\?xml.*<favorite.*<object\s+ID="ur_Host".+?</favorite>"#).unwrap()
});

/// `GET /my.logon.php3?check=1` — returns the `client_data` opaque
/// blob the login POST must echo back, or the empty string if the
/// gateway didn't send one.
pub fn preflight(
    host: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<String, LoginError> {
    let request = format!(
        "GET /my.logon.php3?check=1 HTTP/1.0\r\nHost: {host}\r\n{}\r\n",
        common_headers(host)
    );
    let response = send_request(host, &request, proxy, verify_cert)?;
    Ok(CLIENT_DATA_RE
        .captures(&response)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default())
}

/// `POST /my.activation.php3` — returns the `MRHSession` cookie value
/// on success.
pub fn do_login(
    host: &str,
    username: &str,
    password: &str,
    dpassword: &str,
    client_data: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<String, LoginError> {
    let mut fields: Vec<(&str, String)> = vec![
        ("username", username.to_string()),
        ("password", password.to_string()),
        ("dpassword", dpassword.to_string()),
        ("vhost", "standard".to_string()),
        ("login", "Logon".to_string()),
        ("miniui", "1".to_string()),
        ("mrhlogonform", "1".to_string()),
        ("rsa_port", String::new()),
        ("state", String::new()),
        ("tzoffsetmin", "1".to_string()),
        ("sessContentType", "HTML".to_string()),
        ("overpass", String::new()),
        ("lang", "en".to_string()),
        ("charset", "iso-8859-1".to_string()),
        ("uilang", "en".to_string()),
        ("uicharset", "iso-8859-1".to_string()),
        ("uilangchar", "en.iso-8859-1".to_string()),
        ("langswitcher", String::new()),
        ("client_data", client_data.to_string()),
    ];
    let body = fields
        .drain(..)
        .map(|(k, v)| format!("{k}={}", urlencode(&v)))
        .collect::<Vec<_>>()
        .join("&");

    let request = format!(
        "POST /my.activation.php3 HTTP/1.0\r\nHost: {host}\r\n{}Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        common_headers(host),
        body.len()
    );

    let response = send_request(host, &request, proxy, verify_cert)?;

    if response.contains(AUTH_FAIL_NEEDLE) {
        return Err(LoginError::Auth);
    }
    if let Some(cap) = CHALLENGE_RE.captures(&response) {
        return Err(LoginError::ChallengeRequired(cap[1].to_string()));
    }

    let session = SET_COOKIE_RE
        .captures_iter(&response)
        .map(|c| c[1].to_string())
        .filter(|v| v != "deleted")
        .next_back();

    session.ok_or(LoginError::UnknownLoginResponse)
}

/// `GET /vdesk/vpn/index.php3?outform=xml` — `None` means the session
/// is stale (the gateway redirected to the logon page).
pub fn fetch_favorites(
    host: &str,
    session: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<Option<Vec<Favorite>>, LoginError> {
    let request = format!(
        "GET /vdesk/vpn/index.php3?outform=xml HTTP/1.0\r\nHost: {host}\r\n{}Cookie: MRHSession={session}\r\n\r\n",
        common_headers(host)
    );
    let response = send_request(host, &request, proxy, verify_cert)?;

    if let Some(status_line) = response.lines().next() {
        if STALE_STATUS_RE.is_match(status_line) {
            return Ok(None);
        }
    }

    let xml_start = match response.find("<?xml ") {
        Some(idx) => idx,
        None => return Ok(Some(Vec::new())),
    };
    Ok(Some(parse_favorites(&response[xml_start..])))
}

static FAVORITE_ID_Z_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Z=([^&]+,[^&]+)&").unwrap());

fn parse_favorites(xml: &str) -> Vec<Favorite> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut favorites = Vec::new();
    let mut current_id: Option<String> = None;
    let mut in_name = false;
    let mut current_name = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let tag = String::from_utf8_lossy(local.as_ref()).into_owned();
                if tag == "favorite" {
                    current_id = e.attributes().flatten().find_map(|a| {
                        if a.key.local_name().as_ref() == b"id" {
                            let raw = a.decode_and_unescape_value(reader.decoder()).ok()?;
                            Some(raw.into_owned())
                        } else {
                            None
                        }
                    });
                    current_name.clear();
                } else if tag == "name" {
                    in_name = true;
                }
            }
            Ok(Event::Text(t)) if in_name => {
                current_name.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                let tag = String::from_utf8_lossy(local.as_ref()).into_owned();
                if tag == "name" {
                    in_name = false;
                } else if tag == "favorite" {
                    if let Some(raw_id) = current_id.take() {
                        let id = FAVORITE_ID_Z_RE
                            .captures(&raw_id)
                            .map(|c| c[1].to_string())
                            .unwrap_or(raw_id);
                        favorites.push(Favorite {
                            id,
                            name: current_name.clone(),
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    favorites
}

/// `GET /vdesk/vpn/connect.php3?resourcename=...` — `None` means the
/// session went stale between favorite listing and param fetch.
pub fn fetch_tunnel_params(
    host: &str,
    session: &str,
    favorite_id: &str,
    proxy: &ProxyConfig,
    verify_cert: bool,
) -> Result<Option<TunnelParams>, LoginError> {
    let request = format!(
        "GET /vdesk/vpn/connect.php3?resourcename={}&outform=xml&client_version=1.1 HTTP/1.0\r\nHost: {host}\r\n{}Cookie: MRHSession={session}\r\n\r\n",
        urlencode(favorite_id),
        common_headers(host)
    );
    let response = send_request(host, &request, proxy, verify_cert)?;

    if response.contains("Location: /my.logon.php3") {
        return Ok(None);
    }

    if let Some(m) = EMBED_RE.find_iter(&response).last() {
        let inner = EMBED_RE.captures(m.as_str()).unwrap()[1].to_string();
        return Ok(Some(decode_query_string(&normalize_embed(&inner))));
    }
    if let Some(m) = WRITELN_RE.captures_iter(&response).last() {
        let inner = m[1].to_string();
        return Ok(Some(decode_query_string(&normalize_embed(&inner))));
    }
    if let Some(m) = XML_FAVORITE_RE.find(&response) {
        return Ok(Some(decode_xml_params(m.as_str())));
    }

    Err(LoginError::NoTunnelParams)
}

fn normalize_embed(s: &str) -> String {
    s.replace(' ', "&").replace('"', "").replace('\'', "")
}

/// Splits on `&`, decodes `key=value`. Keys matching `q[0-9]+` carry a
/// hex-encoded `key=value` pair as their value.
pub fn decode_query_string(s: &str) -> HashMap<String, String> {
    static QNN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^q[0-9]+$").unwrap());

    let mut map = HashMap::new();
    for part in s.split('&') {
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        if QNN_RE.is_match(key) {
            if let Some(decoded) = hex_decode(value) {
                if let Some((k2, v2)) = decoded.split_once('=') {
                    map.insert(k2.to_string(), v2.to_string());
                }
            }
        } else {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn hex_decode(s: &str) -> Option<String> {
    if s.len() % 2 != 0 {
        return None;
    }
    let bytes: Option<Vec<u8>> = (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect();
    bytes.map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// Decodes a synthetic `<object ID="ur_Host">` fragment: each
/// immediate child's tag name and trimmed text become a key/value
/// pair.
pub fn decode_xml_params(xml: &str) -> TunnelParams {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let object_start = match xml.find("<object") {
        Some(idx) => idx,
        None => return HashMap::new(),
    };
    let object_end = xml.rfind("</object>").map(|i| i + "</object>".len()).unwrap_or(xml.len());
    let fragment = &xml[object_start..object_end];

    let mut reader = Reader::from_str(fragment);
    reader.config_mut().trim_text(true);

    let mut params = HashMap::new();
    let mut depth = 0usize;
    let mut current_tag = String::new();
    let mut current_text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 2 {
                    current_tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    current_text.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 {
                    let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    params.insert(tag, String::new());
                }
            }
            Ok(Event::Text(t)) if depth == 2 => {
                current_text.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    params.insert(current_tag.clone(), current_text.trim().to_string());
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    params
}

/// Interactively prompts for a favorite index when more than one is
/// available. Rejects out-of-range input and reprompts.
pub fn prompt_favorite_selection(favorites: &[Favorite]) -> io::Result<usize> {
    loop {
        println!("Available VPN connections:");
        for (i, fav) in favorites.iter().enumerate() {
            println!("  {i}: {}", fav.name);
        }
        print!("Select a connection [0-{}]: ", favorites.len() - 1);
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        if let Ok(index) = line.trim().parse::<usize>() {
            if index < favorites.len() {
                return Ok(index);
            }
        }
        println!("invalid selection, try again");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_query_string() {
        let m = decode_query_string("a=1&b=two&c=");
        assert_eq!(m.get("a"), Some(&"1".to_string()));
        assert_eq!(m.get("b"), Some(&"two".to_string()));
        assert_eq!(m.get("c"), Some(&"".to_string()));
    }

    #[test]
    fn decodes_qnn_hex_form() {
        // hex("foo=bar") under key q1
        let hex: String = "foo=bar".bytes().map(|b| format!("{b:02x}")).collect();
        let input = format!("q1={hex}");
        let m = decode_query_string(&input);
        assert_eq!(m.get("foo"), Some(&"bar".to_string()));
    }

    #[test]
    fn decodes_xml_object_params() {
        let xml = r#"<object ID="ur_Host"><a>1</a><b>  two  </b><c/></object>"#;
        let m = decode_xml_params(xml);
        assert_eq!(m.get("a"), Some(&"1".to_string()));
        assert_eq!(m.get("b"), Some(&"two".to_string()));
        assert_eq!(m.get("c"), Some(&"".to_string()));
    }

    #[test]
    fn extracts_favorite_id_with_z_fragment() {
        let xml = r#"<?xml version="1.0"?><favorites><favorite id="foo?Z=abc,def&amp;bar" name="X"><name>X</name></favorite></favorites>"#;
        let favorites = parse_favorites(xml);
        assert_eq!(favorites[0].id, "abc,def");
    }

    #[test]
    fn keeps_plain_favorite_id_unchanged() {
        let xml = r#"<?xml version="1.0"?><favorites><favorite id="plain"><name>X</name></favorite></favorites>"#;
        let favorites = parse_favorites(xml);
        assert_eq!(favorites[0].id, "plain");
    }

    #[test]
    fn recognizes_auth_failure() {
        let response = "HTTP/1.0 200 OK\r\n\r\nEither Username or Password do not match!";
        let err = SET_COOKIE_RE.captures(response);
        assert!(err.is_none());
        assert!(response.contains(AUTH_FAIL_NEEDLE));
    }
}
