//! Route arithmetic (§4.C): CIDR / dotted-netmask / implicit-class
//! parsing, plus reverse-DNS zone generation.

use std::net::Ipv4Addr;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("invalid route spec: {0}")]
    InvalidRouteSpec(String),
}

/// `(netparts, bits)`. A `bits == 32` spec denotes a host route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub netparts: [u8; 4],
    pub bits: u8,
}

impl RouteSpec {
    pub fn is_host_route(&self) -> bool {
        self.bits == 32
    }

    pub fn net_string(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.netparts[0], self.netparts[1], self.netparts[2], self.netparts[3]
        )
    }
}

fn pad_octets(mut parts: Vec<u32>, spec: &str) -> Result<[u8; 4], RouteError> {
    if parts.len() > 4 {
        return Err(RouteError::InvalidRouteSpec(spec.to_string()));
    }
    while parts.len() < 4 {
        parts.push(0);
    }
    let mut out = [0u8; 4];
    for (i, p) in parts.into_iter().enumerate() {
        out[i] = u8::try_from(p).map_err(|_| RouteError::InvalidRouteSpec(spec.to_string()))?;
    }
    Ok(out)
}

fn parse_octets(s: &str, spec: &str) -> Result<Vec<u32>, RouteError> {
    s.split('.')
        .map(|p| p.parse::<u32>().map_err(|_| RouteError::InvalidRouteSpec(spec.to_string())))
        .collect()
}

/// netmask -> prefix length, rejecting non-contiguous masks.
fn netmask_to_bits(netmask: u32, spec: &str) -> Result<u8, RouteError> {
    for bits in 0..=32u8 {
        let candidate: u32 = if bits == 0 { 0 } else { (!0u32) << (32 - bits) };
        if candidate == netmask {
            return Ok(bits);
        }
    }
    Err(RouteError::InvalidRouteSpec(format!(
        "non-contiguous netmask in routespec: {spec}"
    )))
}

/// Parses `w.x.y.z/N`, `w.x.y.z/A.B.C.D`, or `w[.x[.y[.z]]]`.
pub fn parse_net_bits(spec: &str) -> Result<RouteSpec, RouteError> {
    if let Some((net, bits_or_mask)) = spec.split_once('/') {
        let net_octets = parse_octets(net, spec)?;
        let netparts = pad_octets(net_octets, spec)?;

        let bits = if bits_or_mask.contains('.') {
            let mask_octets = parse_octets(bits_or_mask, spec)?;
            if mask_octets.len() > 4 {
                return Err(RouteError::InvalidRouteSpec(spec.to_string()));
            }
            let mut netmask: u32 = 0;
            for n in &mask_octets {
                netmask = netmask * 256 + n;
            }
            netmask *= 256u32.pow(4 - mask_octets.len() as u32);
            netmask_to_bits(netmask, spec)?
        } else {
            let bits: u8 = bits_or_mask
                .parse()
                .map_err(|_| RouteError::InvalidRouteSpec(spec.to_string()))?;
            if bits > 32 {
                return Err(RouteError::InvalidRouteSpec(spec.to_string()));
            }
            bits
        };

        Ok(RouteSpec { netparts, bits })
    } else {
        let octets = parse_octets(spec, spec)?;
        if octets.len() > 4 {
            return Err(RouteError::InvalidRouteSpec(spec.to_string()));
        }
        let bits = (octets.len() * 8) as u8;
        let netparts = pad_octets(octets, spec)?;
        Ok(RouteSpec { netparts, bits })
    }
}

/// Generates the reverse-DNS zones covering a route (§4.C).
pub fn routespec_to_revdns(spec: &RouteSpec) -> Vec<String> {
    let mut domain = "in-addr.arpa".to_string();
    let mut bits = spec.bits;
    let mut i = 0usize;

    while bits >= 8 {
        domain = format!("{}.{}", spec.netparts[i], domain);
        bits -= 8;
        i += 1;
    }

    if bits == 0 {
        vec![domain]
    } else {
        let remaining = 8 - bits;
        let mask = !((1u16 << remaining) - 1) as u8;
        let start = spec.netparts[i] & mask;
        let count = 1u16 << remaining;
        (0..count).map(|n| format!("{}.{}", start as u16 + n, domain)).collect()
    }
}

/// The current default gateway and outbound interface (§4.H step 7),
/// read from `netstat -rn` and parsed against the first line whose
/// destination column is `default` or `0.0.0.0` (matches both the
/// macOS and Linux column layouts of that command).
pub fn current_default_gateway() -> Result<(Ipv4Addr, String), RouteError> {
    let output = Command::new("netstat")
        .arg("-rn")
        .output()
        .map_err(|e| RouteError::InvalidRouteSpec(format!("failed to run netstat: {e}")))?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_default_gateway(&text)
        .ok_or_else(|| RouteError::InvalidRouteSpec("no default route found".to_string()))
}

fn parse_default_gateway(netstat_output: &str) -> Option<(Ipv4Addr, String)> {
    for line in netstat_output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(dest) = fields.first() else { continue };
        if *dest != "default" && *dest != "0.0.0.0" {
            continue;
        }
        let gateway = fields.get(1)?.parse::<Ipv4Addr>().ok()?;
        let iface = fields.last()?.to_string();
        return Some((gateway, iface));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr_form() {
        let spec = parse_net_bits("10.0.0.0/24").unwrap();
        assert_eq!(spec.netparts, [10, 0, 0, 0]);
        assert_eq!(spec.bits, 24);
        assert!(!spec.is_host_route());
    }

    #[test]
    fn parses_dotted_netmask_form() {
        let spec = parse_net_bits("192.168.1.0/255.255.255.0").unwrap();
        assert_eq!(spec.bits, 24);
    }

    #[test]
    fn rejects_noncontiguous_netmask() {
        let err = parse_net_bits("10.0.0.0/255.0.255.0").unwrap_err();
        assert!(matches!(err, RouteError::InvalidRouteSpec(_)));
    }

    #[test]
    fn parses_implicit_class_form() {
        let spec = parse_net_bits("10").unwrap();
        assert_eq!(spec.netparts, [10, 0, 0, 0]);
        assert_eq!(spec.bits, 8);

        let spec = parse_net_bits("10.1").unwrap();
        assert_eq!(spec.netparts, [10, 1, 0, 0]);
        assert_eq!(spec.bits, 16);
    }

    #[test]
    fn host_route_is_bits_32() {
        let spec = parse_net_bits("10.0.0.5/32").unwrap();
        assert!(spec.is_host_route());
    }

    #[test]
    fn revdns_whole_octet_boundary() {
        let spec = parse_net_bits("10.0.0.0/24").unwrap();
        let zones = routespec_to_revdns(&spec);
        assert_eq!(zones, vec!["0.0.10.in-addr.arpa"]);
    }

    #[test]
    fn revdns_sub_octet_boundary() {
        // /26 leaves 2 remaining bits in the last octet -> 4 zones.
        let spec = parse_net_bits("10.0.0.0/26").unwrap();
        let zones = routespec_to_revdns(&spec);
        assert_eq!(zones.len(), 4);
        for z in &zones {
            assert!(z.ends_with("in-addr.arpa"));
        }
        assert_eq!(zones[0], "0.0.0.10.in-addr.arpa");
        assert_eq!(zones[3], "3.0.0.10.in-addr.arpa");
    }

    #[test]
    fn parses_default_gateway_macos_style() {
        let output = "Destination        Gateway            Flags        Refs      Use   Netif Expire\n\
default             192.168.1.1        UGSc           37        0     en0\n";
        let (gw, iface) = parse_default_gateway(output).unwrap();
        assert_eq!(gw, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(iface, "en0");
    }

    #[test]
    fn parses_default_gateway_linux_style() {
        let output = "Kernel IP routing table\n\
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface\n\
0.0.0.0         10.0.0.1        0.0.0.0         UG    0      0        0 eth0\n";
        let (gw, iface) = parse_default_gateway(output).unwrap();
        assert_eq!(gw, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(iface, "eth0");
    }

    #[test]
    fn no_default_route_yields_none() {
        let output = "Destination  Gateway  Flags  Iface\n10.0.0.0  10.0.0.1  UG  eth0\n";
        assert!(parse_default_gateway(output).is_none());
    }

    #[test]
    fn revdns_length_matches_spec_formula() {
        for bits in [0u8, 8, 9, 16, 20, 24, 30, 32] {
            let spec = RouteSpec { netparts: [172, 16, 5, 0], bits };
            let zones = routespec_to_revdns(&spec);
            let expected = if bits % 8 == 0 { 1 } else { 1usize << (8 - bits % 8) };
            assert_eq!(zones.len(), expected, "bits={bits}");
        }
    }
}
