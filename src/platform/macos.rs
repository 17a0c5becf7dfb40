//! macOS platform variant (§4.D)

use super::{Platform, PlatformError, RouteAction};
use crate::privilege::{as_root, run_as_root, run_as_root_best_effort};
use std::path::Path;

use core_foundation::array::CFArray;
use core_foundation::base::TCFType;
use core_foundation::dictionary::CFDictionary;
use core_foundation::propertylist::CFPropertyList;
use core_foundation::string::CFString;
use system_configuration::dynamic_store::SCDynamicStoreBuilder;

/// Tries the `SCDynamicStore` framework API first (the original's
/// `load_SystemConfigurationFramework` path): a direct API call, so
/// unlike `scutil` it isn't subject to any command-length ceiling and
/// always carries the reverse-DNS zones. Returns `Err` only when the
/// dynamic store itself can't be reached, in which case the caller
/// falls back to the textual `scutil` script.
fn set_dns_via_dynamic_store(
    service_id: &str,
    dns_servers: &[String],
    dns_domains: &[String],
    revdns_domains: &[String],
    override_gateway: bool,
) -> Result<(), String> {
    let result = as_root(|| -> Result<(), String> {
        let store = SCDynamicStoreBuilder::new("f5vpn-login").build();

        let server_array = CFArray::from_CFTypes(
            &dns_servers.iter().map(|s| CFString::new(s)).collect::<Vec<_>>(),
        );

        let mut pairs: Vec<(CFString, CFPropertyList)> =
            vec![(CFString::new("ServerAddresses"), server_array.into_CFType().into())];

        if override_gateway {
            let search = CFArray::from_CFTypes(
                &dns_domains.iter().map(|s| CFString::new(s)).collect::<Vec<_>>(),
            );
            pairs.push((CFString::new("SearchDomains"), search.into_CFType().into()));
        } else {
            let mut supplemental: Vec<CFString> = dns_domains.iter().map(|s| CFString::new(s)).collect();
            supplemental.extend(revdns_domains.iter().map(|s| CFString::new(s)));
            let supplemental_array = CFArray::from_CFTypes(&supplemental);
            pairs.push((
                CFString::new("SupplementalMatchDomains"),
                supplemental_array.into_CFType().into(),
            ));
        }

        let dict: CFDictionary<CFString, CFPropertyList> = CFDictionary::from_CFType_pairs(&pairs);
        let key = CFString::new(&format!("State:/Network/Service/{service_id}/DNS"));

        if store.set(key, dict) {
            Ok(())
        } else {
            Err("SCDynamicStoreSetValue rejected the DNS dictionary".to_string())
        }
    });

    match result {
        Ok(inner) => inner,
        Err(e) => Err(format!("failed to elevate for SCDynamicStore: {e}")),
    }
}

fn find_binary(candidates: &[&'static str]) -> &'static str {
    candidates
        .iter()
        .copied()
        .find(|path| Path::new(path).exists())
        .unwrap_or(candidates[0])
}

pub struct DarwinPlatform {
    route_path: &'static str,
    dns_installed: bool,
    service_id: String,
}

impl DarwinPlatform {
    pub fn new() -> Self {
        Self {
            route_path: find_binary(&["/sbin/route", "/usr/bin/route"]),
            dns_installed: false,
            service_id: String::new(),
        }
    }
}

impl Default for DarwinPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for DarwinPlatform {
    fn setup_route(
        &self,
        ifname: Option<&str>,
        gateway_ip: &str,
        net: &str,
        bits: u8,
        action: RouteAction,
    ) -> Result<(), PlatformError> {
        let target = format!("{net}/{bits}");
        let mut args: Vec<&str> = vec![self.route_path, action.as_str(), "-net", &target];
        if let Some(iface) = ifname {
            args.push("-interface");
            args.push(iface);
        } else {
            args.push(gateway_ip);
        }
        run_as_root(&args, None).map_err(|e| PlatformError::AddRoute(e.to_string()))
    }

    fn setup_dns(
        &mut self,
        _iface_name: &str,
        service_id: &str,
        dns_servers: &[String],
        dns_domains: &[String],
        revdns_domains: &[String],
        override_gateway: bool,
    ) -> Result<(), PlatformError> {
        self.service_id = service_id.to_string();

        if let Err(e) = set_dns_via_dynamic_store(
            service_id,
            dns_servers,
            dns_domains,
            revdns_domains,
            override_gateway,
        ) {
            tracing::warn!("SCDynamicStore path failed ({e}), falling back to scutil");

            let mut script = String::from("d.init\n");
            script.push_str(&format!("d.add ServerAddresses * {}\n", dns_servers.join(" ")));

            // scutil has a ~256-char command-length ceiling; with it
            // generally not reasonable to fit the reverse zones too,
            // this fallback omits them unconditionally rather than
            // truncating them (they're only ever carried over the
            // SCDynamicStore path above).
            if override_gateway {
                script.push_str(&format!("d.add SearchDomains * {}\n", dns_domains.join(" ")));
            } else {
                script.push_str(&format!("d.add SupplementalMatchDomains * {}\n", dns_domains.join(" ")));
            }
            script.push_str(&format!("set State:/Network/Service/{service_id}/DNS\n"));

            run_as_root(&["/usr/sbin/scutil"], Some(script.as_bytes()))
                .map_err(|e| PlatformError::SetupDns(e.to_string()))?;
        }
        self.dns_installed = true;
        Ok(())
    }

    fn teardown_dns(&mut self) {
        if !self.dns_installed {
            return;
        }
        let script = format!("remove State:/Network/Service/{}/DNS\n", self.service_id);
        run_as_root_best_effort(&["/usr/sbin/scutil"], Some(script.as_bytes()));
        self.dns_installed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_first_candidate_when_none_exist() {
        let path = find_binary(&["/nonexistent/route-a", "/nonexistent/route-b"]);
        assert_eq!(path, "/nonexistent/route-a");
    }
}
