//! Platform abstraction (§4.D)
//!
//! One concrete value per detected environment rather than the
//! original's runtime-composed mixin: `{Darwin, LinuxSystemdResolved,
//! LinuxResolvconf, LinuxManual}`.

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "linux")]
pub mod linux;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("failed to add route: {0}")]
    AddRoute(String),
    #[error("failed to delete route: {0}")]
    DeleteRoute(String),
    #[error("failed to configure dns: {0}")]
    SetupDns(String),
    #[error("unsupported platform")]
    Unsupported,
    #[error("could not determine default gateway: {0}")]
    DefaultGateway(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Add,
    Delete,
}

impl RouteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteAction::Add => "add",
            RouteAction::Delete => "delete",
        }
    }
}

/// Capability set every platform variant must implement (§4.D).
pub trait Platform {
    fn setup_route(
        &self,
        ifname: Option<&str>,
        gateway_ip: &str,
        net: &str,
        bits: u8,
        action: RouteAction,
    ) -> Result<(), PlatformError>;

    fn setup_dns(
        &mut self,
        iface_name: &str,
        service_id: &str,
        dns_servers: &[String],
        dns_domains: &[String],
        revdns_domains: &[String],
        override_gateway: bool,
    ) -> Result<(), PlatformError>;

    fn teardown_dns(&mut self);

    /// Only meaningful on Linux; macOS has no analogous polling step.
    fn wait_for_interface(&self, _iface_name: &str) {}
}

/// Detects and constructs the platform variant for the current OS.
#[cfg(target_os = "macos")]
pub fn detect() -> Result<Box<dyn Platform>, PlatformError> {
    Ok(Box::new(macos::DarwinPlatform::new()))
}

#[cfg(target_os = "linux")]
pub fn detect() -> Result<Box<dyn Platform>, PlatformError> {
    Ok(Box::new(linux::detect_dns_backend()))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn detect() -> Result<Box<dyn Platform>, PlatformError> {
    Err(PlatformError::Unsupported)
}
