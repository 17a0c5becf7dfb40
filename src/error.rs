//! Crate-wide error aggregation
//!
//! Every module in this crate defines its own `thiserror` enum for the
//! failures it can produce. `Error` wraps them all so `main` can match
//! once and pick an exit code (see `main::exit_code`).

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::https::HttpsError;
use crate::login::LoginError;
use crate::platform::PlatformError;
use crate::pppd::PppdError;
use crate::relay::RelayError;
use crate::route::RouteError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Https(#[from] HttpsError),

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Pppd(#[from] PppdError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("must be run as root (or setuid root)")]
    NotRoot,

    #[error("no host specified and no previous session cached")]
    NoHost,

    #[error("unable to determine the VPN favorite to connect to")]
    NoFavoriteSelected,

    #[error("unable to find the Network Access entry in the main menu; do you have VPN access?")]
    NoNetworkAccess,

    #[error("invalid proxy spec (expected host:port): {0}")]
    InvalidProxySpec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Privilege(#[from] nix::Error),
}

impl Error {
    /// Exit code per §6: 0 normal, 1 unknown fatal, 2 tunnel params
    /// unavailable, 3 bad credentials.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Login(LoginError::Auth) => 3,
            Error::Login(LoginError::NoTunnelParams) | Error::NoFavoriteSelected => 2,
            _ => 1,
        }
    }
}
