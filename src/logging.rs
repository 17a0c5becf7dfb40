//! tracing subscriber setup
//!
//! `-v`/`-vv` on the command line raises the default level; `RUST_LOG`
//! always takes precedence when set. `F5VPN_LOG_FORMAT` (`pretty` or
//! `json`) is read the same way ahead of `--log-format`.

use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const ENV_VAR_LOG_FORMAT: &str = "F5VPN_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn resolve_format(flag: LogFormat) -> LogFormat {
    match std::env::var(ENV_VAR_LOG_FORMAT) {
        Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        Ok(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
        _ => flag,
    }
}

pub fn init(verbosity: u8, format: LogFormat) {
    let default_level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match resolve_format(format) {
        LogFormat::Pretty => {
            let _ = subscriber.finish().try_init();
        }
        LogFormat::Json => {
            let _ = subscriber.json().finish().try_init();
        }
    }
}
