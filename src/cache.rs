//! `~/.f5vpn-login.conf` session cache (§3, §6)
//!
//! A single line of four NUL-separated fields:
//! `<unused_path>\0<user@host>\0<session>\0<unix_timestamp>`. The first
//! field is carried over from the original format but never read or
//! written meaningfully by this implementation. At most one record
//! exists at a time (invariant 1 in §3) — writing replaces the file.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to write session cache: {0}")]
    Write(std::io::Error),
    #[error("no home directory available")]
    NoHomeDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub userhost: String,
    pub session: String,
    pub timestamp: i64,
}

fn cache_path() -> Result<PathBuf, CacheError> {
    let home = dirs::home_dir().ok_or(CacheError::NoHomeDir)?;
    Ok(home.join(".f5vpn-login.conf"))
}

/// Load the cached session. Any read or parse error is non-fatal and
/// yields `None`, matching the original's `except: return None`.
pub fn load() -> Option<CachedSession> {
    let path = cache_path().ok()?;
    let content = std::fs::read_to_string(path).ok()?;
    parse(&content)
}

fn parse(line: &str) -> Option<CachedSession> {
    let mut fields = line.split('\0');
    let _unused_path = fields.next()?;
    let userhost = fields.next()?;
    let session = fields.next()?;
    let timestamp = fields.next()?;

    if userhost.is_empty() || session.is_empty() {
        return None;
    }

    Some(CachedSession {
        userhost: userhost.to_string(),
        session: session.to_string(),
        timestamp: timestamp.trim().parse().ok()?,
    })
}

/// Persist a session, replacing whatever was previously cached.
pub fn save(userhost: &str, session: &str, timestamp: i64) -> Result<(), CacheError> {
    let path = cache_path()?;
    let line = format!("\0{}\0{}\0{}", userhost, session, timestamp);
    std::fs::write(path, line).map_err(CacheError::Write)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_record() {
        let line = "\0me@gw.example.com\0S0\01234567890";
        let cached = parse(line).unwrap();
        assert_eq!(cached.userhost, "me@gw.example.com");
        assert_eq!(cached.session, "S0");
        assert_eq!(cached.timestamp, 1234567890);
    }

    #[test]
    fn rejects_truncated_record() {
        assert!(parse("\0me@gw").is_none());
    }

    #[test]
    fn rejects_empty_session() {
        assert!(parse("\0me@gw\0\01234567890").is_none());
    }
}
