//! Log watcher (§4.F)
//!
//! Accumulates the entire PPPD log stream and re-applies four anchored
//! patterns against the growing buffer until all four have matched,
//! then fires an ip-up callback exactly once.

use once_cell::sync::Lazy;
use regex::Regex;

static IFACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Using interface (.*)$").unwrap());
static TTY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Connect: .* <--> (.*)$").unwrap());
static REMOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^remote IP address (.*)$").unwrap());
static LOCAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^local  IP address (.*)$").unwrap());

#[derive(Debug, Clone)]
pub struct IpUpEvent {
    pub iface: String,
    pub tty: String,
    pub local_ip: String,
    pub remote_ip: String,
}

#[derive(Default)]
pub struct LogWatcher {
    buffer: String,
    iface: Option<String>,
    tty: Option<String>,
    remote_ip: Option<String>,
    local_ip: Option<String>,
    fired: bool,
}

impl LogWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk (decoded lossily — PPPD log output is not
    /// guaranteed UTF-8) into the accumulator. Returns the ip-up event
    /// exactly once, on the call where the fourth pattern first
    /// matches.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<IpUpEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        if self.fired {
            return None;
        }

        if self.iface.is_none() {
            self.iface = IFACE_RE.captures(&self.buffer).map(|c| c[1].trim().to_string());
        }
        if self.tty.is_none() {
            self.tty = TTY_RE.captures(&self.buffer).map(|c| c[1].trim().to_string());
        }
        if self.remote_ip.is_none() {
            self.remote_ip = REMOTE_RE.captures(&self.buffer).map(|c| c[1].trim().to_string());
        }
        if self.local_ip.is_none() {
            self.local_ip = LOCAL_RE.captures(&self.buffer).map(|c| c[1].trim().to_string());
        }

        if let (Some(iface), Some(tty), Some(local_ip), Some(remote_ip)) =
            (&self.iface, &self.tty, &self.local_ip, &self.remote_ip)
        {
            self.fired = true;
            return Some(IpUpEvent {
                iface: iface.clone(),
                tty: tty.clone(),
                local_ip: local_ip.clone(),
                remote_ip: remote_ip.clone(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_exactly_once_on_full_sequence() {
        let log = "Using interface ppp0\nConnect: /dev/pts/3 <--> /dev/pts/5\nlocal  IP address 10.0.0.2\nremote IP address 10.0.0.1\n";

        let mut watcher = LogWatcher::new();
        let mut events = Vec::new();
        for chunk in [&log[..10], &log[10..37], &log[37..60], &log[60..]] {
            if let Some(event) = watcher.feed(chunk.as_bytes()) {
                events.push(event);
            }
        }

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.iface, "ppp0");
        assert_eq!(event.tty, "/dev/pts/5");
        assert_eq!(event.local_ip, "10.0.0.2");
        assert_eq!(event.remote_ip, "10.0.0.1");
    }

    #[test]
    fn does_not_fire_on_partial_matches() {
        let mut watcher = LogWatcher::new();
        assert!(watcher.feed(b"Using interface ppp0\n").is_none());
        assert!(watcher.feed(b"Connect: /dev/pts/3 <--> /dev/pts/5\n").is_none());
        assert!(watcher.feed(b"local  IP address 10.0.0.2\n").is_none());
    }
}
