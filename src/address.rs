//! Instance address resolution for presence tokens.
//!
//! The address announced in a [`DiscoveryToken`](crate::DiscoveryToken) is the entry for
//! this host's name in the hosts file (container runtimes write one per container). When
//! no entry matches, the configured fallback is used.

use std::path::{Path, PathBuf};

/// Default hosts file location.
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Resolves the address this instance should announce.
#[derive(Debug, Clone)]
pub struct AddressResolver {
    hosts_path: PathBuf,
    hostname: Option<String>,
    fallback: String,
}

impl AddressResolver {
    /// Resolver reading [`DEFAULT_HOSTS_PATH`] and falling back to `fallback`.
    pub fn new(fallback: impl Into<String>) -> Self {
        Self { hosts_path: PathBuf::from(DEFAULT_HOSTS_PATH), hostname: None, fallback: fallback.into() }
    }

    /// Read entries from `path`.
    pub fn with_hosts_path(mut self, path: impl AsRef<Path>) -> Self {
        self.hosts_path = path.as_ref().to_path_buf();
        self
    }

    /// Look up `hostname` instead of this machine's name.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Address for this instance. Never fails; unreadable files yield the fallback.
    pub fn resolve(&self) -> String {
        let Some(hostname) = self.hostname.clone().or_else(local_hostname) else {
            tracing::debug!(target: "lifeguard::address", "hostname unknown, using fallback address");
            return self.fallback.clone();
        };
        match std::fs::read_to_string(&self.hosts_path) {
            Ok(contents) => match lookup(&contents, &hostname) {
                Some(address) => address,
                None => {
                    tracing::debug!(
                        target: "lifeguard::address",
                        hostname = %hostname,
                        "no hosts entry, using fallback address"
                    );
                    self.fallback.clone()
                }
            },
            Err(err) => {
                tracing::warn!(
                    target: "lifeguard::address",
                    path = %self.hosts_path.display(),
                    error = %err,
                    "hosts file unreadable, using fallback address"
                );
                self.fallback.clone()
            }
        }
    }
}

fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// First address in `hosts` listing `hostname`, skipping loopback entries.
pub fn lookup(hosts: &str, hostname: &str) -> Option<String> {
    hosts
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let address = fields.next()?;
            fields.any(|name| name == hostname).then(|| address.to_string())
        })
        .find(|address| !address.starts_with("127.") && address != "::1")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTS: &str = "\
127.0.0.1\tlocalhost
::1\tlocalhost ip6-localhost
# comment line 10.9.9.9 a1b2c3
127.0.1.1\ta1b2c3
172.17.0.4\ta1b2c3 accountservice
";

    #[test]
    fn lookup_skips_comments_and_loopback() {
        assert_eq!(lookup(HOSTS, "a1b2c3").as_deref(), Some("172.17.0.4"));
        assert_eq!(lookup(HOSTS, "accountservice").as_deref(), Some("172.17.0.4"));
        assert_eq!(lookup(HOSTS, "localhost"), None);
        assert_eq!(lookup(HOSTS, "missing"), None);
    }

    #[test]
    fn resolve_reads_hosts_file() {
        let path = std::env::temp_dir().join(format!("lifeguard-hosts-{}", std::process::id()));
        std::fs::write(&path, HOSTS).unwrap();
        let resolver = AddressResolver::new("10.0.0.1").with_hosts_path(&path).with_hostname("a1b2c3");
        assert_eq!(resolver.resolve(), "172.17.0.4");

        let miss = resolver.clone().with_hostname("elsewhere");
        assert_eq!(miss.resolve(), "10.0.0.1");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unreadable_hosts_file_falls_back() {
        let resolver = AddressResolver::new("10.0.0.1")
            .with_hosts_path("/nonexistent/hosts")
            .with_hostname("a1b2c3");
        assert_eq!(resolver.resolve(), "10.0.0.1");
    }
}
