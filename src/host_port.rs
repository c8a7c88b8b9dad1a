//! Address parsing and small shared utilities

use std::fmt;

use tokio::io::AsyncWriteExt;

/// A resolved `host:port` pair, used as a map key for broker nodes
///
/// Parsed via [`HostAndPort::parse`], with a default port applied when the
/// input string omits one. Two instances are equal iff both fields are
/// equal (structural equality, no DNS resolution is performed).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    /// Construct directly from a host and port
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        check_not_blank("host", &host);
        Self { host, port }
    }

    /// Parse a `"host:port"` or bare `"host"` string
    ///
    /// When the `:port` suffix is absent, `default_port` is used.
    #[must_use]
    pub fn parse(addr: &str, default_port: u16) -> Self {
        match addr.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => Self::new(host, port),
                Err(_) => Self::new(addr, default_port),
            },
            None => Self::new(addr, default_port),
        }
    }

    /// The host portion
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port portion
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Panics if `name` is empty
pub(crate) fn check_not_blank(name: &'static str, value: &str) {
    assert!(!value.trim().is_empty(), "{name} must not be blank");
}

/// Best-effort, silent shutdown of a socket
///
/// Used when tearing down a connection that may already be half-closed;
/// errors are intentionally discarded since there is nothing left to do
/// with them by the time a connection is being torn down.
pub(crate) async fn quiet_close<W: AsyncWriteExt + Unpin>(writer: &mut W) {
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::HostAndPort;

    #[test]
    fn parse_with_port() {
        let hp = HostAndPort::parse("broker-1:4150", 4150);
        assert_eq!("broker-1", hp.host());
        assert_eq!(4150, hp.port());
    }

    #[test]
    fn parse_without_port_uses_default() {
        let hp = HostAndPort::parse("broker-1", 4150);
        assert_eq!("broker-1", hp.host());
        assert_eq!(4150, hp.port());
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(
            HostAndPort::parse("a:1", 0),
            HostAndPort::new("a".to_owned(), 1)
        );
        assert_ne!(HostAndPort::new("a", 1), HostAndPort::new("a", 2));
    }

    #[test]
    fn display_roundtrips() {
        let hp = HostAndPort::new("a", 1234);
        assert_eq!("a:1234", hp.to_string());
    }
}
