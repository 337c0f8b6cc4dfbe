//! Forwarding rule

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ssh::ForwardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardKind {
    /// Local listener, channel to a remote target
    Local,
    /// Remote listener, connection to a local target
    Remote,
    /// Local SOCKS5 listener, target chosen per connection
    Dynamic,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

/// One forwarding rule. `host:port` is where the listener binds (local
/// side for Local/Dynamic, server side for Remote).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedPort {
    pub kind: ForwardKind,
    #[serde(default = "default_bind_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub target_address: String,
    #[serde(default)]
    pub target_port: u16,
}

impl ForwardedPort {
    pub fn local(host: impl Into<String>, port: u16, target: impl Into<String>, target_port: u16) -> Self {
        Self {
            kind: ForwardKind::Local,
            host: host.into(),
            port,
            target_address: target.into(),
            target_port,
        }
    }

    pub fn remote(host: impl Into<String>, port: u16, target: impl Into<String>, target_port: u16) -> Self {
        Self {
            kind: ForwardKind::Remote,
            host: host.into(),
            port,
            target_address: target.into(),
            target_port,
        }
    }

    pub fn dynamic(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: ForwardKind::Dynamic,
            host: host.into(),
            port,
            target_address: String::new(),
            target_port: 0,
        }
    }

    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same listener: kind, bind host and bind port
    pub fn same_binding(&self, other: &ForwardedPort) -> bool {
        self.kind == other.kind && self.host == other.host && self.port == other.port
    }

    pub fn validate(&self) -> Result<(), ForwardError> {
        if self.host.trim().is_empty() {
            return Err(ForwardError::Bind {
                addr: self.bind_addr(),
                reason: "bind host is empty".into(),
            });
        }
        match self.kind {
            ForwardKind::Dynamic => Ok(()),
            ForwardKind::Local | ForwardKind::Remote => {
                if self.target_address.trim().is_empty() || self.target_port == 0 {
                    Err(ForwardError::Bind {
                        addr: self.bind_addr(),
                        reason: "target address and port are required".into(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl fmt::Display for ForwardedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ForwardKind::Local => write!(
                f,
                "(local) {}:{} → (remote) {}:{}",
                self.host, self.port, self.target_address, self.target_port
            ),
            ForwardKind::Remote => write!(
                f,
                "(remote) {}:{} → (local) {}:{}",
                self.host, self.port, self.target_address, self.target_port
            ),
            ForwardKind::Dynamic => write!(f, "(dynamic) {}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ForwardedPort::local("127.0.0.1", 8888, "localhost", 8889).to_string(),
            "(local) 127.0.0.1:8888 → (remote) localhost:8889"
        );
        assert_eq!(
            ForwardedPort::remote("0.0.0.0", 9000, "localhost", 3000).to_string(),
            "(remote) 0.0.0.0:9000 → (local) localhost:3000"
        );
        assert_eq!(
            ForwardedPort::dynamic("127.0.0.1", 1080).to_string(),
            "(dynamic) 127.0.0.1:1080"
        );
    }

    #[test]
    fn test_deserialize_defaults_bind_host() {
        let fw: ForwardedPort = serde_json::from_str(
            r#"{"kind":"Local","port":8080,"targetAddress":"db","targetPort":5432}"#,
        )
        .unwrap();
        assert_eq!(fw, ForwardedPort::local("127.0.0.1", 8080, "db", 5432));

        let socks: ForwardedPort = serde_json::from_str(r#"{"kind":"Dynamic","port":1080}"#).unwrap();
        assert!(socks.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_target() {
        assert!(ForwardedPort::local("127.0.0.1", 80, "", 0).validate().is_err());
        assert!(ForwardedPort::remote("", 80, "h", 1).validate().is_err());
        assert!(ForwardedPort::remote("0.0.0.0", 80, "h", 1).validate().is_ok());
    }

    #[test]
    fn test_bind_addr_brackets_ipv6() {
        assert_eq!(ForwardedPort::dynamic("::1", 1080).bind_addr(), "[::1]:1080");
        assert_eq!(ForwardedPort::dynamic("localhost", 1080).bind_addr(), "localhost:1080");
    }
}
