//! Connection profile
//!
//! The profile is supplied by the configuration layer and is immutable once
//! a session starts. Field names follow the camelCase layout of the stored
//! connection records.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;
use crate::forwarding::ForwardedPort;

/// Key exchange algorithms that are never offered, whatever the profile says
pub const ALGORITHM_BLACKLIST: &[&str] = &[
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group-exchange-sha1",
];

/// Pinned authentication type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    None,
    Password,
    PublicKey,
    Agent,
    KeyboardInteractive,
}

/// Algorithm class in the profile's `algorithms` map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlgorithmType {
    #[serde(rename = "hmac")]
    Hmac,
    #[serde(rename = "kex")]
    Kex,
    #[serde(rename = "cipher")]
    Cipher,
    #[serde(rename = "serverHostKey")]
    HostKey,
}

/// How the server's host key is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyPolicy {
    /// Log the fingerprint and accept any key
    AcceptAndLog,
    /// Trust on first use: remember unknown keys, reject changed ones
    #[default]
    Tofu,
    /// Only accept keys already present in known_hosts
    Strict,
}

/// One automated expect/send step run against the shell output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginScript {
    /// Text (or pattern) to wait for. Empty means "send immediately".
    #[serde(default)]
    pub expect: String,
    /// Command to send, or replacement template for regex scripts
    pub send: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub optional: bool,
}

impl LoginScript {
    pub fn new(expect: impl Into<String>, send: impl Into<String>) -> Self {
        Self {
            expect: expect.into(),
            send: send.into(),
            is_regex: false,
            optional: false,
        }
    }

    pub fn regex(expect: impl Into<String>, send: impl Into<String>) -> Self {
        Self {
            is_regex: true,
            ..Self::new(expect, send)
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Scripts with an empty `expect` fire without waiting for output
    pub fn is_unconditional(&self) -> bool {
        self.expect.is_empty()
    }
}

/// SSH connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Display name
    #[serde(default)]
    pub name: String,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    /// Pinned auth type; `None` lets the negotiator try everything
    #[serde(default)]
    pub auth: Option<AuthKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Private key path, or inline PEM/OpenSSH key material
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default)]
    pub algorithms: BTreeMap<AlgorithmType, Vec<String>>,

    /// Keepalive interval in milliseconds, 0 disables keepalives
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: usize,

    /// Time allowed for the handshake, in milliseconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,

    /// Name of the profile used as jump host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_host: Option<String>,

    #[serde(default)]
    pub x11: bool,

    #[serde(default)]
    pub agent_forward: bool,

    #[serde(default)]
    pub skip_banner: bool,

    #[serde(default)]
    pub scripts: Vec<LoginScript>,

    /// How long a required login script may wait for its output, in
    /// milliseconds. 0 waits forever.
    #[serde(default = "default_login_script_timeout")]
    pub login_script_timeout: u64,

    /// Forwards started as soon as the session is ready
    #[serde(default)]
    pub forwarded_ports: Vec<ForwardedPort>,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    #[serde(default = "default_cols")]
    pub cols: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,
}

fn default_port() -> u16 {
    22
}

fn default_keepalive_interval() -> u64 {
    15_000
}

fn default_keepalive_count_max() -> usize {
    3
}

fn default_ready_timeout() -> u64 {
    20_000
}

fn default_login_script_timeout() -> u64 {
    30_000
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: default_port(),
            user: String::new(),
            auth: None,
            password: None,
            private_key: None,
            algorithms: BTreeMap::new(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count_max(),
            ready_timeout: default_ready_timeout(),
            jump_host: None,
            x11: false,
            agent_forward: false,
            skip_banner: false,
            scripts: Vec::new(),
            login_script_timeout: default_login_script_timeout(),
            forwarded_ports: Vec::new(),
            host_key_policy: HostKeyPolicy::default(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

impl ConnectionProfile {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: host.clone(),
            host,
            port,
            user: user.into(),
            ..Default::default()
        }
    }

    /// Build a profile from a `[user@]host[:port]` query.
    ///
    /// The user defaults to `root` and the port to 22. The last `@` splits
    /// user from host, so users containing `@` survive.
    pub fn quick_connect(query: &str) -> Result<Self, SshError> {
        let query = query.trim();
        let (user, rest) = match query.rfind('@') {
            Some(idx) => (&query[..idx], &query[idx + 1..]),
            None => ("root", query),
        };

        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    SshError::InvalidProfile(format!("Invalid port in \"{}\"", query))
                })?;
                (host, port)
            }
            None => (rest, 22),
        };

        let mut profile = Self::new(host, port, user);
        profile.name = query.to_string();
        profile.validate()?;
        Ok(profile)
    }

    /// Reject profiles that cannot possibly connect
    pub fn validate(&self) -> Result<(), SshError> {
        if self.host.trim().is_empty() {
            return Err(SshError::InvalidProfile("Host is empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(SshError::InvalidProfile("User is empty".into()));
        }
        if self.port == 0 {
            return Err(SshError::InvalidProfile("Port must not be 0".into()));
        }
        for script in self.scripts.iter().filter(|s| s.is_regex) {
            if let Err(e) = regex::Regex::new(&script.expect) {
                return Err(SshError::InvalidProfile(format!(
                    "Invalid login script pattern \"{}\": {}",
                    script.expect, e
                )));
            }
        }
        Ok(())
    }

    /// Key under which this connection's password lives in the secret store
    pub fn secret_key(&self) -> String {
        format!("ssh:{}@{}:{}", self.user, self.host, self.port)
    }

    /// `user@host` label used in prompts
    pub fn label(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Whether the given auth kind may be offered under this profile's pin
    pub fn allows(&self, kind: AuthKind) -> bool {
        match self.auth {
            None => true,
            Some(pinned) => pinned == kind,
        }
    }

    /// Algorithm names for a class, with blacklisted entries removed
    pub fn algorithm_list(&self, class: AlgorithmType) -> Vec<String> {
        self.algorithms
            .get(&class)
            .map(|names| {
                names
                    .iter()
                    .filter(|n| !ALGORITHM_BLACKLIST.contains(&n.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_interval > 0).then(|| Duration::from_millis(self.keepalive_interval))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout)
    }

    pub fn login_script_timeout(&self) -> Option<Duration> {
        (self.login_script_timeout > 0).then(|| Duration::from_millis(self.login_script_timeout))
    }
}
