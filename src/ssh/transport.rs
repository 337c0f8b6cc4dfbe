//! Transport dialing
//!
//! Opens the SSH transport for a profile, either over TCP or over a
//! `direct-tcpip` channel of an already Ready session (jump host).

use std::borrow::Cow;
use std::sync::Arc;

use russh::client::{self, Handle};
use russh::Preferred;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::{AlgorithmType, ConnectionProfile};
use super::error::SshError;
use super::handle_owner::HandleController;

/// Pick the profile's algorithms out of the transport's supported set,
/// keeping the profile's order. `None` keeps the transport default.
fn select<T: Clone>(
    supported: &[T],
    wanted: &[String],
    name: impl Fn(&T) -> &str,
    class: AlgorithmType,
) -> Option<Vec<T>> {
    if wanted.is_empty() {
        return None;
    }

    let mut picked = Vec::new();
    for w in wanted {
        match supported.iter().find(|s| name(s) == w) {
            Some(alg) => picked.push(alg.clone()),
            None => warn!("Ignoring unsupported {:?} algorithm \"{}\"", class, w),
        }
    }

    if picked.is_empty() {
        warn!("No supported {:?} algorithms configured, using defaults", class);
        return None;
    }
    Some(picked)
}

fn preferred(profile: &ConnectionProfile) -> Preferred {
    let defaults = Preferred::default();
    let mut preferred = defaults.clone();

    if let Some(mut kex) = select(
        &defaults.kex,
        &profile.algorithm_list(AlgorithmType::Kex),
        |n| n.as_ref(),
        AlgorithmType::Kex,
    ) {
        // Extension markers ride along in the kex list
        kex.extend(defaults.kex.iter().filter(|n| {
            let n: &str = n.as_ref();
            n.starts_with("ext-info-") || n.starts_with("kex-strict-")
        }).cloned());
        preferred.kex = Cow::Owned(kex);
    }
    if let Some(cipher) = select(
        &defaults.cipher,
        &profile.algorithm_list(AlgorithmType::Cipher),
        |n| n.as_ref(),
        AlgorithmType::Cipher,
    ) {
        preferred.cipher = Cow::Owned(cipher);
    }
    if let Some(mac) = select(
        &defaults.mac,
        &profile.algorithm_list(AlgorithmType::Hmac),
        |n| n.as_ref(),
        AlgorithmType::Hmac,
    ) {
        preferred.mac = Cow::Owned(mac);
    }
    if let Some(key) = select(
        &defaults.key,
        &profile.algorithm_list(AlgorithmType::HostKey),
        |a| a.as_str(),
        AlgorithmType::HostKey,
    ) {
        preferred.key = Cow::Owned(key);
    }

    preferred
}

/// russh client configuration for a profile
pub fn client_config(profile: &ConnectionProfile) -> client::Config {
    client::Config {
        // Liveness comes from keepalives alone
        inactivity_timeout: None,
        keepalive_interval: profile.keepalive(),
        keepalive_max: profile.keepalive_count_max,
        preferred: preferred(profile),
        ..Default::default()
    }
}

/// Failures before the handshake completes are connection failures,
/// except host key rejections which keep their own variant.
fn connect_error(profile: &ConnectionProfile, err: SshError) -> SshError {
    match err {
        SshError::HostKeyRejected(_) => err,
        other => SshError::ConnectionFailed(format!(
            "{}:{}: {}",
            profile.host, profile.port, other
        )),
    }
}

/// Dial the profile's host directly
pub async fn connect_direct(
    profile: &ConnectionProfile,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>, SshError> {
    info!("Connecting to SSH server at {}:{}", profile.host, profile.port);
    let config = Arc::new(client_config(profile));

    let handle = tokio::time::timeout(
        profile.ready_timeout(),
        client::connect(config, (profile.host.as_str(), profile.port), handler),
    )
    .await
    .map_err(|_| {
        SshError::Timeout(format!(
            "Connection to {}:{} timed out",
            profile.host, profile.port
        ))
    })?
    .map_err(|e| connect_error(profile, e))?;

    debug!("SSH handshake completed with {}:{}", profile.host, profile.port);
    Ok(handle)
}

/// Run the handshake over a `direct-tcpip` channel of a Ready session
pub async fn connect_via(
    jump: &HandleController,
    profile: &ConnectionProfile,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>, SshError> {
    info!(
        "Connecting to {}:{} through jump host",
        profile.host, profile.port
    );

    let channel = jump
        .open_direct_tcpip(&profile.host, profile.port as u32, "127.0.0.1", 0)
        .await
        .map_err(|e| {
            SshError::ConnectionFailed(format!(
                "Jump host could not reach {}:{}: {}",
                profile.host, profile.port, e
            ))
        })?;
    let stream = channel.into_stream();
    let config = Arc::new(client_config(profile));

    let handle = tokio::time::timeout(
        profile.ready_timeout(),
        client::connect_stream(config, stream, handler),
    )
    .await
    .map_err(|_| {
        SshError::Timeout(format!(
            "Connection to {}:{} via jump host timed out",
            profile.host, profile.port
        ))
    })?
    .map_err(|e| connect_error(profile, e))?;

    debug!("SSH handshake via jump host completed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_algorithms_keep_defaults() {
        let profile = ConnectionProfile::new("h", 22, "u");
        let config = client_config(&profile);
        assert_eq!(config.preferred.kex, Preferred::default().kex);
        assert_eq!(config.keepalive_max, 3);
        assert_eq!(config.keepalive_interval, Some(std::time::Duration::from_secs(15)));
    }

    #[test]
    fn test_profile_algorithms_are_filtered() {
        let mut profile = ConnectionProfile::new("h", 22, "u");
        profile.algorithms.insert(
            AlgorithmType::Cipher,
            vec!["aes256-ctr".into(), "made-up-cipher".into()],
        );
        profile.algorithms.insert(
            AlgorithmType::Kex,
            vec![
                "curve25519-sha256".into(),
                "diffie-hellman-group-exchange-sha256".into(),
            ],
        );

        let preferred = client_config(&profile).preferred;
        let ciphers: Vec<&str> = preferred.cipher.iter().map(|c| c.as_ref()).collect();
        assert_eq!(ciphers, vec!["aes256-ctr"]);

        let kex: Vec<&str> = preferred.kex.iter().map(|k| k.as_ref()).collect();
        assert_eq!(kex[0], "curve25519-sha256");
        assert!(!kex.contains(&"diffie-hellman-group-exchange-sha256"));
    }

    #[test]
    fn test_keepalive_disabled() {
        let mut profile = ConnectionProfile::new("h", 22, "u");
        profile.keepalive_interval = 0;
        assert_eq!(client_config(&profile).keepalive_interval, None);
    }
}
