//! Private key loading
//!
//! Resolves the key named by the profile (or the first default key),
//! prompts for a passphrase when the key is encrypted, and falls back to
//! `ssh-keygen` to re-encode material russh cannot parse directly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use russh::keys::PrivateKey;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::config::ConnectionProfile;
use super::error::AuthError;
use crate::secrets::{CredentialCache, PromptProvider, PromptRequest, DEFAULT_TTL};

/// Where the private key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Path(PathBuf),
    /// PEM/OpenSSH text carried in the profile
    Inline(String),
}

impl KeySource {
    fn label(&self) -> String {
        match self {
            KeySource::Path(p) => p.display().to_string(),
            KeySource::Inline(_) => "inline key".to_string(),
        }
    }

    fn cache_key(&self) -> String {
        match self {
            KeySource::Path(p) => format!("key:{}", p.display()),
            KeySource::Inline(text) => {
                use sha2::{Digest, Sha256};
                let digest = Sha256::digest(text.as_bytes());
                format!("key:inline:{:x}", digest)
            }
        }
    }
}

/// Default identity files, in preference order
pub fn default_key_paths() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_ed25519"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_rsa"),
    ]
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if path == "~" {
            return home;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_key_source(profile: &ConnectionProfile) -> Option<KeySource> {
    match profile.private_key.as_deref().map(str::trim) {
        Some(text) if text.starts_with("-----BEGIN") => Some(KeySource::Inline(text.to_string())),
        Some(path) if !path.is_empty() => Some(KeySource::Path(expand_tilde(path))),
        _ => default_key_paths()
            .into_iter()
            .find(|p| p.exists())
            .map(KeySource::Path),
    }
}

/// Load and decrypt a private key, prompting for the passphrase if needed
pub async fn load_private_key(
    source: &KeySource,
    cache: &CredentialCache,
    prompts: &dyn PromptProvider,
) -> Result<PrivateKey, AuthError> {
    let text = match source {
        KeySource::Path(path) => Zeroizing::new(
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| AuthError::Key(format!("{}: {}", path.display(), e)))?,
        ),
        KeySource::Inline(text) => Zeroizing::new(text.clone()),
    };

    match russh::keys::decode_secret_key(&text, None) {
        Ok(key) => {
            debug!("Loaded unencrypted key {}", source.label());
            return Ok(key);
        }
        Err(russh::keys::Error::KeyIsEncrypted) => {}
        Err(_) if text.contains("ENCRYPTED") => {}
        Err(e) => {
            debug!("Direct parse of {} failed ({}), converting", source.label(), e);
            let converted = convert_with_ssh_keygen(&text, "").await?;
            return russh::keys::decode_secret_key(&converted, None)
                .map_err(|e| AuthError::Key(e.to_string()));
        }
    }

    let cache_key = source.cache_key();
    let passphrase = cache
        .get_or_prompt(
            &cache_key,
            PromptRequest::secret(format!("Passphrase for {}", source.label())),
            prompts,
            DEFAULT_TTL,
        )
        .await
        .ok_or(AuthError::PassphraseRequired)?;

    let key = match russh::keys::decode_secret_key(&text, Some(&passphrase)) {
        Ok(key) => Ok(key),
        Err(e) => {
            debug!("Decrypting {} failed ({}), converting", source.label(), e);
            match convert_with_ssh_keygen(&text, &passphrase).await {
                Ok(converted) => russh::keys::decode_secret_key(&converted, None)
                    .map_err(|e| AuthError::Key(e.to_string())),
                Err(e) => Err(e),
            }
        }
    };

    if key.is_err() {
        // A wrong passphrase must not be served from the cache again
        cache.forget(&cache_key);
    } else {
        info!("Decrypted private key {}", source.label());
    }
    key
}

/// Environment variable the askpass shim reads the passphrase from
const ASKPASS_SECRET_ENV: &str = "OXIDETERM_ASKPASS_SECRET";

#[cfg(unix)]
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$OXIDETERM_ASKPASS_SECRET\"\n";

/// Temporary file, removed on drop
struct TempFile {
    path: PathBuf,
}

impl TempFile {
    async fn create(prefix: &str, contents: &str, mode: u32) -> Result<Self, AuthError> {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        let guard = Self { path };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options
            .open(&guard.path)
            .await
            .map_err(|e| AuthError::KeyConversion(e.to_string()))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| AuthError::KeyConversion(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| AuthError::KeyConversion(e.to_string()))?;
        Ok(guard)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temporary file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// `ssh-keygen -p` invocation that rewrites `key` as unencrypted PEM. The
/// old passphrase is answered by `askpass` from the child's environment
/// and never appears in its arguments.
fn keygen_command(
    key: &Path,
    askpass: Option<&Path>,
    passphrase: &str,
) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ssh-keygen");
    cmd.args(["-p", "-N", "", "-m", "PEM", "-f"])
        .arg(key)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match askpass {
        Some(askpass) => {
            cmd.env(ASKPASS_SECRET_ENV, passphrase)
                .env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force");
            // OpenSSH before 8.4 only consults askpass with a display set
            if std::env::var_os("DISPLAY").is_none() {
                cmd.env("DISPLAY", ":0");
            }
        }
        // No shell for an askpass shim here
        None => {
            cmd.arg("-P").arg(passphrase);
        }
    }
    cmd
}

/// Re-encode key material as unencrypted PEM with `ssh-keygen`
async fn convert_with_ssh_keygen(text: &str, passphrase: &str) -> Result<Zeroizing<String>, AuthError> {
    let tmp = TempFile::create("oxideterm-key", text, 0o600).await?;
    #[cfg(unix)]
    let askpass = Some(TempFile::create("oxideterm-askpass", ASKPASS_SCRIPT, 0o700).await?);
    #[cfg(not(unix))]
    let askpass: Option<TempFile> = None;

    let output = keygen_command(tmp.path(), askpass.as_ref().map(TempFile::path), passphrase)
        .output()
        .await
        .map_err(|e| AuthError::KeyConversion(format!("ssh-keygen: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AuthError::KeyConversion(stderr.trim().to_string()));
    }

    let converted = tokio::fs::read_to_string(tmp.path())
        .await
        .map_err(|e| AuthError::KeyConversion(e.to_string()))?;
    Ok(Zeroizing::new(converted))
}
