//! Key material for guest access.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{info, warn};

use super::SshError;
use crate::fsutil::ensure_dir;

/// File name of the generated private key under the config directory.
pub const USER_PRIVATE_KEY: &str = "user";

/// A public key and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKey {
    pub content: String,
    pub path: PathBuf,
}

/// Generate `<config_dir>/user` (ed25519, no passphrase) unless it exists.
pub fn ensure_keypair(config_dir: &Path, comment: &str) -> Result<PathBuf, SshError> {
    let private = config_dir.join(USER_PRIVATE_KEY);
    let public = public_key_path(&private);
    if private.exists() && public.exists() {
        return Ok(private);
    }

    ensure_dir(config_dir).map_err(|e| SshError::io(config_dir, e))?;
    // ssh-keygen prompts before overwriting a half-present pair.
    std::fs::remove_file(&private).ok();
    std::fs::remove_file(&public).ok();

    let output = Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-q", "-N", "", "-C", comment, "-f"])
        .arg(&private)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| SshError::Spawn {
            program: "ssh-keygen".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(SshError::KeyGen(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    info!(path = %private.display(), "Generated SSH keypair");
    Ok(private)
}

pub fn public_key_path(private: &Path) -> PathBuf {
    let mut name = private.file_name().unwrap_or_default().to_os_string();
    name.push(".pub");
    private.with_file_name(name)
}

/// Read one public key file.
pub fn read_public_key(path: &Path) -> Result<PubKey, SshError> {
    let content = std::fs::read_to_string(path).map_err(|e| SshError::io(path, e))?;
    Ok(PubKey {
        content: content.trim().to_string(),
        path: path.to_path_buf(),
    })
}

/// Collect valid `*.pub` keys from `dir`, sorted by path.
///
/// Unreadable or malformed keys are skipped with a warning.
pub fn discover_public_keys(dir: &Path) -> Vec<PubKey> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "pub"))
        .collect();
    paths.sort();

    let mut keys = Vec::new();
    for path in paths {
        match read_public_key(&path) {
            Ok(key) if is_valid_public_key(&key.content) => keys.push(key),
            Ok(_) => warn!(path = %path.display(), "Skipping malformed public key"),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable public key"),
        }
    }
    keys
}

/// Structural check of `<algorithm> <base64 blob> [comment]`.
///
/// The blob starts with a big-endian u32 length and the algorithm name,
/// which must match the leading token.
pub fn is_valid_public_key(content: &str) -> bool {
    let mut fields = content.split_whitespace();
    let (Some(algo), Some(blob)) = (fields.next(), fields.next()) else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(blob) else {
        return false;
    };
    if decoded.len() < 4 {
        return false;
    }
    let len = u32::from_be_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]) as usize;
    let Some(end) = 4usize.checked_add(len) else {
        return false;
    };
    match decoded.get(4..end) {
        Some(format) => format == algo.as_bytes(),
        None => false,
    }
}
