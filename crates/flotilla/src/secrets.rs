//! Per-instance credentials, one file per secret under `secrets/`.
//!
//! Files are only ever appended to: regenerating a secret leaves the previous
//! value in place above the new one, and readers take the first line.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::debug;

pub const ADMIN_PASSWORD: &str = "admin_password";
pub const USER_PASSWORD: &str = "user_password";
pub const APP_SECRET: &str = "app_secret";

pub fn generate_secret(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .with_context(|| format!("failed to create secrets dir: {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to set secrets dir permissions: {}", path.display()))
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create secrets dir: {}", path.display()))
}

#[cfg(unix)]
fn open_private_append(path: &Path) -> anyhow::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let f = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to open secret file: {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set secret file permissions: {}", path.display()))?;
    Ok(f)
}

#[cfg(not(unix))]
fn open_private_append(path: &Path) -> anyhow::Result<fs::File> {
    fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open secret file: {}", path.display()))
}

/// Append `content` as one line to an owner-only file.
pub fn write_scoped(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }
    let mut f = open_private_append(path)?;
    writeln!(f, "{content}")
        .with_context(|| format!("failed to write secret file: {}", path.display()))?;
    Ok(())
}

pub fn read_secret(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

pub fn ensure_secret(path: &Path, length: usize) -> anyhow::Result<String> {
    if let Some(existing) = read_secret(path) {
        debug!(path = %path.display(), "secret already present");
        return Ok(existing);
    }
    let secret = generate_secret(length);
    write_scoped(path, &secret)?;
    Ok(secret)
}

/// Append every secret file of `from_dir` to its namesake in `to_dir`,
/// leaving out the names in `skip`.
pub fn copy_secrets(from_dir: &Path, to_dir: &Path, skip: &[&str]) -> anyhow::Result<usize> {
    let entries = match fs::read_dir(from_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", from_dir.display()));
        }
    };
    let mut copied = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() || skip.iter().any(|s| entry.file_name() == *s) {
            continue;
        }
        let content = fs::read_to_string(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        let target = to_dir.join(entry.file_name());
        write_scoped(&target, content.trim_end_matches('\n'))?;
        copied += 1;
    }
    Ok(copied)
}
