//! Program bundles and artifact publication.
//!
//! A bundle is a JSON document, optionally preceded by a `#!` line so a
//! published artifact can be executed directly. Publication never truncates
//! a live file: bytes go to a sibling temp file which is renamed over the
//! artifact, and the stable link is swapped the same way.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::execute;
use crate::host::Host;
use crate::identity::Identity;
use crate::program::Program;

pub const BUNDLE_FORMAT: &str = "depno-program/1";
pub const SHEBANG: &str = "#!/usr/bin/env -S depno exec-program";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleMode {
    /// Entry closure is a complete call; runs without argv.
    Invocation,
    /// Entry closure evaluates to a function applied to decoded argv.
    Executable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramBundle {
    pub format: String,
    pub mode: BundleMode,
    pub program: Program,
}

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("failed to serialize program bundle")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write artifact '{}'", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to publish '{}' -> '{}'", link.display(), target.display())]
    Publish {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BundleLoadError {
    #[error("failed to read bundle '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bundle is not valid JSON")]
    Parse(#[source] serde_json::Error),
    #[error("unsupported bundle format '{0}' (expected depno-program/1)")]
    UnsupportedFormat(String),
}

impl ProgramBundle {
    pub fn new(mode: BundleMode, program: Program) -> Self {
        Self {
            format: BUNDLE_FORMAT.to_string(),
            mode,
            program,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PackagingError> {
        let mut out = Vec::new();
        out.extend_from_slice(SHEBANG.as_bytes());
        out.push(b'\n');
        serde_json::to_writer_pretty(&mut out, self).map_err(PackagingError::Serialize)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn from_text(text: &str) -> Result<Self, BundleLoadError> {
        let body = if text.starts_with("#!") {
            text.split_once('\n').map_or("", |(_, rest)| rest)
        } else {
            text
        };
        let bundle: ProgramBundle = serde_json::from_str(body).map_err(BundleLoadError::Parse)?;
        if bundle.format != BUNDLE_FORMAT {
            return Err(BundleLoadError::UnsupportedFormat(bundle.format));
        }
        Ok(bundle)
    }
}

pub fn load_bundle(path: &Path) -> Result<ProgramBundle, BundleLoadError> {
    let text = fs::read_to_string(path).map_err(|source| BundleLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ProgramBundle::from_text(&text)
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Hidden sibling of `path` unique to this process and call.
fn temp_sibling(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(
        ".{name}.tmp-{}-{nanos}-{seq}",
        std::process::id()
    ))
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Replaces `path` with `bytes` via temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8], executable: bool) -> Result<(), PackagingError> {
    let write_err = |path: &Path, source| PackagingError::Write {
        path: path.to_path_buf(),
        source,
    };
    ensure_parent(path).map_err(|e| write_err(path, e))?;

    let tmp = temp_sibling(path);
    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        if executable {
            set_executable(&tmp)?;
        }
        Ok(())
    })();
    if let Err(source) = result {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(&tmp, source));
    }

    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        write_err(path, source)
    })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Writes `bytes` to `artifact`, then points `link` at it.
///
/// Both steps are rename-based, so a reader following `link` sees either
/// the previous complete artifact or the new one. On failure the previous
/// artifact and link are left in place.
pub fn publish_artifact(bytes: &[u8], artifact: &Path, link: &Path) -> Result<(), PackagingError> {
    write_atomic(artifact, bytes, true)?;

    let target = fs::canonicalize(artifact).map_err(|source| PackagingError::Publish {
        link: link.to_path_buf(),
        target: artifact.to_path_buf(),
        source,
    })?;
    swap_link(&target, link).map_err(|source| PackagingError::Publish {
        link: link.to_path_buf(),
        target: target.clone(),
        source,
    })?;
    info!(artifact = %target.display(), link = %link.display(), "published artifact");
    Ok(())
}

#[cfg(unix)]
fn swap_link(target: &Path, link: &Path) -> io::Result<()> {
    ensure_parent(link)?;
    let tmp = temp_sibling(link);
    std::os::unix::fs::symlink(target, &tmp)?;
    fs::rename(&tmp, link).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}

/// Without symlinks the link is a renamed-in copy of the artifact.
#[cfg(not(unix))]
fn swap_link(target: &Path, link: &Path) -> io::Result<()> {
    ensure_parent(link)?;
    let tmp = temp_sibling(link);
    fs::copy(target, &tmp)?;
    fs::rename(&tmp, link).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub artifact: PathBuf,
    pub link: PathBuf,
    pub definitions: usize,
}

/// Resolves `target` as an executable and publishes it.
pub async fn build_executable<H: Host>(
    host: &H,
    target: &Identity,
    artifact: &Path,
    link: &Path,
) -> anyhow::Result<BuildReport> {
    let program = execute::program_for_executable(host, target)
        .await
        .with_context(|| format!("failed to resolve `{target}`"))?;
    debug!(definitions = program.len(), "packaging program");
    let definitions = program.len();
    let bytes = ProgramBundle::new(BundleMode::Executable, program).to_bytes()?;
    publish_artifact(&bytes, artifact, link)?;
    Ok(BuildReport {
        artifact: artifact.to_path_buf(),
        link: link.to_path_buf(),
        definitions,
    })
}
