use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUILD_OUTPUT: &str = "target/depno";
pub const DEFAULT_LINK: &str = "depno-bin";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Settings read from the environment. CLI flags are applied on top by the
/// binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Executable that runs forked program bundles (`<runner> exec-program`).
    pub runner: PathBuf,
    pub build_output: PathBuf,
    pub link: PathBuf,
    pub http_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let runner = match env::var_os("DEPNO_RUNNER") {
            Some(p) => PathBuf::from(p),
            None => env::current_exe().context("failed to locate the current executable")?,
        };
        Ok(Self {
            runner,
            build_output: env::var_os("DEPNO_BUILD_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_OUTPUT)),
            link: env::var_os("DEPNO_LINK")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LINK)),
            http_timeout: Duration::from_secs(http_timeout_secs()?),
        })
    }
}

fn http_timeout_secs() -> Result<u64> {
    let raw = env::var("DEPNO_HTTP_TIMEOUT_SECS").ok();
    let secs = match raw {
        None => DEFAULT_HTTP_TIMEOUT_SECS,
        Some(v) => {
            let parsed: u64 = v.trim().parse().map_err(|_| {
                anyhow!("invalid DEPNO_HTTP_TIMEOUT_SECS: '{v}' (must be a positive integer)")
            })?;
            if parsed == 0 {
                return Err(anyhow!(
                    "invalid DEPNO_HTTP_TIMEOUT_SECS: '{v}' (must be a positive integer)"
                ));
            }
            parsed
        }
    };
    Ok(secs)
}
