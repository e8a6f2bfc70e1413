//! Execution hosts: where definitions come from and where I/O goes.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::expression::Closure;
use crate::identity::Identity;
use crate::value::StreamHandle;

/// Standard streams as seen by a running program.
pub trait StdStreams {
    /// Reads the remainder of `stream`. A drained stream yields `""`.
    fn read_to_string(&self, stream: StreamHandle) -> io::Result<String>;
    fn write_all(&self, stream: StreamHandle, bytes: &[u8]) -> io::Result<()>;
}

/// Backend that resolution and execution run against.
///
/// Lookups may suspend; the resolver keeps several in flight at once and
/// only ever reads through `&self`.
#[allow(async_fn_in_trait)]
pub trait Host {
    async fn lookup_definition(&self, identity: &Identity)
        -> Result<Closure, DefinitionNotFoundError>;

    fn streams(&self) -> &dyn StdStreams;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The host has no definitions at that location.
    UnknownLocation,
    /// The location exists but does not export the name.
    MissingExport { available: Vec<String> },
    Unreadable(String),
    Malformed(String),
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::UnknownLocation => f.write_str("no definitions at this location"),
            NotFoundReason::MissingExport { available } if available.is_empty() => {
                f.write_str("location exports nothing")
            }
            NotFoundReason::MissingExport { available } => {
                write!(f, "not exported (available: {})", available.join(", "))
            }
            NotFoundReason::Unreadable(msg) => write!(f, "unreadable: {msg}"),
            NotFoundReason::Malformed(msg) => write!(f, "malformed definition module: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("definition `{identity}` not found: {reason}")]
pub struct DefinitionNotFoundError {
    pub identity: Identity,
    pub reason: NotFoundReason,
}

impl DefinitionNotFoundError {
    pub fn new(identity: &Identity, reason: NotFoundReason) -> Self {
        Self {
            identity: identity.clone(),
            reason,
        }
    }
}

/// On-disk shape of one definition location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DefinitionModule {
    #[serde(default)]
    pub exports: BTreeMap<String, Closure>,
}

impl DefinitionModule {
    /// Parses module text; YAML for `.yaml`/`.yml` locations, JSON otherwise.
    pub fn parse(location: &str, text: &str) -> Result<Self, String> {
        let path = location.split(['?', '#']).next().unwrap_or(location);
        if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(text).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(text).map_err(|e| e.to_string())
        }
    }

    /// Rewrites `./` and `../` reference locations against `base`.
    pub fn anchor_relative_references(&mut self, base: &str) {
        for closure in self.exports.values_mut() {
            for identity in closure.references.values_mut() {
                if is_relative(&identity.location) {
                    identity.location = join_location(base, &identity.location);
                }
            }
        }
    }
}

pub fn is_relative(location: &str) -> bool {
    location.starts_with("./") || location.starts_with("../")
}

/// Joins a relative location onto the directory of `base`, which may be a
/// filesystem path or a URI. `.` and `..` segments are collapsed lexically.
/// A relative `base` yields a relative result.
pub fn join_location(base: &str, relative: &str) -> String {
    let (prefix, path) = split_uri_prefix(base);
    let rooted = !prefix.is_empty() || path.starts_with('/');
    let dir = match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    };

    let mut segments: Vec<&str> = Vec::new();
    for seg in dir.split('/').chain(relative.split('/')) {
        match seg {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // Above the root of a relative base; kept so the base dir applies.
                _ if !rooted => segments.push(".."),
                _ => {}
            },
            other => segments.push(other),
        }
    }
    if rooted {
        format!("{prefix}/{}", segments.join("/"))
    } else if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

/// Splits `scheme://authority` from the path part of a location.
fn split_uri_prefix(location: &str) -> (&str, &str) {
    if let Some(scheme_end) = location.find("://") {
        let after = scheme_end + 3;
        let path_start = location[after..]
            .find('/')
            .map(|i| after + i)
            .unwrap_or(location.len());
        (&location[..path_start], &location[path_start..])
    } else {
        ("", location)
    }
}
