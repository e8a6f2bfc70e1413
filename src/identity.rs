use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Stable address of one exported definition: where it lives and what it is
/// called there.
///
/// Equality, ordering and hashing are structural over `(location, name)`.
/// Rejecting empty fields is the caller's job; nothing here validates them.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct Identity {
    /// Absolute path or URI of the definition module.
    pub location: String,
    /// Exported binding inside `location`.
    pub name: String,
}

impl Identity {
    pub fn new(location: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            name: name.into(),
        }
    }

    /// Same exported name, different location.
    pub fn with_location(&self, location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.location, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identity '{input}' (expected <location>#<name>)")]
pub struct ParseIdentityError {
    pub input: String,
}

impl FromStr for Identity {
    type Err = ParseIdentityError;

    /// Parses `location#name`. The split happens at the last `#` so URIs
    /// carrying fragments in their location still round-trip.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('#') {
            Some((location, name)) if !location.is_empty() && !name.is_empty() => {
                Ok(Identity::new(location, name))
            }
            _ => Err(ParseIdentityError {
                input: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn identities_compare_by_value() {
        let a = Identity::new("/a", "default");
        let b = Identity::new(String::from("/a"), String::from("default"));
        assert_eq!(a, b);
        assert_ne!(a, Identity::new("/a", "helper"));
        assert_ne!(a, Identity::new("/b", "default"));
    }

    #[test]
    fn ordering_is_location_then_name() {
        let set: BTreeSet<Identity> = [
            Identity::new("/b", "a"),
            Identity::new("/a", "z"),
            Identity::new("/a", "b"),
        ]
        .into_iter()
        .collect();
        let order: Vec<String> = set.iter().map(ToString::to_string).collect();
        assert_eq!(order, vec!["/a#b", "/a#z", "/b#a"]);
    }

    #[test]
    fn display_and_parse_agree() {
        let id: Identity = "https://defs.example/mod.json#helper".parse().unwrap();
        assert_eq!(id.location, "https://defs.example/mod.json");
        assert_eq!(id.name, "helper");
        assert_eq!(id.to_string().parse::<Identity>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_missing_parts() {
        assert!("no-separator".parse::<Identity>().is_err());
        assert!("#name".parse::<Identity>().is_err());
        assert!("/a#".parse::<Identity>().is_err());
    }
}
