//! Declarative scenarios for the differential harness.
//!
//! Locations inside a scenario file are logical (`/greet`); a
//! [`ScenarioTarget`] decides what they mean on a concrete host.
//! [`replace_definitions`] rebinds a whole spec for one target without
//! touching the original.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::expression::Closure;
use crate::host::DefinitionModule;
use crate::identity::Identity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    /// Run in-process against a fresh in-memory host.
    #[serde(default)]
    pub in_memory: Vec<Scenario>,
    /// Run by packaging and forking the real runner.
    #[serde(default)]
    pub e2e: Vec<Scenario>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub description: String,
    #[serde(default)]
    pub setup: Setup,
    pub invocation: Invocation,
    #[serde(default)]
    pub expected: Expected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Setup {
    #[serde(default)]
    pub definitions: Vec<DefinitionEntry>,
    /// Applied after `definitions`, replacing entries with the same identity.
    #[serde(default)]
    pub substitutions: Vec<DefinitionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DefinitionEntry {
    pub location: String,
    pub name: String,
    pub closure: Closure,
}

impl DefinitionEntry {
    pub fn identity(&self) -> Identity {
        Identity::new(self.location.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Invocation {
    pub location: String,
    pub name: String,
    /// Command-line tokens, decoded like `depno run` arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Invocation {
    pub fn identity(&self) -> Identity {
        Identity::new(self.location.clone(), self.name.clone())
    }
}

/// Observable outcome a scenario asserts. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Expected {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_contains: Option<String>,
}

impl Scenario {
    /// Definitions after applying substitutions, keyed by identity.
    pub fn effective_definitions(&self) -> BTreeMap<Identity, Closure> {
        self.setup
            .definitions
            .iter()
            .chain(&self.setup.substitutions)
            .map(|d| (d.identity(), d.closure.clone()))
            .collect()
    }

    /// Effective definitions grouped into one module per location.
    pub fn modules(&self) -> BTreeMap<String, DefinitionModule> {
        let mut out: BTreeMap<String, DefinitionModule> = BTreeMap::new();
        for (identity, closure) in self.effective_definitions() {
            out.entry(identity.location)
                .or_default()
                .exports
                .insert(identity.name, closure);
        }
        out
    }
}

/// Where scenario locations end up.
pub trait ScenarioTarget {
    fn rebind_location(&self, location: &str) -> String;
}

/// Locations are used as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryTarget;

impl ScenarioTarget for InMemoryTarget {
    fn rebind_location(&self, location: &str) -> String {
        location.to_string()
    }
}

/// Locations become JSON module files under `root`.
#[derive(Debug, Clone)]
pub struct DiskTarget {
    pub root: PathBuf,
}

impl DiskTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ScenarioTarget for DiskTarget {
    fn rebind_location(&self, location: &str) -> String {
        let relative: Vec<String> = location
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .map(sanitize_segment)
            .collect();
        let mut path = self.root.clone();
        for seg in &relative {
            path.push(seg);
        }
        if relative.is_empty() {
            path.push("index");
        }
        if path.extension().is_none() {
            path.set_extension("json");
        }
        path.display().to_string()
    }
}

/// Percent-encodes every byte outside `[A-Za-z0-9._-]`, so distinct
/// segments stay distinct on disk.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for byte in seg.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Fails when two different logical locations of `scenario` would share one
/// module under `target`, e.g. `/greet` and `/greet.json` on disk.
pub fn ensure_distinct_locations(scenario: &Scenario, target: &dyn ScenarioTarget) -> Result<()> {
    let entries = scenario
        .setup
        .definitions
        .iter()
        .chain(&scenario.setup.substitutions);
    let mut locations: Vec<&str> = vec![scenario.invocation.location.as_str()];
    for entry in entries {
        locations.push(&entry.location);
        locations.extend(entry.closure.references.values().map(|id| id.location.as_str()));
    }

    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for logical in locations {
        let bound = target.rebind_location(logical);
        match seen.get(&bound) {
            Some(&first) if first != logical => {
                anyhow::bail!("locations `{first}` and `{logical}` both map to `{bound}`")
            }
            Some(_) => {}
            None => {
                seen.insert(bound, logical);
            }
        }
    }
    Ok(())
}

/// Returns a copy of `spec` with every location rebound for `target`:
/// definition and substitution entries, the references inside their
/// closures, and invocation targets.
pub fn replace_definitions(spec: &ScenarioSpec, target: &dyn ScenarioTarget) -> ScenarioSpec {
    let rebind_all = |scenarios: &[Scenario]| -> Vec<Scenario> {
        scenarios
            .iter()
            .map(|s| rebind_scenario(s, target))
            .collect()
    };
    ScenarioSpec {
        in_memory: rebind_all(&spec.in_memory),
        e2e: rebind_all(&spec.e2e),
    }
}

fn rebind_scenario(scenario: &Scenario, target: &dyn ScenarioTarget) -> Scenario {
    let rebind_entries = |entries: &[DefinitionEntry]| -> Vec<DefinitionEntry> {
        entries
            .iter()
            .map(|d| DefinitionEntry {
                location: target.rebind_location(&d.location),
                name: d.name.clone(),
                closure: rebind_closure(&d.closure, target),
            })
            .collect()
    };
    Scenario {
        description: scenario.description.clone(),
        setup: Setup {
            definitions: rebind_entries(&scenario.setup.definitions),
            substitutions: rebind_entries(&scenario.setup.substitutions),
            stdin: scenario.setup.stdin.clone(),
        },
        invocation: Invocation {
            location: target.rebind_location(&scenario.invocation.location),
            name: scenario.invocation.name.clone(),
            args: scenario.invocation.args.clone(),
        },
        expected: scenario.expected.clone(),
    }
}

fn rebind_closure(closure: &Closure, target: &dyn ScenarioTarget) -> Closure {
    Closure {
        expression: closure.expression.clone(),
        references: closure
            .references
            .iter()
            .map(|(local, id)| (local.clone(), id.with_location(target.rebind_location(&id.location))))
            .collect(),
    }
}

/// Reads a scenario file (YAML, or JSON for `.json`), validating it against
/// the scenario schema first.
pub fn load_scenarios(path: &Path) -> Result<ScenarioSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario file '{}'", path.display()))?;
    let value: JsonValue = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&text).context("parse scenario json")?
    } else {
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text).context("parse scenario yaml")?;
        serde_json::to_value(&yaml).context("convert yaml value to json value")?
    };
    crate::schema::validate_scenarios(&value)
        .with_context(|| format!("invalid scenario file '{}'", path.display()))?;
    serde_json::from_value(value)
        .with_context(|| format!("failed to decode scenario file '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{identifier, string_literal};

    fn sample() -> ScenarioSpec {
        let helper = DefinitionEntry {
            location: "/lib/helper".into(),
            name: "helper".into(),
            closure: Closure::leaf(string_literal("real")),
        };
        let main = DefinitionEntry {
            location: "/app".into(),
            name: "default".into(),
            closure: Closure::leaf(identifier("helper"))
                .with_reference("helper", Identity::new("/lib/helper", "helper")),
        };
        let scenario = Scenario {
            description: "uses helper".into(),
            setup: Setup {
                definitions: vec![main, helper.clone()],
                substitutions: vec![DefinitionEntry {
                    closure: Closure::leaf(string_literal("fake")),
                    ..helper
                }],
                stdin: None,
            },
            invocation: Invocation {
                location: "/app".into(),
                name: "default".into(),
                args: vec![],
            },
            expected: Expected::default(),
        };
        ScenarioSpec {
            in_memory: vec![scenario.clone()],
            e2e: vec![scenario],
        }
    }

    #[test]
    fn substitutions_override_definitions() {
        let spec = sample();
        let defs = spec.in_memory[0].effective_definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(
            defs[&Identity::new("/lib/helper", "helper")].expression,
            string_literal("fake")
        );
    }

    #[test]
    fn in_memory_target_is_identity() {
        let spec = sample();
        assert_eq!(replace_definitions(&spec, &InMemoryTarget), spec);
    }

    #[test]
    fn disk_target_rebinds_every_location_without_mutating_input() {
        let spec = sample();
        let before = spec.clone();
        let target = DiskTarget::new("/tmp/depno-scenarios");
        let rebound = replace_definitions(&spec, &target);
        assert_eq!(spec, before);

        let s = &rebound.e2e[0];
        assert_eq!(s.invocation.location, "/tmp/depno-scenarios/app.json");
        assert_eq!(
            s.setup.definitions[0].closure.references["helper"],
            Identity::new("/tmp/depno-scenarios/lib/helper.json", "helper")
        );
        assert_eq!(
            s.setup.substitutions[0].location,
            "/tmp/depno-scenarios/lib/helper.json"
        );
        assert_eq!(s.modules().len(), 2);
    }

    #[test]
    fn disk_target_keeps_paths_inside_root() {
        let target = DiskTarget::new("/r");
        assert_eq!(target.rebind_location("../../etc/passwd"), "/r/etc/passwd.json");
        assert_eq!(target.rebind_location("/a b/c.yaml"), "/r/a%20b/c.yaml");
        assert_eq!(target.rebind_location("/"), "/r/index.json");
    }

    #[test]
    fn disk_target_keeps_distinct_segments_apart() {
        let target = DiskTarget::new("/r");
        assert_ne!(target.rebind_location("/a b"), target.rebind_location("/a_b"));
        assert_ne!(target.rebind_location("/a%20b"), target.rebind_location("/a b"));
    }

    #[test]
    fn colliding_disk_locations_are_rejected() {
        let mut spec = sample();
        let target = DiskTarget::new("/r");
        ensure_distinct_locations(&spec.e2e[0], &target).unwrap();
        assert!(ensure_distinct_locations(&spec.e2e[0], &InMemoryTarget).is_ok());

        spec.e2e[0].setup.definitions.push(DefinitionEntry {
            location: "/app.json".into(),
            name: "other".into(),
            closure: Closure::leaf(string_literal("x")),
        });
        let err = ensure_distinct_locations(&spec.e2e[0], &target).unwrap_err();
        assert!(err.to_string().contains("/r/app.json"), "{err}");
        assert!(ensure_distinct_locations(&spec.e2e[0], &InMemoryTarget).is_ok());
    }
}
