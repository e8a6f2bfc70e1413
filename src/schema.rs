use anyhow::{anyhow, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use schemars::schema_for;
use serde_json::Value as JsonValue;

use crate::scenario::ScenarioSpec;

/// Schema generated from the scenario structs, so validation never drifts
/// from what the harness actually decodes.
static SCENARIO_SCHEMA_GENERATED: Lazy<JsonValue> = Lazy::new(|| {
    let schema = schema_for!(ScenarioSpec);
    serde_json::to_value(&schema).expect("schemars schema must serialize to JSON")
});

static SCENARIO_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&SCENARIO_SCHEMA_GENERATED)
        .expect("failed to compile generated scenario JSON schema")
});

/// Maximum number of schema errors listed in one report.
const MAX_REPORTED_ERRORS: usize = 10;

/// Validates a parsed scenario document.
pub fn validate_scenarios(value: &JsonValue) -> Result<()> {
    let compiled = &*SCENARIO_SCHEMA;

    // `validate()` borrows `value` through the error iterator; collect the
    // messages before returning.
    let msgs: Vec<String> = match compiled.validate(value) {
        Ok(()) => return Ok(()),
        Err(errors) => {
            let mut msgs = Vec::new();
            for (i, e) in errors.enumerate() {
                if i >= MAX_REPORTED_ERRORS {
                    msgs.push("... (more schema errors omitted)".to_string());
                    break;
                }
                let instance_path = e.instance_path.to_string();
                let path = if instance_path.is_empty() {
                    "/".to_string()
                } else {
                    instance_path
                };
                msgs.push(format!("at {path}: {e}"));
            }
            msgs
        }
    };

    Err(anyhow!("scenario schema validation failed:\n{}", msgs.join("\n")))
}

/// The generated schema, printed by `depno schema`.
pub fn scenario_schema() -> &'static JsonValue {
    &SCENARIO_SCHEMA_GENERATED
}
