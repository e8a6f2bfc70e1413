//! Differential scenario harness.
//!
//! The in-memory bucket runs in-process against a fresh [`InMemoryHost`]
//! per scenario. The e2e bucket writes the scenario's definitions to disk,
//! packages the invocation target as an executable, and forks the real
//! runner with piped stdio. A scenario listed in both buckets must also
//! produce the same value and stdout on both hosts.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::executor::block_on;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::args;
use crate::execute::{self, ChildStdio, ForkOptions, ARGUMENT_ERROR_EXIT};
use crate::fs_host::FsHost;
use crate::memory_host::InMemoryHost;
use crate::package;
use crate::scenario::{
    ensure_distinct_locations, replace_definitions, DiskTarget, Expected, Scenario, ScenarioSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    InMemory,
    E2e,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::InMemory => "in_memory",
            Bucket::E2e => "e2e",
        }
    }
}

/// What one run of a scenario produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioOutcome {
    pub value: Option<JsonValue>,
    pub stdout: String,
    pub exit_code: i32,
    pub error: Option<String>,
}

impl ScenarioOutcome {
    fn failed(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub bucket: Bucket,
    pub description: String,
    pub outcome: ScenarioOutcome,
    pub failures: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HarnessReport {
    pub scenarios: Vec<ScenarioReport>,
}

impl HarnessReport {
    pub fn passed(&self) -> usize {
        self.scenarios.iter().filter(|r| r.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.scenarios.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    pub fn print_summary(&self) {
        for r in &self.scenarios {
            let status = if r.passed() { "PASS" } else { "FAIL" };
            println!("{status} [{}] {}", r.bucket.as_str(), r.description);
            for f in &r.failures {
                println!("    {f}");
            }
        }
        println!(
            "{} passed, {} failed, {} total",
            self.passed(),
            self.failed(),
            self.scenarios.len()
        );
    }
}

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Executable used to run e2e artifacts (`<runner> exec-program`).
    pub runner: PathBuf,
    /// Scratch directory for e2e modules, artifacts and results.
    pub scratch: PathBuf,
    /// Only run scenarios whose description contains this text.
    pub filter: Option<String>,
}

/// Runs every selected scenario of both buckets. Individual failures are
/// recorded in the report; only harness-level I/O problems abort.
pub fn run_scenarios(spec: &ScenarioSpec, options: &HarnessOptions) -> Result<HarnessReport> {
    let selected = |s: &&Scenario| {
        options
            .filter
            .as_deref()
            .map_or(true, |f| s.description.contains(f))
    };

    let mut report = HarnessReport::default();
    let mut in_memory_outcomes: BTreeMap<String, ScenarioOutcome> = BTreeMap::new();

    for scenario in spec.in_memory.iter().filter(selected) {
        let outcome = run_in_memory(scenario);
        let failures = check_expected(&scenario.expected, &outcome);
        log_result(Bucket::InMemory, scenario, &failures);
        in_memory_outcomes.insert(scenario.description.clone(), outcome.clone());
        report.scenarios.push(ScenarioReport {
            bucket: Bucket::InMemory,
            description: scenario.description.clone(),
            outcome,
            failures,
        });
    }

    fs::create_dir_all(&options.scratch).with_context(|| {
        format!(
            "failed to create scratch directory '{}'",
            options.scratch.display()
        )
    })?;
    // The runner starts inside each scenario directory, so paths handed to
    // it must not be relative.
    let scratch = fs::canonicalize(&options.scratch).with_context(|| {
        format!(
            "failed to resolve scratch directory '{}'",
            options.scratch.display()
        )
    })?;
    for (idx, scenario) in spec.e2e.iter().enumerate() {
        if !selected(&scenario) {
            continue;
        }
        let dir = scratch
            .join(format!("{idx:03}-{}", slug(&scenario.description)));
        let outcome = match run_e2e(scenario, &dir, &options.runner) {
            Ok(outcome) => outcome,
            Err(err) => ScenarioOutcome::failed(1, format!("{err:#}")),
        };
        let mut failures = check_expected(&scenario.expected, &outcome);
        if let Some(reference) = in_memory_outcomes.get(&scenario.description) {
            failures.extend(compare_hosts(reference, &outcome));
        }
        log_result(Bucket::E2e, scenario, &failures);
        report.scenarios.push(ScenarioReport {
            bucket: Bucket::E2e,
            description: scenario.description.clone(),
            outcome,
            failures,
        });
    }

    Ok(report)
}

fn log_result(bucket: Bucket, scenario: &Scenario, failures: &[String]) {
    if failures.is_empty() {
        info!(bucket = bucket.as_str(), scenario = %scenario.description, "scenario passed");
    } else {
        warn!(bucket = bucket.as_str(), scenario = %scenario.description, failures = failures.len(), "scenario failed");
    }
}

/// Runs one scenario in-process against a fresh in-memory host.
pub fn run_in_memory(scenario: &Scenario) -> ScenarioOutcome {
    let mut host = InMemoryHost::with_stdin(scenario.setup.stdin.clone().unwrap_or_default());
    for (identity, closure) in scenario.effective_definitions() {
        host.define(identity, closure);
    }

    let values = match args::decode_arguments(&scenario.invocation.args) {
        Ok(values) => values,
        Err(err) => return ScenarioOutcome::failed(ARGUMENT_ERROR_EXIT, err.to_string()),
    };
    let target = scenario.invocation.identity();
    let program = match block_on(execute::program_for_invocation(&host, &target, &values)) {
        Ok(program) => program,
        Err(err) => return ScenarioOutcome::failed(1, err.to_string()),
    };

    match execute::execute_in_process(&program, &host) {
        Ok(value) => ScenarioOutcome {
            value: Some(value.to_json()),
            stdout: host.stdout(),
            exit_code: 0,
            error: None,
        },
        Err(err) => ScenarioOutcome {
            value: None,
            stdout: host.stdout(),
            exit_code: 1,
            error: Some(err.to_string()),
        },
    }
}

/// Packages the scenario under `dir` and runs it through `runner`.
pub fn run_e2e(scenario: &Scenario, dir: &Path, runner: &Path) -> Result<ScenarioOutcome> {
    // Same order as the in-memory bucket and `depno run`: argv first.
    if let Err(err) = args::decode_arguments(&scenario.invocation.args) {
        return Ok(ScenarioOutcome::failed(ARGUMENT_ERROR_EXIT, err.to_string()));
    }

    let defs_dir = dir.join("defs");
    let target = DiskTarget::new(&defs_dir);
    ensure_distinct_locations(scenario, &target)?;
    let single = ScenarioSpec {
        in_memory: Vec::new(),
        e2e: vec![scenario.clone()],
    };
    let rebound = replace_definitions(&single, &target);
    let scenario = &rebound.e2e[0];

    for (location, module) in scenario.modules() {
        write_module(Path::new(&location), &module)?;
    }

    let host = FsHost::new(&defs_dir);
    let artifact = dir.join("out").join("program");
    let link = dir.join("program-bin");
    if let Err(err) = block_on(package::build_executable(
        &host,
        &scenario.invocation.identity(),
        &artifact,
        &link,
    )) {
        return Ok(ScenarioOutcome::failed(1, format!("{err:#}")));
    }

    let result_path = dir.join("result.json");
    let _ = fs::remove_file(&result_path);
    let options = ForkOptions {
        runner: runner.to_path_buf(),
        cwd: Some(dir.to_path_buf()),
        stdio: ChildStdio::Piped,
        result_path: Some(result_path.clone()),
    };
    let mut child = execute::fork_artifact(&link, &scenario.invocation.args, &options)?;
    if let Some(mut stdin) = child.stdin.take() {
        let input = scenario.setup.stdin.clone().unwrap_or_default();
        // A program that never reads stdin may exit before this completes.
        let _ = stdin.write_all(input.as_bytes());
    }
    let output = child
        .wait_with_output()
        .context("failed to wait for scenario runner")?;

    let exit_code = execute::exit_code_of(output.status);
    let value = if exit_code == 0 {
        let raw = fs::read(&result_path)
            .with_context(|| format!("runner did not write '{}'", result_path.display()))?;
        Some(serde_json::from_slice::<JsonValue>(&raw).context("runner wrote an invalid result")?)
    } else {
        None
    };
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    Ok(ScenarioOutcome {
        value,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        exit_code,
        error: (exit_code != 0).then_some(stderr),
    })
}

fn write_module(path: &Path, module: &crate::host::DefinitionModule) -> Result<()> {
    let is_yaml = path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml");
    let bytes = if is_yaml {
        serde_yaml::to_string(module)
            .context("failed to encode module as yaml")?
            .into_bytes()
    } else {
        serde_json::to_vec_pretty(module).context("failed to encode module as json")?
    };
    package::write_atomic(path, &bytes, false)?;
    Ok(())
}

/// Compares an outcome against the scenario's expectations.
///
/// Without an explicit `exit_code`, success (0) is expected unless
/// `error_contains` is set, in which case any non-zero code is accepted.
pub fn check_expected(expected: &Expected, outcome: &ScenarioOutcome) -> Vec<String> {
    let mut failures = Vec::new();

    match (expected.exit_code, &expected.error_contains) {
        (Some(code), _) if code != outcome.exit_code => failures.push(format!(
            "exit code: expected {code}, got {}",
            outcome.exit_code
        )),
        (None, None) if outcome.exit_code != 0 => failures.push(format!(
            "exit code: expected 0, got {} ({})",
            outcome.exit_code,
            outcome.error.as_deref().unwrap_or("no error output")
        )),
        (None, Some(_)) if outcome.exit_code == 0 => {
            failures.push("expected a failure, but the scenario succeeded".to_string())
        }
        _ => {}
    }

    if let Some(needle) = &expected.error_contains {
        let error = outcome.error.as_deref().unwrap_or("");
        if !error.contains(needle.as_str()) {
            failures.push(format!("error: expected to contain {needle:?}, got {error:?}"));
        }
    }
    if let Some(value) = &expected.value {
        if outcome.value.as_ref() != Some(value) {
            failures.push(format!(
                "value: expected {value}, got {}",
                outcome
                    .value
                    .as_ref()
                    .map_or_else(|| "nothing".to_string(), JsonValue::to_string)
            ));
        }
    }
    if let Some(stdout) = &expected.stdout {
        if &outcome.stdout != stdout {
            failures.push(format!(
                "stdout: expected {stdout:?}, got {:?}",
                outcome.stdout
            ));
        }
    }
    failures
}

/// Differences in observable behaviour between the two hosts.
pub fn compare_hosts(in_memory: &ScenarioOutcome, e2e: &ScenarioOutcome) -> Vec<String> {
    let mut diffs = Vec::new();
    if in_memory.value != e2e.value {
        diffs.push(format!(
            "hosts disagree on value: in-memory {:?}, e2e {:?}",
            in_memory.value, e2e.value
        ));
    }
    if in_memory.stdout != e2e.stdout {
        diffs.push(format!(
            "hosts disagree on stdout: in-memory {:?}, e2e {:?}",
            in_memory.stdout, e2e.stdout
        ));
    }
    if in_memory.exit_code != e2e.exit_code {
        diffs.push(format!(
            "hosts disagree on exit code: in-memory {}, e2e {}",
            in_memory.exit_code, e2e.exit_code
        ));
    }
    diffs
}

fn slug(label: &str) -> String {
    let s: String = label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let s = s.trim_matches('-');
    s.chars().take(40).collect()
}
