use std::path::PathBuf;

use depno::harness::{self, Bucket, HarnessOptions};
use depno::scenario::{self, load_scenarios};

mod helpers;
use helpers::{fixture_path, unique_test_temp_dir};

fn options(prefix: &str, filter: Option<&str>) -> HarnessOptions {
    HarnessOptions {
        runner: PathBuf::from(env!("CARGO_BIN_EXE_depno")),
        scratch: unique_test_temp_dir(prefix),
        filter: filter.map(str::to_string),
    }
}

#[test]
fn fixture_scenarios_pass_on_both_hosts() {
    let spec = load_scenarios(&fixture_path("scenarios.yaml")).unwrap();
    let report = harness::run_scenarios(&spec, &options("diff-all", None)).unwrap();

    let failures: Vec<String> = report
        .scenarios
        .iter()
        .filter(|r| !r.passed())
        .map(|r| format!("[{}] {}: {:?}", r.bucket.as_str(), r.description, r.failures))
        .collect();
    assert!(failures.is_empty(), "failing scenarios:\n{}", failures.join("\n"));
    assert_eq!(report.scenarios.len(), spec.in_memory.len() + spec.e2e.len());
}

#[test]
fn filter_selects_scenarios_in_both_buckets() {
    let spec = load_scenarios(&fixture_path("scenarios.yaml")).unwrap();
    let report =
        harness::run_scenarios(&spec, &options("diff-filter", Some("echoes stdin"))).unwrap();

    let buckets: Vec<Bucket> = report.scenarios.iter().map(|r| r.bucket).collect();
    assert_eq!(buckets, vec![Bucket::InMemory, Bucket::E2e]);
    assert!(report.all_passed());
}

#[test]
fn a_wrong_expectation_is_reported_not_raised() {
    let mut spec = load_scenarios(&fixture_path("scenarios.yaml")).unwrap();
    spec.e2e.clear();
    spec.in_memory.truncate(1);
    spec.in_memory[0].expected.stdout = Some("goodbye".to_string());

    let report = harness::run_scenarios(&spec, &options("diff-wrong", None)).unwrap();
    assert_eq!(report.failed(), 1);
    assert!(report.scenarios[0].failures[0].contains("goodbye"));
}

#[test]
fn disk_rebinding_keeps_the_logical_spec_untouched() {
    let spec = load_scenarios(&fixture_path("scenarios.yaml")).unwrap();
    let root = unique_test_temp_dir("diff-rebind");
    let rebound = scenario::replace_definitions(&spec, &scenario::DiskTarget::new(&root));

    assert_eq!(spec.in_memory[0].invocation.location, "/greet");
    let location = &rebound.in_memory[0].invocation.location;
    assert!(location.starts_with(&root.display().to_string()));
    assert!(location.ends_with("greet.json"));
}
