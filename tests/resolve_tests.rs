use depno::execute::{self, program_for_executable, program_for_invocation};
use depno::expression::{call, function, identifier, literal, string_literal, Closure};
use depno::fs_host::FsHost;
use depno::host::NotFoundReason;
use depno::identity::Identity;
use depno::memory_host::InMemoryHost;
use depno::resolve::resolve_identity;
use depno::value::{StreamHandle, Value};
use futures::executor::block_on;
use serde_json::json;

mod helpers;
use helpers::fixture_path;

fn fixture_location(rel: &str) -> String {
    fixture_path(rel).display().to_string()
}

#[test]
fn fs_host_follows_relative_references_across_formats() {
    let host = FsHost::new(fixture_path(""));
    let target = Identity::new(fixture_location("defs/greet.json"), "default");

    let program = block_on(resolve_identity(&host, &target)).unwrap();
    let ids: Vec<Identity> = program.identities().cloned().collect();
    assert_eq!(
        ids,
        vec![
            target.clone(),
            Identity::new(fixture_location("defs/lib/greeting.yaml"), "greeting"),
        ]
    );
    program.validate().unwrap();
}

#[test]
fn fs_host_resolves_relative_root_locations_against_base_dir() {
    let host = FsHost::new(fixture_path(""));
    let target = Identity::new("defs/greet.json", "default");

    let program = block_on(resolve_identity(&host, &target)).unwrap();
    let ids: Vec<Identity> = program.identities().cloned().collect();
    assert_eq!(
        ids,
        vec![
            target.clone(),
            Identity::new("defs/lib/greeting.yaml", "greeting"),
        ]
    );
}

#[test]
fn fs_host_reports_missing_location_with_referrer() {
    let host = FsHost::new(fixture_path(""));
    let target = Identity::new(fixture_location("defs/greet.json"), "broken");

    let err = block_on(resolve_identity(&host, &target)).unwrap_err();
    assert_eq!(err.referrer.as_ref(), Some(&target));
    assert_eq!(err.missing.name, "gone");
    assert_eq!(err.source.reason, NotFoundReason::UnknownLocation);
}

#[test]
fn fs_host_reports_missing_export_with_alternatives() {
    let host = FsHost::new(fixture_path(""));
    let target = Identity::new(fixture_location("defs/greet.json"), "nope");

    let err = block_on(resolve_identity(&host, &target)).unwrap_err();
    assert!(err.referrer.is_none());
    match &err.source.reason {
        NotFoundReason::MissingExport { available } => {
            assert!(available.contains(&"default".to_string()));
            assert!(available.contains(&"echo".to_string()));
        }
        other => panic!("unexpected reason: {other:?}"),
    }
}

#[test]
fn invocation_program_runs_in_process_against_memory_host() {
    let greet = Identity::new("/greet", "default");
    let helper = Identity::new("/lib", "suffix");
    let host = InMemoryHost::with_stdin("")
        .with_definition(
            greet.clone(),
            Closure::leaf(function(
                ["out", "name"],
                call(
                    identifier("write"),
                    vec![
                        identifier("out"),
                        call(
                            identifier("concat"),
                            vec![identifier("name"), identifier("suffix")],
                        ),
                    ],
                ),
            ))
            .with_reference("suffix", helper.clone()),
        )
        .with_definition(helper, Closure::leaf(string_literal("!")));

    let args = vec![Value::Stream(StreamHandle::Stdout), Value::from("hey")];
    let program = block_on(program_for_invocation(&host, &greet, &args)).unwrap();
    assert_eq!(program.len(), 2);

    let value = execute::execute_in_process(&program, &host).unwrap();
    assert_eq!(value, Value::Null);
    assert_eq!(host.stdout(), "hey!");
}

#[test]
fn executable_program_takes_arguments_at_run_time() {
    let double = Identity::new("/math", "double");
    let host = InMemoryHost::new().with_definition(
        double.clone(),
        Closure::leaf(function(
            ["n"],
            call(identifier("add"), vec![identifier("n"), identifier("n")]),
        )),
    );

    let program = block_on(program_for_executable(&host, &double)).unwrap();
    let value =
        execute::execute_with_arguments(&program, &host, vec![Value::from_json(json!(21))]).unwrap();
    assert_eq!(value, Value::from(42));

    // Same program, different argv.
    let value =
        execute::execute_with_arguments(&program, &host, vec![Value::from_json(json!(2))]).unwrap();
    assert_eq!(value, Value::from(4));
}

#[test]
fn shared_dependencies_appear_once() {
    let shared = Identity::new("/shared", "value");
    let left = Identity::new("/left", "value");
    let right = Identity::new("/right", "value");
    let root = Identity::new("/root", "default");
    let host = InMemoryHost::new()
        .with_definition(
            root.clone(),
            Closure::leaf(call(
                identifier("add"),
                vec![identifier("l"), identifier("r")],
            ))
            .with_reference("l", left.clone())
            .with_reference("r", right.clone()),
        )
        .with_definition(
            left.clone(),
            Closure::leaf(identifier("s")).with_reference("s", shared.clone()),
        )
        .with_definition(
            right.clone(),
            Closure::leaf(identifier("s")).with_reference("s", shared.clone()),
        )
        .with_definition(shared.clone(), Closure::leaf(literal(json!(5))));

    let program = block_on(resolve_identity(&host, &root)).unwrap();
    let ids: Vec<&Identity> = program.identities().collect();
    assert_eq!(ids, vec![&root, &left, &right, &shared]);
    assert_eq!(
        execute::execute_in_process(&program, &host).unwrap(),
        Value::from(10)
    );
}
