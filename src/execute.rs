//! Entry-point synthesis and the two execution modes: in-process against a
//! [`Host`], and forked into a separate runner process.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::args::{self, ArgumentDecodeError};
use crate::eval::{self, EvalError};
use crate::expression::{call, identifier, Closure, Expression};
use crate::fs_host::ProcessStreams;
use crate::host::Host;
use crate::identity::Identity;
use crate::package::{self, BundleMode, PackagingError, ProgramBundle};
use crate::program::Program;
use crate::resolve::{resolve_closure, UnresolvedReferenceError};
use crate::value::Value;

/// Local name the synthesized entry point binds the target identity to.
pub const ENTRY_FUNCTION: &str = "main";

/// Exit code of the runner when argv cannot be decoded.
pub const ARGUMENT_ERROR_EXIT: i32 = 2;

/// Export used when a caller names only a location.
pub const DEFAULT_EXPORT: &str = "default";

/// Identity to run for a user-supplied location. Locations starting with
/// `.` are taken relative to `cwd`; absolute paths and URIs are kept.
pub fn run_target(location: &str, name: Option<&str>, cwd: &Path) -> Identity {
    let location = if location.starts_with('.') {
        let base = fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        crate::host::join_location(&format!("{}/", base.display()), location)
    } else {
        location.to_string()
    };
    Identity::new(location, name.unwrap_or(DEFAULT_EXPORT))
}

/// `main(args...)` with `main` bound to `target`.
pub fn entry_closure(target: &Identity, args: &[Value]) -> Closure {
    let arguments = args.iter().map(Expression::from_argument).collect();
    Closure::leaf(call(identifier(ENTRY_FUNCTION), arguments))
        .with_reference(ENTRY_FUNCTION, target.clone())
}

/// Bare `main`, applied to argv by the runner.
pub fn executable_entry(target: &Identity) -> Closure {
    Closure::leaf(identifier(ENTRY_FUNCTION)).with_reference(ENTRY_FUNCTION, target.clone())
}

pub async fn program_for_invocation<H: Host>(
    host: &H,
    target: &Identity,
    args: &[Value],
) -> Result<Program, UnresolvedReferenceError> {
    resolve_closure(host, entry_closure(target, args)).await
}

pub async fn program_for_executable<H: Host>(
    host: &H,
    target: &Identity,
) -> Result<Program, UnresolvedReferenceError> {
    resolve_closure(host, executable_entry(target)).await
}

/// Evaluates the program's entry with I/O routed through `host`.
pub fn execute_in_process<H: Host>(program: &Program, host: &H) -> Result<Value, EvalError> {
    eval::evaluate_program(program, host.streams())
}

/// Evaluates an executable program's entry and applies it to `args`.
pub fn execute_with_arguments<H: Host>(
    program: &Program,
    host: &H,
    args: Vec<Value>,
) -> Result<Value, EvalError> {
    eval::invoke_program(program, host.streams(), args)
}

/// Whether a forked child shares the parent's standard streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildStdio {
    #[default]
    Inherit,
    /// stdin, stdout and stderr are pipes owned by the returned `Child`.
    Piped,
}

impl ChildStdio {
    fn stdio(self) -> Stdio {
        match self {
            ChildStdio::Inherit => Stdio::inherit(),
            ChildStdio::Piped => Stdio::piped(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Executable understanding `exec-program`.
    pub runner: PathBuf,
    pub cwd: Option<PathBuf>,
    pub stdio: ChildStdio,
    /// Where the child writes its result value as JSON.
    pub result_path: Option<PathBuf>,
}

impl ForkOptions {
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.into(),
            cwd: None,
            stdio: ChildStdio::Inherit,
            result_path: None,
        }
    }

    /// Resolves relative `result_path` and `runner` paths against
    /// `caller_dir`, since the child starts in `cwd`. A bare runner name is
    /// left for `PATH` lookup.
    pub fn anchored_at(mut self, caller_dir: &Path) -> Self {
        self.result_path = self.result_path.map(|path| {
            if path.is_relative() {
                caller_dir.join(path)
            } else {
                path
            }
        });
        if self.runner.is_relative() && self.runner.components().count() > 1 {
            self.runner = caller_dir.join(&self.runner);
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("failed to stage program bundle")]
    Bundle(#[from] PackagingError),
    #[error("failed to spawn runner '{}'", runner.display())]
    Spawn {
        runner: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serializes `program` and starts a runner process for it.
///
/// The bundle is staged in the temp directory and removed by the child once
/// loaded. The child's exit status is the only outcome reported back.
pub fn fork_program(program: &Program, options: &ForkOptions) -> Result<Child, ForkError> {
    fork_program_staged_in(program, options, &std::env::temp_dir())
}

fn fork_program_staged_in(
    program: &Program,
    options: &ForkOptions,
    staging_dir: &Path,
) -> Result<Child, ForkError> {
    let bytes = ProgramBundle::new(BundleMode::Invocation, program.clone()).to_bytes()?;
    let staged = staging_dir.join(format!(
        "depno-{}-{}.program",
        std::process::id(),
        unique_suffix()
    ));
    package::write_atomic(&staged, &bytes, false)?;
    spawn_runner(&staged, true, &[] as &[String], options).map_err(|err| {
        // No child will consume it.
        if let Err(rm) = fs::remove_file(&staged) {
            warn!(bundle = %staged.display(), error = %rm, "could not remove staged bundle");
        }
        err
    })
}

/// Starts a runner for an already published artifact, passing `args` as
/// encoded argv tokens.
pub fn fork_artifact<S: AsRef<str>>(
    artifact: &Path,
    args: &[S],
    options: &ForkOptions,
) -> Result<Child, ForkError> {
    spawn_runner(artifact, false, args, options)
}

fn spawn_runner<S: AsRef<str>>(
    bundle: &Path,
    consume: bool,
    args: &[S],
    options: &ForkOptions,
) -> Result<Child, ForkError> {
    let mut cmd = Command::new(&options.runner);
    cmd.arg("exec-program").arg(bundle);
    if consume {
        cmd.arg("--consume");
    }
    if let Some(result) = &options.result_path {
        cmd.arg("--result").arg(result);
    }
    cmd.arg("--");
    cmd.args(args.iter().map(AsRef::as_ref));
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(options.stdio.stdio())
        .stdout(options.stdio.stdio())
        .stderr(options.stdio.stdio());

    debug!(runner = %options.runner.display(), bundle = %bundle.display(), "forking runner");
    cmd.spawn().map_err(|source| ForkError::Spawn {
        runner: options.runner.clone(),
        source,
    })
}

fn unique_suffix() -> String {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos}-{}", SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Exit code to forward for a finished child. Signals map to `128 + n`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Inputs of the `exec-program` runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub bundle: PathBuf,
    /// Delete the bundle once it has been loaded.
    pub consume: bool,
    pub result_path: Option<PathBuf>,
    pub args: Vec<String>,
}

/// Runs a program bundle in this process against the real streams and
/// returns the exit code to terminate with.
///
/// Evaluation errors are reported on stderr with exit code 1; undecodable
/// argv exits with [`ARGUMENT_ERROR_EXIT`]. Failing to load the bundle is
/// returned as an error.
pub fn run_bundle(options: &RunnerOptions) -> Result<i32> {
    let bundle = package::load_bundle(&options.bundle)
        .with_context(|| format!("failed to load program bundle '{}'", options.bundle.display()))?;
    if options.consume {
        if let Err(err) = fs::remove_file(&options.bundle) {
            warn!(bundle = %options.bundle.display(), error = %err, "could not remove staged bundle");
        }
    }
    bundle
        .program
        .validate()
        .context("program bundle is inconsistent")?;

    let streams = ProcessStreams;
    let outcome = match bundle.mode {
        BundleMode::Invocation => {
            if !options.args.is_empty() {
                warn!(count = options.args.len(), "ignoring argv for an invocation bundle");
            }
            eval::evaluate_program(&bundle.program, &streams)
        }
        BundleMode::Executable => match args::decode_arguments(&options.args) {
            Ok(values) => eval::invoke_program(&bundle.program, &streams, values),
            Err(err) => {
                report_argument_error(&err);
                return Ok(ARGUMENT_ERROR_EXIT);
            }
        },
    };

    match outcome {
        Ok(value) => {
            if let Some(path) = &options.result_path {
                let json = serde_json::to_vec(&value.to_json()).context("failed to encode result")?;
                package::write_atomic(path, &json, false)
                    .with_context(|| format!("failed to write result '{}'", path.display()))?;
            }
            Ok(0)
        }
        Err(err) => {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "error: {err}");
            Ok(1)
        }
    }
}

fn report_argument_error(err: &ArgumentDecodeError) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "error: {err}");
}
