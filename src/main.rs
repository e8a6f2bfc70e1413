use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::executor::block_on;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depno::config::Settings;
use depno::execute::{self, ForkOptions, RunnerOptions, ARGUMENT_ERROR_EXIT};
use depno::fs_host::FsHost;
use depno::harness::{self, HarnessOptions};
use depno::{args, graph, package, plan, registry_server, resolve, scenario, schema};

/// depno: run or ship a single exported definition as a self-contained
/// program.
#[derive(Parser, Debug)]
#[command(name = "depno")]
#[command(about = "Resolve, package and run single exported definitions", long_about = None)]
struct Cli {
    /// Enable debug logging (overrides DEPNO_LOG)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a definition and run it in a forked runner
    Run {
        /// Module path or URI; a leading `.` is relative to --cwd
        location: String,

        /// Exported name inside the module
        name: String,

        /// Directory relative locations and the child process start from
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Print the resolved program instead of running it
        #[arg(long)]
        print_program: bool,

        /// Write the returned value as JSON to this file
        #[arg(long)]
        result: Option<PathBuf>,

        /// Runner executable (defaults to DEPNO_RUNNER, then this binary)
        #[arg(long)]
        runner: Option<PathBuf>,

        /// Arguments: `{stdin}`, `{stdout}` or JSON values
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Package a definition as an executable artifact and publish it
    Build {
        location: String,
        /// Exported name (defaults to `default`)
        name: Option<String>,

        /// Artifact path (defaults to DEPNO_BUILD_OUTPUT, then target/depno)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Stable link pointed at the artifact (defaults to DEPNO_LINK, then depno-bin)
        #[arg(long)]
        link: Option<PathBuf>,

        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Run a scenario file against the in-memory and real hosts
    Test {
        /// Scenario file (YAML, or JSON for .json)
        scenarios: PathBuf,

        /// Only run scenarios whose description contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Scratch directory for end-to-end runs
        #[arg(long)]
        scratch: Option<PathBuf>,

        #[arg(long)]
        runner: Option<PathBuf>,

        /// Print the report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Export the dependency graph of a definition
    Graph {
        location: String,
        /// Exported name (defaults to `default`)
        name: Option<String>,

        #[arg(long, value_enum, default_value_t = GraphFormat::Json)]
        format: GraphFormat,

        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Serve a directory of definition modules over HTTP
    Serve {
        root: PathBuf,

        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },

    /// Print the JSON Schema for scenario files
    Schema,

    /// Run a program bundle (used by forked execution and published artifacts)
    #[command(hide = true)]
    ExecProgram {
        bundle: PathBuf,

        /// Delete the bundle after loading it
        #[arg(long)]
        consume: bool,

        #[arg(long)]
        result: Option<PathBuf>,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GraphFormat {
    Json,
    Dot,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("DEPNO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    // Logs go to stderr so program stdout stays byte-exact.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match real_main(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            print_error_chain(&err);
            std::process::exit(1);
        }
    }
}

fn real_main(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            location,
            name,
            cwd,
            print_program,
            result,
            runner,
            args,
        } => {
            let settings = Settings::from_env()?;
            let base = base_dir(cwd)?;
            let target = execute::run_target(&location, Some(name.as_str()), &base);

            let values = match args::decode_arguments(&args) {
                Ok(values) => values,
                Err(err) => {
                    eprintln!("Error: {err}");
                    return Ok(ARGUMENT_ERROR_EXIT);
                }
            };

            let host = FsHost::new(&base).with_http_timeout(settings.http_timeout);
            let program = block_on(execute::program_for_invocation(&host, &target, &values))
                .with_context(|| format!("failed to resolve `{target}`"))?;

            if print_program {
                plan::print_program(&target.to_string(), &program);
                return Ok(0);
            }

            let caller_dir =
                std::env::current_dir().context("failed to read the current directory")?;
            let options = ForkOptions {
                runner: runner.unwrap_or(settings.runner),
                cwd: Some(base),
                stdio: execute::ChildStdio::Inherit,
                result_path: result,
            }
            .anchored_at(&caller_dir);
            let mut child = execute::fork_program(&program, &options)
                .with_context(|| format!("failed to start `{target}`"))?;
            let status = child.wait().context("failed to wait for runner")?;
            Ok(execute::exit_code_of(status))
        }

        Command::Build {
            location,
            name,
            output,
            link,
            cwd,
        } => {
            let settings = Settings::from_env()?;
            let base = base_dir(cwd)?;
            let target = execute::run_target(&location, name.as_deref(), &base);
            let artifact = output.unwrap_or(settings.build_output);
            let link = link.unwrap_or(settings.link);

            let host = FsHost::new(&base).with_http_timeout(settings.http_timeout);
            let report = block_on(package::build_executable(&host, &target, &artifact, &link))?;
            println!(
                "Built {} ({} definitions); {} -> {}",
                target,
                report.definitions,
                report.link.display(),
                report.artifact.display()
            );
            Ok(0)
        }

        Command::Test {
            scenarios,
            filter,
            scratch,
            runner,
            json,
        } => {
            let settings = Settings::from_env()?;
            let spec = scenario::load_scenarios(&scenarios)?;
            let scratch = scratch.unwrap_or_else(|| {
                std::env::temp_dir().join(format!("depno-scenarios-{}", std::process::id()))
            });
            let options = HarnessOptions {
                runner: runner.unwrap_or(settings.runner),
                scratch,
                filter,
            };
            info!(
                in_memory = spec.in_memory.len(),
                e2e = spec.e2e.len(),
                "running scenarios"
            );
            let report = harness::run_scenarios(&spec, &options)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serialize report json")?
                );
            } else {
                report.print_summary();
            }
            Ok(if report.all_passed() { 0 } else { 1 })
        }

        Command::Graph {
            location,
            name,
            format,
            cwd,
        } => {
            let settings = Settings::from_env()?;
            let base = base_dir(cwd)?;
            let target = execute::run_target(&location, name.as_deref(), &base);
            let host = FsHost::new(&base).with_http_timeout(settings.http_timeout);
            let program = block_on(resolve::resolve_identity(&host, &target))
                .with_context(|| format!("failed to resolve `{target}`"))?;
            match format {
                GraphFormat::Json => println!("{}", graph::export_graph_json(&program)?),
                GraphFormat::Dot => print!("{}", graph::export_graph_dot(&program)),
            }
            Ok(0)
        }

        Command::Serve { root, addr } => {
            registry_server::run_server(&addr, &root)?;
            Ok(0)
        }

        Command::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(schema::scenario_schema())
                    .context("serialize scenario schema")?
            );
            Ok(0)
        }

        Command::ExecProgram {
            bundle,
            consume,
            result,
            args,
        } => execute::run_bundle(&RunnerOptions {
            bundle,
            consume,
            result_path: result,
            args,
        }),
    }
}

fn base_dir(cwd: Option<PathBuf>) -> Result<PathBuf> {
    match cwd {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("failed to read the current directory"),
    }
}
