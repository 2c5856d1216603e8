//! CLI command definitions for solver-lab.
//!
//! `run` builds an experiment from a corpus directory and a solver binary and
//! executes the selected pipeline steps on the local machine.

use crate::environment::LocalEnvironment;
use crate::experiment::{
    Experiment, ExperimentConfig, Run, BUILD_STEP, DEFAULT_FETCH_STEP, PARSE_AGAIN_STEP,
    REPORT_STEP, START_STEP,
};
use crate::parser::PatternParser;
use crate::report::CsvReport;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Attributes written to the CSV report when `--attributes` is not given.
const DEFAULT_ATTRIBUTES: &str = "benchmark,solve_time,status";

/// Report file name inside the evaluation directory.
const DEFAULT_REPORT: &str = "report.csv";

/// Parser used when no `--parser` file is given.
const DEFAULT_PARSER: &str = include_str!("../../parsers/pumpkin.yaml");

/// The default pipeline, in execution order.
const DEFAULT_STEPS: [(&str, &str); 5] = [
    (BUILD_STEP, "create run directories and command descriptors"),
    (START_STEP, "execute every run and wait for completion"),
    (DEFAULT_FETCH_STEP, "copy finished runs to the evaluation directory"),
    (PARSE_AGAIN_STEP, "extract attributes from the fetched logs"),
    (REPORT_STEP, "write the CSV report"),
];

/// Benchmark runner for constraint and SAT solvers.
#[derive(Parser)]
#[command(name = "solver-lab")]
#[command(about = "Run solver benchmarks and report on their logs")]
#[command(version)]
#[command(
    long_about = "solver-lab runs a solver on every instance of a corpus, collects the logs, extracts attributes with regex patterns and writes a CSV report.\n\nExample usage:\n  solver-lab run --experiment-dir ./data/exp --corpus ./instances --solver ./pumpkin\n  solver-lab run --experiment-dir ./data/exp --corpus ./instances --solver ./pumpkin parse-again report"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run pipeline steps of an experiment.
    Run(RunArgs),

    /// List the steps of the default pipeline.
    Steps,
}

/// Arguments for `solver-lab run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory in which run directories are generated.
    #[arg(short = 'e', long)]
    pub experiment_dir: Option<PathBuf>,

    /// Directory receiving fetched logs and reports (default: <experiment-dir>-eval).
    #[arg(long)]
    pub eval_dir: Option<PathBuf>,

    /// Directory (or single file) with the problem instances.
    #[arg(short = 'c', long)]
    pub corpus: PathBuf,

    /// Only use corpus files with this extension (e.g. fzn, cnf).
    #[arg(long)]
    pub extension: Option<String>,

    /// Solver binary, invoked as `<solver> <instance> -t <seconds>`.
    #[arg(short = 's', long)]
    pub solver: String,

    /// Wall-clock limit per run, in seconds.
    #[arg(short = 't', long)]
    pub time_limit: Option<u64>,

    /// Seconds a run may overrun its limit before it is killed.
    #[arg(long)]
    pub kill_margin: Option<u64>,

    /// Number of runs executed in parallel.
    #[arg(short = 'j', long)]
    pub processes: Option<usize>,

    /// Parser YAML files, applied in order (default: built-in pumpkin parser).
    #[arg(short = 'p', long = "parser")]
    pub parsers: Vec<PathBuf>,

    /// Comma-separated attributes written to the report.
    #[arg(short = 'a', long, default_value = DEFAULT_ATTRIBUTES)]
    pub attributes: String,

    /// Report file name inside the evaluation directory.
    #[arg(short = 'o', long, default_value = DEFAULT_REPORT)]
    pub report: String,

    /// Experiment configuration file (YAML).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Steps to run, by name or 1-based index. Runs all steps when omitted.
    pub steps: Vec<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_experiment_command(args).await?,
        Commands::Steps => print_steps(),
    }
    Ok(())
}

fn print_steps() {
    for (index, (name, description)) in DEFAULT_STEPS.iter().enumerate() {
        println!("{}. {:<12} {}", index + 1, name, description);
    }
}

async fn run_experiment_command(args: RunArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    let time_limit = config.time_limit();

    let environment = LocalEnvironment::new(config.processes)?
        .with_default_time_limit(time_limit)
        .with_kill_margin(config.kill_margin());
    let mut experiment = Experiment::new(config, environment)?;

    if args.parsers.is_empty() {
        experiment.add_parser(PatternParser::from_yaml_str(DEFAULT_PARSER)?);
    } else {
        for path in &args.parsers {
            experiment.add_parser_file(path)?;
        }
    }

    let inputs = discover_corpus(&args.corpus, args.extension.as_deref())?;
    if inputs.is_empty() {
        warn!("No instances found in {}", args.corpus.display());
    }
    for input in &inputs {
        experiment.add_run(solver_run(&args.solver, input, time_limit))?;
    }
    info!(
        "Loaded {} runs from {}",
        experiment.runs().len(),
        args.corpus.display()
    );

    let attributes = parse_attributes(&args.attributes);
    register_default_steps(&mut experiment, attributes, &args.report)?;

    experiment.run_steps(&args.steps).await?;
    Ok(())
}

/// Builds the configuration: file or environment first, then CLI flags.
fn resolve_config(args: &RunArgs) -> anyhow::Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_yaml_file(path)?,
        None => ExperimentConfig::from_env()?,
    };

    if let Some(dir) = &args.experiment_dir {
        config.path = dir.clone();
    }
    if let Some(dir) = &args.eval_dir {
        config = config.with_eval_dir(dir.clone());
    }
    if let Some(processes) = args.processes {
        config = config.with_processes(processes);
    }
    if let Some(secs) = args.time_limit {
        config = config.with_time_limit(Duration::from_secs(secs));
    }
    if let Some(secs) = args.kill_margin {
        config = config.with_kill_margin(Duration::from_secs(secs));
    }

    config.validate()?;
    Ok(config)
}

/// Registers build, start, fetch, parse-again and a CSV report.
pub fn register_default_steps(
    experiment: &mut Experiment,
    attributes: Vec<String>,
    outfile: &str,
) -> anyhow::Result<()> {
    experiment.add_build_step()?;
    experiment.add_start_step()?;
    experiment.add_fetcher(Some(DEFAULT_FETCH_STEP))?;
    experiment.add_parse_again_step()?;
    experiment.add_report(CsvReport::new(attributes), outfile)?;
    Ok(())
}

/// One run per instance, identified by the file stem.
fn solver_run(solver: &str, input: &Path, time_limit: Duration) -> Run {
    let id = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Run::solver(id.clone(), solver, input, time_limit).with_property("benchmark", id)
}

/// Lists the corpus files, sorted by path.
fn discover_corpus(root: &Path, extension: Option<&str>) -> anyhow::Result<Vec<PathBuf>> {
    let extension = extension.map(|e| e.trim_start_matches('.'));
    let mut inputs = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if hidden {
            continue;
        }
        if let Some(ext) = extension {
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
        }
        inputs.push(path.to_path_buf());
    }

    Ok(inputs)
}

fn parse_attributes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|attr| !attr.is_empty())
        .map(str::to_string)
        .collect()
}
