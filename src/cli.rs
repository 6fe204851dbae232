//! Command-line interface definitions using clap.

use clap::builder::TypedValueParser;
use clap::{Args, Parser, Subcommand};
use evalcache::logging::LogFormat;
use evalcache::worker::worker_main::WorkerOptions;
use evalcache::{EvalOptions, EvalType, EvalValue, ExternalCall};
use std::path::PathBuf;
use std::str::FromStr;

/// Pooled out-of-process evaluation of external functions.
#[derive(Parser, Debug)]
#[command(name = "evalcache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log errors only.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, value_parser = LogFormat::from_str, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the reference evaluator on stdin/stdout.
    Worker(WorkerArgs),

    /// Evaluate an external function through a process pool.
    Call(CallArgs),
}

/// Arguments for the worker command.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Marker file for `crash_once`: crash if it is missing, then create it.
    #[arg(long)]
    pub crash_marker: Option<PathBuf>,

    /// Library artifacts to load (passed by the dynamic evaluator mode).
    #[arg(trailing_var_arg = true)]
    pub libraries: Vec<String>,
}

impl WorkerArgs {
    pub fn to_options(&self) -> WorkerOptions {
        WorkerOptions {
            libraries: self.libraries.clone(),
            crash_marker: self.crash_marker.clone(),
        }
    }
}

/// Arguments for the call command.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Function to evaluate.
    #[arg(short, long)]
    pub function: String,

    /// Cache key; defaults to the library directory and artifacts.
    #[arg(long)]
    pub key: Option<String>,

    /// Directory library artifacts are resolved against.
    #[arg(long, default_value = "", value_parser = clap::builder::OsStringValueParser::new().map(PathBuf::from))]
    pub library_dir: PathBuf,

    /// Library artifact (repeatable). The first one is the evaluator executable
    /// unless --dynamic is given.
    #[arg(short, long = "library", allow_hyphen_values = true)]
    pub libraries: Vec<String>,

    /// Argument as TYPE:VALUE, e.g. real:1.5, int:3, string:abc, real[]:1,2,3.
    #[arg(short, long = "arg", value_parser = EvalValue::parse_typed)]
    pub args: Vec<EvalValue>,

    /// External object handle sent with every call.
    #[arg(long)]
    pub external_object: Option<String>,

    /// Result type (repeatable, one per result).
    #[arg(short, long = "returns", value_parser = EvalType::from_str)]
    pub returns: Vec<EvalType>,

    /// Evaluations per thread.
    #[arg(long, default_value_t = 1)]
    pub repeat: usize,

    /// Concurrent callers sharing the pool.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Maximum live evaluator processes.
    #[arg(long)]
    pub process_limit: Option<usize>,

    /// Launch the generic evaluator with the libraries as arguments.
    #[arg(long)]
    pub dynamic: bool,

    /// Generic evaluator program for --dynamic.
    #[arg(long)]
    pub evaluator: Option<PathBuf>,

    /// Argument passed to the generic evaluator before the libraries (repeatable).
    #[arg(long = "evaluator-arg", allow_hyphen_values = true)]
    pub evaluator_args: Vec<String>,

    /// JSON options file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Response timeout in milliseconds (0 disables).
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Print pool statistics to stderr when done.
    #[arg(long)]
    pub stats: bool,
}

impl CallArgs {
    /// Options from the config file and environment, overridden by flags.
    pub fn options(&self) -> evalcache::Result<EvalOptions> {
        let mut options = match &self.config {
            Some(path) => EvalOptions::from_file(path)?,
            None => EvalOptions::default(),
        }
        .with_env_overrides();

        if let Some(limit) = self.process_limit {
            options.process_limit = limit;
        }
        if self.dynamic {
            options.dynamic_evaluator = true;
        }
        if let Some(program) = &self.evaluator {
            options.evaluator_program = Some(program.clone());
        }
        if !self.evaluator_args.is_empty() {
            options.evaluator_args = self.evaluator_args.clone();
        }
        if let Some(ms) = self.timeout_ms {
            options.timeout_ms = (ms > 0).then_some(ms);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn cache_key(&self) -> String {
        self.key.clone().unwrap_or_else(|| {
            format!("{}:{}", self.library_dir.display(), self.libraries.join(","))
        })
    }

    /// Build the call site for one caller.
    pub fn build_call(&self, options: EvalOptions) -> ExternalCall {
        let mut call = ExternalCall::new(&self.function)
            .with_options(options)
            .with_library(&self.library_dir, self.libraries.clone())
            .with_args(self.args.iter().cloned())
            .with_results(self.returns.iter().cloned());
        if let Some(handle) = &self.external_object {
            call = call.with_external_object(handle);
        }
        call
    }
}
