//! evalcache - pooled evaluator processes for external functions.

mod cli;

use anyhow::{Result, anyhow};
use clap::Parser;
use evalcache::logging::{self, LogConfig};
use evalcache::{EvalOptions, MultiCache, PoolConfig, ProcessPool};
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{Level, debug};

use cli::{CallArgs, Cli, Commands};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker(args) => {
            init_logging(&cli, LogConfig::for_worker());
            evalcache::worker::run_worker_main(args.to_options())
        }
        Commands::Call(args) => {
            init_logging(&cli, LogConfig::for_cli());
            cmd_call(args)
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Configure logging from a preset, the global flags and the environment.
fn init_logging(cli: &Cli, preset: LogConfig) {
    let mut config = preset;
    if cli.quiet {
        config = config
            .with_level(Level::ERROR)
            .with_filter("error".to_string());
    } else {
        match cli.verbose {
            0 => {}
            1 => config = config.with_level(Level::INFO),
            2 => config = config.with_level(Level::DEBUG),
            _ => config = config.with_level(Level::TRACE).with_thread_ids(true),
        }
        if cli.verbose > 0 {
            // Flags win over EVALCACHE_LOG / RUST_LOG
            let filter = config.level.to_string().to_lowercase();
            config = config.with_filter(filter);
        }
    }
    let mut config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init(config);
}

/// Evaluate a function through a single pool and print one line per call.
fn cmd_call(args: &CallArgs) -> Result<()> {
    let options = args.options()?;
    let cache = MultiCache::with_config(PoolConfig::from(&options));
    let key = args.cache_key();
    let pool = cache.get_or_create(&key);
    let threads = args.threads.max(1);

    debug!(key = %key, threads, repeat = args.repeat, "Evaluating");

    let outputs: Vec<Result<Vec<String>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| scope.spawn(|| run_calls(&pool, args, &options)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("evaluation thread panicked")))
            })
            .collect()
    });

    let mut first_error = None;
    for output in outputs {
        match output {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    if args.stats {
        let stats = pool.stats();
        eprintln!(
            "{}: live={} idle={} busy={} limit={} spawned={} retired={} evaluations={} failures={} retries={} peak_busy={}",
            key.if_supports_color(Stderr, |text| text.cyan()),
            stats.live,
            stats.idle,
            stats.busy,
            stats.limit,
            stats.spawned,
            stats.retired,
            stats.evaluations,
            stats.failures,
            stats.retries,
            stats.peak_busy,
        );
    }

    cache.tear_down();
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn run_calls(pool: &ProcessPool, args: &CallArgs, options: &EvalOptions) -> Result<Vec<String>> {
    let call = args.build_call(options.clone());
    let mut lines = Vec::with_capacity(args.repeat);
    for _ in 0..args.repeat {
        pool.evaluate(&call)?;
        let values: Vec<String> = call
            .result_values()
            .into_iter()
            .map(|v| v.map_or_else(|| "?".to_string(), |v| v.to_string()))
            .collect();
        lines.push(values.join(" "));
    }
    Ok(lines)
}
