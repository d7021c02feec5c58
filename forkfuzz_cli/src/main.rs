use forkfuzz_core::config::{FuzzerConfig, HandlerKind};
use forkfuzz_core::executor::{Executor, ShutdownSignal};
use forkfuzz_core::generator::{Generator, generators, random_bytes_generator};
use forkfuzz_core::suite::TestSuite;

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Number of worker processes.
    #[clap(short, long)]
    pool_size: Option<usize>,
    /// Iterations to run; -1 runs until interrupted.
    #[clap(short, long, allow_hyphen_values = true)]
    limit: Option<i64>,
    #[clap(long)]
    seed: Option<u64>,
    /// Kill a worker whose iteration runs longer than this.
    #[clap(long)]
    iteration_timeout_ms: Option<u64>,
    /// Print failures to stdout instead of appending them to the failure log.
    #[clap(long)]
    console: bool,
}

fn my_harness(data: &[u8]) -> Result<(), anyhow::Error> {
    if data.starts_with(b"BAD") {
        panic!("BAD input detected by harness!");
    }
    if data.starts_with(b"ERR") {
        anyhow::bail!("ERR input rejected by harness");
    }
    if data.starts_with(b"CRASH") {
        std::process::abort();
    }
    Ok(())
}

fn demo_suite() -> Result<TestSuite<Vec<u8>>, anyhow::Error> {
    let suite = TestSuite::builder("demo")
        .deploy(|data: &Vec<u8>| my_harness(data))
        .generator(random_bytes_generator("random", 16))
        .generator(Generator::with_rng(
            "known",
            generators::cycle(vec![
                b"INIT".to_vec(),
                b"BAD!".to_vec(),
                b"ERR?".to_vec(),
                b"CRASH".to_vec(),
            ]),
        ))
        .build()?;
    Ok(suite)
}

fn load_config(path: Option<PathBuf>) -> Result<FuzzerConfig, anyhow::Error> {
    let config = match path {
        Some(config_path) => {
            tracing::info!(path = ?config_path, "loading configuration");
            FuzzerConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                tracing::info!(path = ?default_config_path, "loading default configuration");
                FuzzerConfig::load_from_file(&default_config_path)?
            } else {
                tracing::info!("no config.toml found, using built-in defaults");
                FuzzerConfig::default()
            }
        }
    };
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forkfuzz_core=info,forkfuzz_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config_file)?;

    if let Some(pool_size) = cli.pool_size {
        config.executor.pool_size = pool_size;
    }
    if let Some(limit) = cli.limit {
        config.executor.limit = limit;
    }
    if let Some(seed) = cli.seed {
        config.executor.seed = Some(seed);
    }
    if let Some(ms) = cli.iteration_timeout_ms {
        config.executor.iteration_timeout_ms = Some(ms);
    }
    if cli.console {
        config.handler.kind = HandlerKind::Console;
    }
    tracing::debug!(?config, "effective configuration");

    if config.executor.iteration_timeout_ms.is_none() {
        tracing::info!(
            "no iteration timeout set: a hung target is never preempted, press Ctrl-C twice to abort"
        );
    }
    let shutdown = ShutdownSignal::with_interrupts()?;
    let options = config.into_options().shutdown(shutdown);
    let mut executor = Executor::new(demo_suite()?, options)?;

    let start_time = Instant::now();
    let summary = executor.run()?;
    let elapsed = start_time.elapsed();
    let exec_per_sec = if elapsed.as_secs_f32() > 0.0 {
        summary.iterations as f32 / elapsed.as_secs_f32()
    } else {
        0.0
    };

    println!("\nFuzz run finished in {elapsed:.2?}.");
    println!(
        "Iterations: {}, Faults: {}, Crashes: {}, Workers spawned: {}, Execs/sec: {:.2}",
        summary.iterations, summary.faults, summary.crashes, summary.workers_spawned, exec_per_sec
    );

    Ok(())
}
