use sqldrift_core::artifact::DirectoryArtifactSink;
use sqldrift_core::config::SqlDriftConfig;
use sqldrift_core::corpus::load_seed_statements;
use sqldrift_core::mutator::SqlMutator;
use sqldrift_core::scheduler::Scheduler;
use sqldrift_core::schema::Schema;

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_FILE: &str = "sqldrift.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// JSON schema file, overrides `corpus.schema-path`.
    #[clap(short, long)]
    schema: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    rng_seed: Option<u64>,
    #[clap(long)]
    artifact_dir: Option<PathBuf>,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    info!(path = ?config_path, "Loading configuration");
    let mut config = SqlDriftConfig::load_from_file(&config_path)?;

    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if let Some(seed) = cli.rng_seed {
        config.fuzzer.rng_seed = Some(seed);
    }
    if let Some(dir) = cli.artifact_dir {
        config.corpus.artifact_dir = dir;
    }
    if let Some(schema) = cli.schema {
        config.corpus.schema_path = Some(schema);
    }

    let schema_path = config.corpus.schema_path.as_ref().ok_or_else(|| {
        anyhow::anyhow!("No schema given: pass --schema or set corpus.schema-path")
    })?;
    let schema = Schema::load_from_file(schema_path)?;
    info!(path = ?schema_path, tables = schema.len(), "Loaded schema");

    let mut seeds = config.corpus.seeds.clone();
    seeds.extend(load_seed_statements(&config.corpus.initial_seed_paths)?);
    if seeds.is_empty() {
        anyhow::bail!("No seed statements: set corpus.seeds or corpus.initial-seed-paths");
    }

    let rng_seed = config.fuzzer.rng_seed.unwrap_or_else(rand::random);
    info!(rng_seed, "Seeding mutation RNG");

    let executor = config.executor.build_executor()?;
    let artifacts = DirectoryArtifactSink::new(&config.corpus.artifact_dir)?;

    let mut scheduler = Scheduler::new(
        config.fuzzer.scheduler_config(),
        Box::new(SqlMutator::new(schema)),
        Box::new(executor),
        ChaCha8Rng::seed_from_u64(rng_seed),
    )
    .with_oracle(Box::new(config.executor.oracle()))
    .with_artifact_sink(Box::new(artifacts));
    for seed in seeds {
        scheduler.add_seed(seed);
    }

    let stats = scheduler.run()?;
    info!(
        iterations = stats.iterations,
        executions = stats.executions,
        queries = stats.queries_executed,
        bugs = stats.bugs_found,
        crashes = stats.crashes_found,
        syntax_errors = stats.syntax_errors,
        "Done"
    );
    Ok(())
}
