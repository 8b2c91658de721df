//! # DPO CLI - Pipeline Runner
//!
//! Loads one or more YAML pipeline configuration files, selects actions by
//! feed, and executes the resulting DAG with recovery support.
//!
//! ## Usage
//!
//! ```bash
//! # Run every ingest feed with two workers and a state directory
//! dpo -f 'ingest-.*' -c pipelines/ --parallelism 2 --state-path var/state
//!
//! # Restrict the run to one source partition
//! dpo -f ingest -c pipeline.yml --partition-values dt=20180101
//!
//! # Validate the configuration without touching any data
//! dpo -f ingest -c pipeline.yml --test config
//!
//! # Enable debug logging
//! RUST_LOG=debug dpo -f ingest -c pipeline.yml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dpo_core::{partition, Driver, DriverConfig, InstanceRegistry, PipelineConfig, TestMode};
use dpo_io::build_instances;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dpo")]
#[command(about = "Declarative data pipeline orchestrator")]
#[command(long_about = "
DPO executes data pipelines described in YAML configuration files: data
objects, connections and the actions moving data between them. Actions are
selected by feed, compiled into a DAG and executed in three phases with
partition-aware incremental loading and crash recovery.
")]
struct Args {
    /// Regex selecting actions whose feed matches
    #[arg(short = 'f', long = "feed-sel")]
    feed_sel: String,

    /// Application name, used as the state-store key. Defaults to the feed
    /// selector.
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Configuration files or directories, comma separated
    #[arg(short = 'c', long = "config", value_delimiter = ',', required = true)]
    config: Vec<PathBuf>,

    /// Single-column partition filter, e.g. dt=20180101,20190101
    #[arg(long = "partition-values")]
    partition_values: Option<String>,

    /// Multi-column partition filter, e.g. dt=20180101,type=person;dt=20190101,type=company
    #[arg(long = "multi-partition-values")]
    multi_partition_values: Option<String>,

    /// Scheduler worker count
    #[arg(long = "parallelism", default_value_t = 1)]
    parallelism: usize,

    /// State directory; enables recovery
    #[arg(long = "state-path")]
    state_path: Option<PathBuf>,

    /// Stop after prepare (config) or after init (dry-run)
    #[arg(long = "test", value_enum)]
    test: Option<TestModeArg>,

    /// Keep executing independent branches after a failure
    #[arg(long = "continue-on-failure")]
    continue_on_failure: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TestModeArg {
    Config,
    DryRun,
}

impl From<TestModeArg> for TestMode {
    fn from(arg: TestModeArg) -> Self {
        match arg {
            TestModeArg::Config => TestMode::Config,
            TestModeArg::DryRun => TestMode::DryRun,
        }
    }
}

/// Loads and merges every configuration file; directories contribute their
/// YAML files in name order.
fn load_config(paths: &[PathBuf]) -> Result<PipelineConfig> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = Vec::new();
            for pattern in ["*.yml", "*.yaml"] {
                let pattern = path.join(pattern);
                let pattern = pattern
                    .to_str()
                    .context("config directory path is not valid utf-8")?;
                for entry in glob::glob(pattern).context("listing config directory")? {
                    entries.push(entry.context("reading config directory entry")?);
                }
            }
            entries.sort();
            if entries.is_empty() {
                warn!(dir = %path.display(), "config directory contains no yaml files");
            }
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }
    if files.is_empty() {
        anyhow::bail!("no configuration files found");
    }
    let mut config = PipelineConfig::default();
    for file in files {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("reading config file {}", file.display()))?;
        let parsed = PipelineConfig::from_yaml(&text)
            .with_context(|| format!("parsing {}", file.display()))?;
        config = config.merge(parsed);
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let exit_code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "startup failed");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<i32> {
    let config = load_config(&args.config)?;
    let digest = config.digest();

    let mut partition_values = Vec::new();
    if let Some(arg) = &args.partition_values {
        partition_values.extend(partition::parse_single_col(arg)?);
    }
    if let Some(arg) = &args.multi_partition_values {
        partition_values.extend(partition::parse_multi(arg)?);
    }

    let app_name = args.name.clone().unwrap_or_else(|| args.feed_sel.clone());
    let global = config.global.clone();
    let mut driver_config = DriverConfig::new(app_name, args.feed_sel.clone())
        .with_partition_values(partition_values);
    driver_config.parallelism = if args.parallelism != 1 {
        args.parallelism
    } else {
        global.parallelism.unwrap_or(args.parallelism)
    };
    driver_config.continue_on_failure =
        args.continue_on_failure || global.continue_on_failure.unwrap_or(false);
    driver_config.action_timeout = global.action_timeout_sec.map(Duration::from_secs);
    driver_config.state_path = args.state_path.clone();
    driver_config.retention = global.state_retention.unwrap_or_default();
    driver_config.test_mode = args.test.map(TestMode::from);
    driver_config.config_digest = Some(digest);

    let instances = build_instances(&config, InstanceRegistry::new())?;
    let driver = Driver::new(driver_config, instances.registry, instances.actions);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight actions");
            ctrl_c_cancel.cancel();
        }
    });

    let outcome = driver.run_with_cancel(cancel).await;
    match (&outcome.error, outcome.exit_code) {
        (None, 0) => info!("pipeline finished"),
        (error, code) => warn!(exit_code = code, error = ?error, "pipeline finished with issues"),
    }
    Ok(outcome.exit_code)
}
