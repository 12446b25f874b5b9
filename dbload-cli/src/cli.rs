use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use argh::FromArgs;
use dbload_engine::RecordObserver;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::exporter::PrometheusExporter;
use crate::output::DetailedCsvStream;
use crate::{observability, output};

/// Closed-loop load generator for databases and caches.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Validate(ValidateCommand),
    Version(VersionCommand),
}

/// run the configured experiment and export its results
#[derive(Debug, Default, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// label of the run, overrides `metrics.label`
    #[argh(option)]
    label: Option<String>,

    /// number of concurrent workers, overrides `workload.concurrency`
    #[argh(option)]
    concurrency: Option<usize>,

    /// length of the measurement phase (e.g. `5m`), overrides `workload.duration`
    #[argh(option, from_str_fn(parse_duration))]
    duration: Option<Duration>,

    /// start measuring immediately without a warmup phase
    #[argh(switch)]
    skip_warmup: bool,
}

impl RunCommand {
    fn apply(&self, config: &mut Config) {
        if let Some(label) = &self.label {
            config.metrics.label = label.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.workload.concurrency = concurrency;
        }
        if let Some(duration) = self.duration {
            config.workload.duration = duration;
        }
        if self.skip_warmup {
            config.workload.warmup = Duration::ZERO;
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|err| err.to_string())
}

/// load and validate the configuration, then print it
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "validate")]
struct ValidateCommand {}

/// print the load generator version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("dbload {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Command::Run(command) = &args.command {
        command.apply(&mut config);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("dbload-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(_) => run(config).await,
            Command::Validate(ValidateCommand {}) => validate(config),
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

fn validate(config: Config) -> Result<()> {
    let workload = config
        .workload()
        .context("invalid workload configuration")?;
    let backend = config.backend("validate")?;

    tracing::info!(
        label = workload.name(),
        backend = %backend.describe(),
        concurrency = workload.concurrency(),
        seed = workload.seed(),
        "configuration is valid"
    );
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let workload = config
        .workload()
        .context("invalid workload configuration")?;

    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let run_tag = format!("{unix_secs}-{:x}", workload.seed());
    let backend = config.backend(&run_tag)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, stopping workers");
            interrupt.cancel();
        }
    });

    let mut observers: Vec<Arc<dyn RecordObserver>> = Vec::new();
    let stop_exporter = CancellationToken::new();
    if let Some(port) = config.metrics.prometheus_port {
        let exporter = Arc::new(PrometheusExporter::new(
            config.metrics.latency_buckets.clone(),
        )?);
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics endpoint to {addr}"))?;
        tracing::info!("metrics endpoint listening on {addr}");

        let serve = Arc::clone(&exporter).serve(listener, stop_exporter.clone());
        tokio::spawn(async move {
            if let Err(err) = serve.await {
                tracing::error!("{err:#}");
            }
        });
        observers.push(exporter);
    }

    let metrics = &config.metrics;
    let stream = (metrics.export_csv && metrics.stream_detailed_csv).then(|| {
        Arc::new(DetailedCsvStream::new(
            &metrics.output_dir,
            workload.name(),
            workload.concurrency(),
        ))
    });
    if let Some(stream) = &stream {
        observers.push(stream.clone());
    }

    let result = dbload_engine::run_observed(&workload, &backend, cancel, observers).await;
    stop_exporter.cancel();
    let report = result.context("load test aborted")?;

    output::print_report(&report);
    let mut written = output::export(&config, &report)?;
    if let Some(stream) = &stream {
        written.extend(stream.finish()?);
    }
    for path in written {
        tracing::info!(path = %path.display(), "wrote results");
    }

    Ok(())
}
