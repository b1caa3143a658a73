//! twindex updater service binary.
//!
//! Runs the search-index update pipeline until interrupted. Collaborator
//! seams (document store, twin retriever, policy loader) are wired to
//! in-process implementations here; production deployments embed
//! [`twindex_search::service::SearchUpdateService`] with their own.
//!
//! Exit status: 0 on clean shutdown, 1 on configuration error, 2 when the
//! persistence layer is unavailable beyond the configured backoff.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;

use twindex_core::observability::{LogFormat, init_logging};
use twindex_search::config::SearchConfig;
use twindex_search::enforcement::PolicyLoader;
use twindex_search::enrichment::TwinRetriever;
use twindex_search::error::Result;
use twindex_search::observer::NoopObserver;
use twindex_search::retry::ask_with_retry;
use twindex_search::service::SearchUpdateService;
use twindex_search::store::SearchIndexStore;
use twindex_search::store::memory::InMemoryIndex;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_PERSISTENCE_UNAVAILABLE: u8 = 2;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

/// twindex search-index updater.
#[derive(Debug, Parser)]
#[command(name = "twindex-updater", about = "Run the twin search-index update pipeline")]
struct Args {
    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormatArg,

    /// Port for the Prometheus metrics endpoint (disabled when absent).
    #[arg(long)]
    metrics_port: Option<u16>,
}

/// Dev-harness retriever: no twins service attached.
struct NoTwins;

#[async_trait::async_trait]
impl TwinRetriever for NoTwins {
    async fn sudo_retrieve_twin(
        &self,
        _twin_id: &twindex_core::id::TwinId,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

/// Dev-harness policy loader: no policies service attached.
struct NoPolicies;

#[async_trait::async_trait]
impl PolicyLoader for NoPolicies {
    async fn load_policy(
        &self,
        _policy_id: &twindex_core::id::PolicyId,
    ) -> Result<Option<twindex_core::policy::Policy>> {
        Ok(None)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(match args.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Json => LogFormat::Json,
    });

    let config = match SearchConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to start runtime");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: SearchConfig) -> ExitCode {
    if let Some(port) = args.metrics_port {
        let builder = PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port));
        if let Err(error) = builder.install() {
            tracing::error!(%error, "failed to install Prometheus exporter");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    let store: Arc<dyn SearchIndexStore> = Arc::new(InMemoryIndex::new());

    // The pipeline is useless without its store; verify reachability up
    // front, within the configured ask backoff.
    let probe = ask_with_retry(&config.ask, "store_probe", || {
        let store = Arc::clone(&store);
        async move { store.bulk_write(&[]).await.map(|_| ()) }
    })
    .await;
    if let Err(error) = probe {
        tracing::error!(%error, "persistence layer unavailable");
        return ExitCode::from(EXIT_PERSISTENCE_UNAVAILABLE);
    }

    let service = SearchUpdateService::start(
        config,
        store,
        Arc::new(NoTwins),
        Arc::new(NoPolicies),
        Arc::new(NoopObserver),
    );
    tracing::info!("search update pipeline running");

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
    service.shutdown().await;
    ExitCode::SUCCESS
}
