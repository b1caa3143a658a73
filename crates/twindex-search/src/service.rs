//! Wiring of the whole update pipeline.
//!
//! [`SearchUpdateService`] owns the caches, the enrichment facade, the
//! enforcement flow, the bulk writer, and the updater registry, and ties
//! their lifecycles together: start everything from one configuration,
//! dispatch notifications while running, drain everything at shutdown.

use std::sync::Arc;

use crate::bulk::{BulkWriter, BulkWriterConfig};
use crate::config::SearchConfig;
use crate::enforcement::{EnforcementFlow, PolicyLoader};
use crate::enrichment::{CachingEnrichmentFacade, TwinRetriever};
use crate::error::Result;
use crate::metrics::SearchMetrics;
use crate::notification::ChangeNotification;
use crate::observer::SearchUpdateObserver;
use crate::registry::UpdaterRegistry;
use crate::store::SearchIndexStore;
use crate::updater::UpdaterConfig;

/// The assembled update pipeline.
pub struct SearchUpdateService {
    config: SearchConfig,
    registry: Arc<UpdaterRegistry>,
    writer: BulkWriter,
}

impl SearchUpdateService {
    /// Starts the pipeline over the given collaborator seams.
    #[must_use]
    pub fn start(
        config: SearchConfig,
        store: Arc<dyn SearchIndexStore>,
        retriever: Arc<dyn TwinRetriever>,
        policy_loader: Arc<dyn PolicyLoader>,
        observer: Arc<dyn SearchUpdateObserver>,
    ) -> Self {
        let metrics = SearchMetrics::new();

        let facade = Arc::new(CachingEnrichmentFacade::new(
            retriever,
            config.thing_cache.clone(),
            config.ask.clone(),
            metrics.clone(),
        ));
        let flow = Arc::new(EnforcementFlow::new(
            facade,
            policy_loader,
            config.policy_cache.clone(),
            config.ask.clone(),
            config.max_array_size,
            observer,
            metrics.clone(),
        ));
        let writer = BulkWriter::spawn(
            Arc::clone(&store),
            BulkWriterConfig::from(&config),
            metrics.clone(),
        );
        let registry = Arc::new(UpdaterRegistry::new(
            flow,
            store,
            writer.submitter(),
            UpdaterConfig::from(&config),
            metrics,
        ));

        Self {
            config,
            registry,
            writer,
        }
    }

    /// Routes a change notification into the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error when the twin's updater cannot accept messages.
    pub async fn dispatch(&self, notification: ChangeNotification) -> Result<()> {
        self.registry.dispatch(notification).await
    }

    /// Returns the updater registry (manual updates, namespace purge).
    #[must_use]
    pub fn registry(&self) -> &Arc<UpdaterRegistry> {
        &self.registry
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Shuts the pipeline down cooperatively: updaters first (draining
    /// their in-flight writes), then the writer partitions.
    pub async fn shutdown(self) {
        let drain = self.config.drain_timeout;
        self.registry.shutdown(drain).await;
        self.writer.shutdown(drain).await;
        tracing::info!("search update pipeline stopped");
    }
}
