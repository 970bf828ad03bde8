//! Element service - the public read/write API over one store.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::diff::DiffEngine;
use crate::error::WaymarkResult;
use crate::resolver::{ElementDetail, ElementLookup, HistoryPage, ReferenceResolver};
use crate::store::SqliteElementStore;
use crate::traits::ElementStore;
use crate::types::{DiffBatch, DiffResult, ElementRef, ElementVersion, SequenceId};

/// Wires a store, a resolver and a diff engine from one configuration.
#[derive(Clone)]
pub struct ElementService {
    config: EngineConfig,
    store: Arc<dyn ElementStore>,
    resolver: ReferenceResolver,
    engine: DiffEngine,
}

impl ElementService {
    /// Create a service over an existing store.
    pub fn new(config: EngineConfig, store: Arc<dyn ElementStore>) -> WaymarkResult<Self> {
        config.validate()?;
        let resolver = ReferenceResolver::new(Arc::clone(&store), config.history_page_size);
        let engine = DiffEngine::new(
            Arc::clone(&store),
            config.diff.clone(),
            config.limits.clone(),
        );
        Ok(Self {
            config,
            store,
            resolver,
            engine,
        })
    }

    /// Open the SQLite store named by the configuration.
    pub fn open(config: EngineConfig) -> WaymarkResult<Self> {
        let store = SqliteElementStore::open(&config)?;
        tracing::info!(
            database = ?config.database_path,
            "Opened element store"
        );
        Self::new(config, Arc::new(store))
    }

    /// In-memory service with default settings (useful for testing).
    pub fn in_memory() -> WaymarkResult<Self> {
        Self::open(EngineConfig::builder().in_memory().build())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ElementStore> {
        &self.store
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Highest committed sequence id.
    pub async fn current_sequence_id(&self) -> WaymarkResult<SequenceId> {
        self.store.current_sequence_id().await
    }

    /// Rows for plain and versioned refs as of `at` (latest if `None`).
    pub async fn resolve(
        &self,
        lookups: &[ElementLookup],
        at: Option<SequenceId>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.resolver.resolve(lookups, at).await
    }

    /// One newest-first page of an element's history.
    pub async fn history(
        &self,
        element: ElementRef,
        page: usize,
        at: Option<SequenceId>,
    ) -> WaymarkResult<HistoryPage> {
        self.resolver.history(element, page, at).await
    }

    /// Ways and relations listing `element` as of `at`.
    pub async fn parents_of(
        &self,
        element: ElementRef,
        at: Option<SequenceId>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        self.resolver.parents_of(element, at).await
    }

    /// An element with its members and parents.
    pub async fn element_detail(
        &self,
        lookup: ElementLookup,
        at: Option<SequenceId>,
    ) -> WaymarkResult<ElementDetail> {
        self.resolver.element_detail(lookup, at).await
    }

    /// Validate and atomically commit a batch.
    pub async fn submit_diff(&self, batch: &DiffBatch) -> WaymarkResult<DiffResult> {
        self.engine.submit(batch).await
    }
}
