//! Engine Lifecycle
//!
//! [`Engine::init`] opens storage, runs migrations, builds the vector store
//! and external clients, and wires every subsystem over the shared handles.
//! [`Engine::close`] stops the worker, flushes the vector index and WAL, and
//! releases everything. One engine per process; subsystem accessors hand out
//! cheap clones or references.

use std::sync::Arc;

use crate::assemble::ContextAssembler;
use crate::beliefs::BeliefStore;
use crate::commitments::{CommitmentTracker, GoalTracker};
use crate::config::EngineConfig;
use crate::context::{ContextDetector, ContextManager};
use crate::external::{EmbeddingClient, LlmClient};
use crate::graph::EntityGraph;
use crate::ingest::Ingestor;
use crate::resolver::EntityResolver;
use crate::retrieval::RetrievalEngine;
use crate::storage::{Result, Storage};
use crate::style::StyleEngine;
use crate::vector::{open_vector_store, VectorStore};
use crate::worker::{BackgroundWorker, WorkerConfig};

/// The assembled engine
pub struct Engine {
    config: EngineConfig,
    storage: Arc<Storage>,
    vectors: Arc<dyn VectorStore>,
    llm: Option<Arc<LlmClient>>,
    graph: EntityGraph,
    resolver: EntityResolver,
    beliefs: BeliefStore,
    commitments: CommitmentTracker,
    goals: GoalTracker,
    style: StyleEngine,
    contexts: ContextManager,
    detector: ContextDetector,
    retrieval: RetrievalEngine,
    assembler: ContextAssembler,
    ingestor: Ingestor,
    worker: Arc<BackgroundWorker>,
}

impl Engine {
    /// Open the engine. A corrupt or unreadable database file fails here;
    /// a failed persistent vector backend degrades to the in-memory
    /// fallback.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config.db_path)?);
        if !storage.migration_report().is_clean() {
            tracing::warn!(
                report = ?storage.migration_report(),
                "schema migrations reported errors"
            );
        }

        let vectors = open_vector_store(
            Arc::clone(&storage),
            config.vector_db_path.as_deref(),
            config.embedding_dimensions,
        );

        let embedding = config.embedding_endpoint.as_ref().map(|endpoint| {
            EmbeddingClient::new(
                endpoint.clone(),
                config.embedding_model.clone(),
                config.embedding_dimensions,
            )
        });
        let llm = config
            .llm_endpoint
            .as_ref()
            .map(|endpoint| Arc::new(LlmClient::new(endpoint.clone())));

        let graph = EntityGraph::new(Arc::clone(&storage));
        let resolver = EntityResolver::new(graph.clone());
        let beliefs = BeliefStore::new(Arc::clone(&storage));
        let commitments = CommitmentTracker::new(Arc::clone(&storage));
        let goals = GoalTracker::new(commitments.clone());
        let style = StyleEngine::new(Arc::clone(&storage));
        let contexts = ContextManager::new(Arc::clone(&storage));
        let detector = ContextDetector::new(contexts.clone());
        let retrieval = RetrievalEngine::new(
            Arc::clone(&storage),
            Arc::clone(&vectors),
            embedding.clone(),
        );
        let assembler = ContextAssembler::new(Arc::clone(&storage));
        let ingestor = Ingestor::new(
            graph.clone(),
            resolver.clone(),
            commitments.clone(),
            config.user_email.clone(),
            config.user_phone.clone(),
        );
        let worker = Arc::new(BackgroundWorker::new(
            Arc::clone(&storage),
            Arc::clone(&vectors),
            embedding,
            WorkerConfig {
                interval: config.worker_interval(),
                batch_size: config.worker_batch_size,
                ..Default::default()
            },
        ));

        tracing::info!(db = %config.db_path.display(), "engine initialized");

        Ok(Self {
            config,
            storage,
            vectors,
            llm,
            graph,
            resolver,
            beliefs,
            commitments,
            goals,
            style,
            contexts,
            detector,
            retrieval,
            assembler,
            ingestor,
            worker,
        })
    }

    /// Stop the worker, flush the vector index and WAL, and drop every
    /// handle
    pub fn close(self) -> Result<()> {
        self.worker.stop();
        if let Err(e) = self.vectors.persist() {
            tracing::warn!("vector index flush failed on close: {e}");
        }
        self.storage.checkpoint()?;
        tracing::info!("engine closed");
        Ok(())
    }

    /// The configuration this engine was opened with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared storage handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Entity graph operations
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    /// Entity resolution pipeline
    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    /// Optional LLM client for resolution contexts
    pub fn llm(&self) -> Option<&LlmClient> {
        self.llm.as_deref()
    }

    /// Bi-temporal belief store
    pub fn beliefs(&self) -> &BeliefStore {
        &self.beliefs
    }

    /// Commitment tracker
    pub fn commitments(&self) -> &CommitmentTracker {
        &self.commitments
    }

    /// Goal hierarchy
    pub fn goals(&self) -> &GoalTracker {
        &self.goals
    }

    /// Style extraction and guarded adaptation
    pub fn style(&self) -> &StyleEngine {
        &self.style
    }

    /// Context boundaries and the leak guard
    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Active-context detection
    pub fn context_detector(&self) -> &ContextDetector {
        &self.detector
    }

    /// Hybrid retrieval
    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    /// Context assembler
    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    /// Batch ingestion
    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    /// Background worker (start/stop/status/manual trigger)
    pub fn worker(&self) -> &Arc<BackgroundWorker> {
        &self.worker
    }
}

// ============================================================================
// TESTS
// ============================================================================
