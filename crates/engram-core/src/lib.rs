//! # Engram Core
//!
//! Local-first personal knowledge engine. Ingests a user's communications
//! (email, chat, calendar, contacts) and maintains a queryable, evolving
//! model of their world:
//!
//! - **Entity resolution**: staged merge pipeline (exact attributes, fuzzy
//!   names with nickname tables, graph proximity, optional LLM tiebreak)
//!   producing a canonical person/org/place graph with provenance and
//!   reversible merges
//! - **Bi-temporal beliefs**: an assertion log tracking both when a fact was
//!   true and when the engine learned it, with supersession chains,
//!   contradiction detection, and auto/manual resolution
//! - **Hybrid retrieval**: FTS5/BM25, vector, and graph-walk searches fused
//!   with Reciprocal Rank Fusion and filtered by context visibility
//! - **Style & engagement**: extraction of how the user writes (globally and
//!   per recipient), engagement scoring of AI drafts, CUSUM change-point
//!   detection, and vent-mode freeze so emotional episodes never corrupt the
//!   model
//! - **Behavioral engine**: habit/sequence/routine/trigger mining over the
//!   event log, a 7x24 rhythm matrix, and verified predictions
//! - **Background worker**: one cooperative periodic loop keeping all
//!   derived state fresh
//!
//! Single-user, single-process, one SQLite file plus a vector index
//! directory. Scrapers, UI, and model serving live outside this crate; the
//! embedding and LLM endpoints are opaque HTTP services and strictly
//! optional.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{Engine, EngineConfig};
//!
//! let engine = Engine::init(EngineConfig::new("/path/to/engram.db"))?;
//!
//! // Ingest a batch of normalized messages
//! let report = engine.ingestor().ingest_messages(&batch).await?;
//!
//! // Ask questions
//! let hits = engine.retrieval().search("Jane's boss", &Default::default()).await?;
//!
//! // Time-travel over beliefs
//! let then = engine.beliefs().assertions_as_of(&entity_id, t, &Default::default())?;
//!
//! engine.close()?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod assemble;
pub mod behavior;
pub mod beliefs;
pub mod commitments;
pub mod config;
pub mod context;
pub mod engine;
pub mod external;
pub mod graph;
pub mod ingest;
pub mod matcher;
pub mod model;
pub mod resolver;
pub mod retrieval;
pub mod storage;
pub mod style;
pub mod vector;
pub mod worker;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Engine lifecycle
pub use config::EngineConfig;
pub use engine::Engine;

// Core records
pub use model::{db_now, db_time, Entity, EntityAttribute, EntityType, Event, GraphEdge, Message};

// Storage layer
pub use storage::{MigrationReport, Result, Storage, StorageError};

// Entity graph & resolution
pub use graph::EntityGraph;
pub use resolver::{
    merge_entities, EntityResolver, MatchType, Resolution, ResolutionContext, ResolveCandidate,
    ResolverThresholds,
};

// Beliefs
pub use beliefs::{
    AsOfOptions, Assertion, AssertionInput, AutoResolution, BeliefContradiction, BeliefStore,
    ContradictionType, ResolutionStatus,
};

// Commitments & goals
pub use commitments::{
    Commitment, CommitmentInput, CommitmentStatus, CommitmentTracker, CommitmentType, Goal,
    GoalStatus, GoalTracker, GoalType,
};

// Style & engagement
pub use style::{
    calculate_learning_rate, detect_vent_mode, AdaptationOutcome, AdaptationRequest,
    CusumDetector, EngagementScore, EngagementSignal, EthicalBounds, RecipientStyleProfile,
    StyleEngine, StyleProfile, StyleVector, VentSignals,
};

// Behavior
pub use behavior::{
    BehaviorPattern, PatternType, Prediction, PredictionContext, UpcomingEvent,
};

// Contexts
pub use context::{
    ActiveContext, ContextBoundary, ContextDetector, ContextManager, DetectionSignals,
    Sensitivity,
};

// Retrieval
pub use retrieval::{
    reciprocal_rank_fusion, ResultKind, RetrievalEngine, SearchHit, SearchOptions,
};

// Assembly
pub use assemble::{AssemblyQuery, ContextAssembler, ContextBundle};

// Ingestion
pub use ingest::{
    IncomingCalendarEvent, IncomingContact, IncomingMessage, IngestReport, Ingestor, ItemError,
    Participant, Recipient, RecipientKind,
};

// External endpoints
pub use external::{EmbeddingClient, ExternalError, LlmClient};

// Vector store
pub use vector::{cosine_similarity, VectorFilters, VectorHit, VectorStore, VectorStoreError};

// Worker
pub use worker::{BackgroundWorker, CycleResult, WorkerConfig, WorkerStatus};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AssemblyQuery, Assertion, AssertionInput, BeliefStore, Commitment, CommitmentTracker,
        Engine, EngineConfig, Entity, EntityGraph, EntityResolver, EntityType, IncomingMessage,
        IngestReport, Ingestor, Message, ResolveCandidate, Result, RetrievalEngine, SearchHit,
        SearchOptions, Storage, StorageError, StyleEngine, StyleProfile,
    };
}
